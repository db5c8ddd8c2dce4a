use std::sync::Arc;

use thiserror::Error;

use crate::registry::ValidationError;
use crate::registry::error::{SchemaMismatch, UnknownName};
use crate::transport::TransportError;

/// Errors returned to callers of a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The call or event name is not part of the registry.
    #[error(transparent)]
    UnknownName(#[from] UnknownName),

    /// The name is registered with different types than the caller declared.
    #[error(transparent)]
    SchemaMismatch(#[from] SchemaMismatch),

    /// An argument or payload did not match its declared shape.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Opening the shared connection failed.
    ///
    /// Every caller waiting on the same attempt receives the same cause.
    #[error("failed to establish connection")]
    ConnectionEstablishment(#[source] Arc<TransportError>),

    /// An individual call or subscription failed on an established connection.
    #[error("transport error")]
    Transport(#[from] TransportError),
}
