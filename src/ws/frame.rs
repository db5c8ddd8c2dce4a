use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::registry::CallManifest;

/// Frames sent from the session to the remote peer.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame<'a> {
    /// Opens the session and announces the contract.
    Hello { contract: Vec<CallManifest> },
    Invoke {
        id: u64,
        name: &'a str,
        args: Value,
    },
}

/// Frames sent from the remote peer to the session.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// The handshake was accepted.
    Ready,
    Rejected {
        reason: String,
    },
    Response {
        id: u64,
        #[serde(default)]
        result: Value,
    },
    Failure {
        id: u64,
        message: String,
    },
    Event {
        name: String,
        payload: Value,
    },
}
