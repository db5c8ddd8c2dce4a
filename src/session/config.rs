use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bon::Builder;
use url::Url;

use crate::registry::CallRegistry;

/// Indicates that an endpoint address could not be used for a session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid endpoint '{address}': {reason}")]
pub struct InvalidEndpoint {
    pub address: String,
    pub reason: String,
}

/// A WebSocket endpoint address, restricted to the `ws` and `wss` schemes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint(Url);

impl Endpoint {
    pub fn parse(address: &str) -> Result<Self, InvalidEndpoint> {
        let invalid = |reason: String| InvalidEndpoint {
            address: address.to_string(),
            reason,
        };

        let url = Url::parse(address).map_err(|err| invalid(err.to_string()))?;
        match url.scheme() {
            "ws" | "wss" => Ok(Self(url)),
            other => Err(invalid(format!(
                "scheme must be 'ws' or 'wss', got '{other}'"
            ))),
        }
    }

    /// Whether the endpoint uses the TLS-secured `wss` scheme.
    pub fn is_secure(&self) -> bool {
        self.0.scheme() == "wss"
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn url(&self) -> &Url {
        &self.0
    }
}

impl FromStr for Endpoint {
    type Err = InvalidEndpoint;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Configuration for a [`Session`](super::Session), fixed once the session is constructed.
#[derive(Debug, Clone, Builder)]
pub struct SessionConfig {
    /// Address of the remote peer.
    pub endpoint: Endpoint,

    /// Declared invokables and events.
    #[builder(default)]
    pub registry: CallRegistry,

    /// Upper bound on transport creation plus handshake.
    #[builder(default = Duration::from_secs(30))]
    pub handshake_timeout: Duration,

    /// Discard a cached connection that reports itself closed and open a new one on the next
    /// call. When disabled, a closed connection keeps being handed out until
    /// [`Session::invalidate`](super::Session::invalidate) is called.
    #[builder(default = true)]
    pub reestablish_closed: bool,
}
