use std::fmt;
use std::sync::Arc;

use serde::Serialize;

/// Deterministic identity of a call, for caches that deduplicate work on top of a session.
///
/// Two calls with the same name and arguments always produce equal keys; `args` holds the
/// canonical JSON encoding, where object keys are sorted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheKey {
    Invoke { name: Arc<str>, args: Arc<str> },
    Mutation { name: Arc<str> },
    Subscription { name: Arc<str> },
}

impl CacheKey {
    pub fn name(&self) -> &str {
        match self {
            CacheKey::Invoke { name, .. }
            | CacheKey::Mutation { name }
            | CacheKey::Subscription { name } => name,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Invoke { name, args } => write!(f, "invoke:{name}:{args}"),
            CacheKey::Mutation { name } => write!(f, "mutation:{name}"),
            CacheKey::Subscription { name } => write!(f, "subscription:{name}"),
        }
    }
}
