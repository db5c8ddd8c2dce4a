use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

/// Identifies one handler registration on a connection.
#[derive(Clone, Hash, PartialEq, Eq)]
pub struct SubscriptionId(Arc<Uuid>);

impl SubscriptionId {
    pub fn generate() -> Self {
        Self(Arc::new(Uuid::new_v4()))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
