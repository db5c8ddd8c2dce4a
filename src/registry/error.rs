use super::CallKind;

/// Indicates that a lookup failed because no call of that kind is registered under the name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no {kind} named '{name}' is registered")]
pub struct UnknownName {
    pub kind: CallKind,
    pub name: String,
}

/// Indicates that building a registry failed because a name was declared twice for one kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("the {kind} '{name}' is already registered")]
pub struct DuplicateName {
    pub kind: CallKind,
    pub name: &'static str,
}

/// Indicates that a name is registered with different types than the caller declared.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("the {kind} '{name}' is registered as `{registered}`, not `{declared}`")]
pub struct SchemaMismatch {
    pub kind: CallKind,
    pub name: &'static str,
    pub registered: &'static str,
    pub declared: &'static str,
}
