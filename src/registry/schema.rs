use std::any::TypeId;
use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Indicates that a value did not conform to the declared shape of a call or event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("value does not match `{type_name}`: {message}")]
pub struct ValidationError {
    pub type_name: &'static str,
    pub message: String,
}

impl ValidationError {
    pub(crate) fn new(type_name: &'static str, message: impl fmt::Display) -> Self {
        Self {
            type_name,
            message: message.to_string(),
        }
    }

    /// Decode an already validated `value` into `T`, reporting failures against `T`.
    pub(crate) fn decode<T: DeserializeOwned>(value: Value) -> Result<T, ValidationError> {
        serde_json::from_value(value)
            .map_err(|err| ValidationError::new(std::any::type_name::<T>(), err))
    }

    /// Encode `value` into its JSON form, reporting failures against `T`.
    pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Value, ValidationError> {
        serde_json::to_value(value)
            .map_err(|err| ValidationError::new(std::any::type_name::<T>(), err))
    }
}

/// A type-erased validator for one declared Rust type.
///
/// The declared type is the schema: validating means deserializing the raw value into it and
/// serializing it back, which yields the coerced form (e.g. defaults filled in, unknown fields
/// dropped when the type does so).
///
/// Two schemas are the same when they were built for the same type.
#[derive(Clone, Copy)]
pub struct Schema {
    type_id: TypeId,
    type_name: &'static str,
    validate: fn(&Value) -> Result<Value, ValidationError>,
}

impl Schema {
    /// Construct the schema for `T`.
    pub fn of<T>() -> Self
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            validate: validate_as::<T>,
        }
    }

    /// The schema of an absent value, used for the arguments of events.
    pub fn unit() -> Self {
        Self::of::<()>()
    }

    /// The Rust type this schema validates against.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Validate `value`, returning the coerced value on success.
    pub fn validate(&self, value: &Value) -> Result<Value, ValidationError> {
        (self.validate)(value)
    }

    /// Whether both schemas were built for the same type.
    pub fn same_as(&self, other: &Schema) -> bool {
        self.type_id == other.type_id
    }

    /// Whether this schema was built for `T`.
    pub fn is<T: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Schema").field(&self.type_name).finish()
    }
}

fn validate_as<T>(value: &Value) -> Result<Value, ValidationError>
where
    T: Serialize + DeserializeOwned,
{
    let type_name = std::any::type_name::<T>();
    let typed = T::deserialize(value).map_err(|err| ValidationError::new(type_name, err))?;
    serde_json::to_value(typed).map_err(|err| ValidationError::new(type_name, err))
}
