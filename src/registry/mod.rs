use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;

use self::error::{DuplicateName, SchemaMismatch, UnknownName};
use crate::error::SessionError;
pub use self::schema::{Schema, ValidationError};

pub mod error;
pub mod schema;

/// A named request/response call together with its argument and return shapes.
///
/// Implement this on a marker type to declare a remote procedure:
///
/// ```ignore
/// struct Echo;
///
/// impl Invokable for Echo {
///     const NAME: &'static str = "echo";
///     type Args = String;
///     type Returns = u64;
/// }
/// ```
pub trait Invokable: 'static {
    /// The over-the-wire name of the call.
    const NAME: &'static str;

    type Args: Serialize + DeserializeOwned + Send + 'static;
    type Returns: Serialize + DeserializeOwned + Send + 'static;
}

/// A named stream of unsolicited messages pushed by the remote peer.
pub trait Event: 'static {
    /// The over-the-wire name of the event.
    const NAME: &'static str;

    type Payload: Serialize + DeserializeOwned + Send + 'static;
}

/// Which of the two disjoint registries a name belongs to.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Invokable,
    Event,
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallKind::Invokable => f.write_str("invokable"),
            CallKind::Event => f.write_str("event"),
        }
    }
}

/// The shapes registered for one name.
///
/// For events `args` is the [unit](Schema::unit) schema and `output` validates the payload.
#[derive(Debug, Clone, Copy)]
pub struct CallSchema {
    pub args: Schema,
    pub output: Schema,
}

/// One entry of the contract exchanged with the remote peer during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallManifest {
    pub kind: CallKind,
    pub name: &'static str,
    pub args: &'static str,
    pub output: &'static str,
}

/// The static mapping from call and event names to their shapes.
///
/// Built once through [`CallRegistry::builder`] and immutable afterwards.
#[derive(Debug, Clone, Default)]
pub struct CallRegistry {
    invokables: HashMap<&'static str, CallSchema, ahash::RandomState>,
    events: HashMap<&'static str, CallSchema, ahash::RandomState>,
}

impl CallRegistry {
    /// Start declaring a registry.
    pub fn builder() -> CallRegistryBuilder {
        CallRegistryBuilder::default()
    }

    /// Look up the shapes registered for `name` in the registry for `kind`.
    pub fn lookup(&self, kind: CallKind, name: &str) -> Result<&CallSchema, UnknownName> {
        self.table(kind).get(name).ok_or_else(|| UnknownName {
            kind,
            name: name.to_string(),
        })
    }

    pub fn invokable(&self, name: &str) -> Result<&CallSchema, UnknownName> {
        self.lookup(CallKind::Invokable, name)
    }

    pub fn event(&self, name: &str) -> Result<&CallSchema, UnknownName> {
        self.lookup(CallKind::Event, name)
    }

    /// Look up the invokable `I` and check that it was registered with `I`'s types.
    pub fn invokable_of<I: Invokable>(&self) -> Result<&CallSchema, SessionError> {
        let schema = self.invokable(I::NAME)?;
        check::<I::Args>(CallKind::Invokable, I::NAME, &schema.args)?;
        check::<I::Returns>(CallKind::Invokable, I::NAME, &schema.output)?;
        Ok(schema)
    }

    /// Look up the event `E` and check that it was registered with `E`'s payload type.
    pub fn event_of<E: Event>(&self) -> Result<&CallSchema, SessionError> {
        let schema = self.event(E::NAME)?;
        check::<E::Payload>(CallKind::Event, E::NAME, &schema.output)?;
        Ok(schema)
    }

    pub fn contains(&self, kind: CallKind, name: &str) -> bool {
        self.table(kind).contains_key(name)
    }

    /// Total number of registered invokables and events.
    pub fn len(&self) -> usize {
        self.invokables.len() + self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.invokables.is_empty() && self.events.is_empty()
    }

    /// Describe the full contract, ordered by kind then name.
    pub fn manifest(&self) -> Vec<CallManifest> {
        let mut manifest: Vec<CallManifest> = [CallKind::Invokable, CallKind::Event]
            .into_iter()
            .flat_map(|kind| {
                self.table(kind)
                    .iter()
                    .map(move |(name, schema)| CallManifest {
                        kind,
                        name: *name,
                        args: schema.args.type_name(),
                        output: schema.output.type_name(),
                    })
            })
            .collect();

        manifest.sort_by(|a, b| (a.kind, a.name).cmp(&(b.kind, b.name)));
        manifest
    }

    fn table(&self, kind: CallKind) -> &HashMap<&'static str, CallSchema, ahash::RandomState> {
        match kind {
            CallKind::Invokable => &self.invokables,
            CallKind::Event => &self.events,
        }
    }
}

fn check<T: 'static>(
    kind: CallKind,
    name: &'static str,
    schema: &Schema,
) -> Result<(), SchemaMismatch> {
    if schema.is::<T>() {
        return Ok(());
    }

    Err(SchemaMismatch {
        kind,
        name,
        registered: schema.type_name(),
        declared: std::any::type_name::<T>(),
    })
}

/// Collects declarations for a [`CallRegistry`].
///
/// A repeated name within one kind is remembered and reported by [`build`](Self::build).
#[derive(Debug, Default)]
#[must_use]
pub struct CallRegistryBuilder {
    registry: CallRegistry,
    duplicate: Option<DuplicateName>,
}

impl CallRegistryBuilder {
    /// Declare the invokable `I`.
    pub fn invokable<I: Invokable>(self) -> Self {
        let schema = CallSchema {
            args: Schema::of::<I::Args>(),
            output: Schema::of::<I::Returns>(),
        };
        self.insert(CallKind::Invokable, I::NAME, schema)
    }

    /// Declare the event `E`.
    pub fn event<E: Event>(self) -> Self {
        let schema = CallSchema {
            args: Schema::unit(),
            output: Schema::of::<E::Payload>(),
        };
        self.insert(CallKind::Event, E::NAME, schema)
    }

    pub fn build(self) -> Result<CallRegistry, DuplicateName> {
        match self.duplicate {
            Some(duplicate) => Err(duplicate),
            None => Ok(self.registry),
        }
    }

    fn insert(mut self, kind: CallKind, name: &'static str, schema: CallSchema) -> Self {
        let table = match kind {
            CallKind::Invokable => &mut self.registry.invokables,
            CallKind::Event => &mut self.registry.events,
        };

        match table.entry(name) {
            Entry::Occupied(_) => {
                self.duplicate.get_or_insert(DuplicateName { kind, name });
            }
            Entry::Vacant(slot) => {
                slot.insert(schema);
            }
        }

        self
    }
}
