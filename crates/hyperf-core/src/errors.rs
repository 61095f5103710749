//! Field-keyed error mapping returned to callers in acknowledgments.

use std::fmt;

use serde::ser::{Serialize, SerializeMap, Serializer};

/// Synthetic key for dispatch failures that are not tied to a payload field.
pub const EVENT_KEY: &str = "_event";
/// Synthetic key for domain preconditions on session state.
pub const SESSION_KEY: &str = "_session";
/// Synthetic key for payloads that cannot be read as an object at all.
pub const PAYLOAD_KEY: &str = "_payload";
/// Synthetic key for server-side faults while building a response.
pub const INTERNAL_KEY: &str = "_internal";

/// Ordered mapping of field name to violation messages.
///
/// Keys keep first-insertion order so a schema's field order is preserved
/// on the wire. Messages for a field keep the order they were pushed in.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldErrors {
    entries: Vec<(String, Vec<String>)>,
}

impl FieldErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mapping with exactly one field and one message.
    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.push(field, message);
        errors
    }

    /// Append a message to `field`, creating the entry on first use.
    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        let field = field.into();
        let message = message.into();
        match self.entries.iter_mut().find(|(name, _)| *name == field) {
            Some((_, messages)) => messages.push(message),
            None => self.entries.push((field, vec![message])),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of fields with at least one message.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, messages)| messages.as_slice())
    }

    pub fn contains(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(name, messages)| (name.as_str(), messages.as_slice()))
    }
}

impl Serialize for FieldErrors {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (field, messages) in &self.entries {
            map.serialize_entry(field, messages)?;
        }
        map.end()
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, messages) in &self.entries {
            if !first {
                f.write_str("; ")?;
            }
            first = false;
            write!(f, "{field}: {}", messages.join(", "))?;
        }
        Ok(())
    }
}
