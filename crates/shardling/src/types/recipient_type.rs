use serde::{Deserialize, Serialize};
use std::fmt;

/// How messages for a recipient type are routed.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum RecipientKind {
    /// Routed to exactly one pod, chosen by the shard function.
    Entity,
    /// Fanned out to every pod currently holding any shard.
    Topic,
}

/// A named recipient type, e.g. an entity type ("User") or a topic ("events").
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RecipientType {
    pub name: String,
    pub kind: RecipientKind,
}

impl RecipientType {
    pub fn entity(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: RecipientKind::Entity,
        }
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: RecipientKind::Topic,
        }
    }
}

impl fmt::Display for RecipientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl AsRef<str> for RecipientType {
    fn as_ref(&self) -> &str {
        &self.name
    }
}
