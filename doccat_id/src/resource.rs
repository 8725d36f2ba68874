use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;

/// The kind of lockable resource a [`ResourceId`] refers to
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    Database,
    Collection,
}

impl ResourceType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Database => "Database",
            Self::Collection => "Collection",
        }
    }
}

/// Opaque lock resource key.
///
/// The id is a hash of the resource type and its name, so two distinct names may map to the
/// same id. Consumers that need the name back must go through a resource index that tracks
/// every name currently hashing to a given id.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    kind: ResourceType,
    hash: u64,
}

impl ResourceId {
    pub fn new(kind: ResourceType, name: &str) -> Self {
        let seed = kind as u64;
        Self {
            kind,
            hash: twox_hash::XxHash64::oneshot(seed, name.as_bytes()),
        }
    }

    /// Build an id from a precomputed hash, mostly useful for forcing collisions in tests
    pub fn from_raw(kind: ResourceType, hash: u64) -> Self {
        Self { kind, hash }
    }

    pub fn kind(&self) -> ResourceType {
        self.kind
    }

    pub fn hash_value(&self) -> u64 {
        self.hash
    }
}

impl Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{{}: {:#018x}}}", self.kind.as_str(), self.hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_is_part_of_the_key() {
        let db = ResourceId::new(ResourceType::Database, "shop");
        let coll = ResourceId::new(ResourceType::Collection, "shop");
        assert_ne!(db, coll);
        assert_eq!(db, ResourceId::new(ResourceType::Database, "shop"));
    }
}
