use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use uuid::Uuid;

mod namespace;
mod resource;

pub use namespace::{DatabaseName, InvalidNamespace, NamespaceString};
pub use resource::{ResourceId, ResourceType};

/// Identifies a single collection across renames.
///
/// A collection keeps its UUID for its whole life, so the UUID is the stable key in the catalog
/// while the namespace may change underneath it.
#[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash)]
pub struct CollectionUuid(Uuid);

impl CollectionUuid {
    /// The smallest possible UUID, used as the lower bound for per-database range scans
    pub const MIN: Self = Self(Uuid::nil());
    /// The largest possible UUID, used as the upper bound for per-database range scans
    pub const MAX: Self = Self(Uuid::from_u128(u128::MAX));

    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CollectionUuid {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for CollectionUuid {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<u128> for CollectionUuid {
    fn from(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }
}

impl Display for CollectionUuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The tenant owning a database in a multi-tenant deployment
#[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash)]
pub struct TenantId(u64);

impl TenantId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for TenantId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Commit timestamp handed to catalog visibility handlers
#[derive(
    Debug, Default, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash,
)]
pub struct Timestamp(u64);

static NEXT_TIMESTAMP: AtomicU64 = AtomicU64::new(1);

impl Timestamp {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Hand out the next timestamp from the process-wide clock
    pub fn next() -> Self {
        Self(
            NEXT_TIMESTAMP
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_add(1))
                .expect("Overflowed with timestamps"),
        )
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
