use crate::TenantId;
use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;
use std::sync::Arc;

const SYSTEM_PREFIX: &str = "system.";
const SYSTEM_VIEWS: &str = "system.views";
const BUCKETS_PREFIX: &str = "system.buckets.";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidNamespace {
    #[error("namespace '{0}' has no collection component")]
    MissingCollection(String),

    #[error("database name '{0}' is invalid")]
    InvalidDatabase(String),

    #[error("collection name '{0}' is invalid")]
    InvalidCollection(String),
}

/// A database name, optionally scoped to a tenant.
///
/// Ordering is by tenant then name, which is what the ordered per-database collection index
/// relies on for its range scans.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct DatabaseName {
    tenant: Option<TenantId>,
    name: Arc<str>,
}

impl DatabaseName {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            tenant: None,
            name: name.into(),
        }
    }

    pub fn with_tenant(tenant: TenantId, name: impl Into<Arc<str>>) -> Self {
        Self {
            tenant: Some(tenant),
            name: name.into(),
        }
    }

    pub fn tenant(&self) -> Option<TenantId> {
        self.tenant
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `admin`, `local` and `config` hold server metadata rather than user data
    pub fn is_internal(&self) -> bool {
        matches!(self.name(), "admin" | "local" | "config")
    }

    pub fn is_valid(&self) -> bool {
        !self.name.is_empty()
            && self.name.len() < 64
            && !self
                .name
                .chars()
                .any(|c| matches!(c, '/' | '\\' | '.' | ' ' | '"' | '$' | '\0'))
    }
}

impl Display for DatabaseName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.tenant {
            Some(tenant) => write!(f, "{tenant}_{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl From<&str> for DatabaseName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Fully qualified `db.collection` name
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct NamespaceString {
    db: DatabaseName,
    coll: Arc<str>,
}

impl NamespaceString {
    pub fn new(db: DatabaseName, coll: impl Into<Arc<str>>) -> Self {
        Self {
            db,
            coll: coll.into(),
        }
    }

    /// Split `db.coll` at the first dot. The collection part may itself contain dots.
    pub fn parse(tenant: Option<TenantId>, ns: &str) -> Result<Self, InvalidNamespace> {
        let (db, coll) = ns
            .split_once('.')
            .ok_or_else(|| InvalidNamespace::MissingCollection(ns.to_string()))?;
        let db = match tenant {
            Some(t) => DatabaseName::with_tenant(t, db),
            None => DatabaseName::new(db),
        };
        if !db.is_valid() {
            return Err(InvalidNamespace::InvalidDatabase(db.to_string()));
        }
        if !Self::valid_collection_name(coll) {
            return Err(InvalidNamespace::InvalidCollection(coll.to_string()));
        }
        Ok(Self::new(db, coll))
    }

    /// The `<db>.system.views` namespace holding durable view definitions
    pub fn system_views(db: &DatabaseName) -> Self {
        Self::new(db.clone(), SYSTEM_VIEWS)
    }

    pub fn db(&self) -> &DatabaseName {
        &self.db
    }

    pub fn coll(&self) -> &str {
        &self.coll
    }

    /// The `db.coll` string without the tenant prefix
    pub fn ns(&self) -> String {
        format!("{}.{}", self.db.name(), self.coll)
    }

    pub fn valid_collection_name(coll: &str) -> bool {
        !coll.is_empty() && !coll.starts_with('.') && !coll.contains('$') && !coll.contains('\0')
    }

    pub fn is_valid(&self) -> bool {
        self.db.is_valid() && Self::valid_collection_name(&self.coll)
    }

    pub fn is_on_internal_db(&self) -> bool {
        self.db.is_internal()
    }

    pub fn is_system(&self) -> bool {
        self.coll.starts_with(SYSTEM_PREFIX)
    }

    pub fn is_system_dot_views(&self) -> bool {
        &*self.coll == SYSTEM_VIEWS
    }

    pub fn is_timeseries_buckets(&self) -> bool {
        self.coll.starts_with(BUCKETS_PREFIX)
    }

    /// The replication oplog, `local.oplog.rs`
    pub fn is_oplog(&self) -> bool {
        self.db.tenant().is_none() && self.db.name() == "local" && &*self.coll == "oplog.rs"
    }
}

impl Display for NamespaceString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}
