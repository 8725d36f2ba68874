use doccat_id::ResourceId;
use hashbrown::HashMap;
use std::collections::BTreeSet;

/// Maps lock resource ids back to the names that produced them.
///
/// Resource ids are hashes, so more than one name can share an id. The index keeps every name
/// for an id and only answers a reverse lookup when the answer is unambiguous.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceIndex {
    map: HashMap<ResourceId, BTreeSet<String>>,
}

impl ResourceIndex {
    pub fn add_resource(&mut self, rid: ResourceId, name: impl Into<String>) {
        self.map.entry(rid).or_default().insert(name.into());
    }

    pub fn remove_resource(&mut self, rid: ResourceId, name: &str) {
        let Some(names) = self.map.get_mut(&rid) else {
            return;
        };
        names.remove(name);
        if names.is_empty() {
            self.map.remove(&rid);
        }
    }

    /// The single name mapped to `rid`, or `None` if there is no name or more than one
    pub fn lookup_resource_name(&self, rid: ResourceId) -> Option<&str> {
        let names = self.map.get(&rid)?;
        if names.len() > 1 {
            return None;
        }
        names.first().map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use doccat_id::ResourceType;

    #[test]
    fn ambiguous_ids_have_no_name() {
        let rid = ResourceId::from_raw(ResourceType::Collection, 7);
        let mut index = ResourceIndex::default();
        assert_eq!(index.lookup_resource_name(rid), None);

        index.add_resource(rid, "db.a");
        assert_eq!(index.lookup_resource_name(rid), Some("db.a"));

        index.add_resource(rid, "db.b");
        assert_eq!(index.lookup_resource_name(rid), None);

        index.remove_resource(rid, "db.a");
        assert_eq!(index.lookup_resource_name(rid), Some("db.b"));

        index.remove_resource(rid, "db.b");
        assert!(index.is_empty());
    }

    #[test]
    fn add_is_idempotent() {
        let rid = ResourceId::new(ResourceType::Database, "db");
        let mut index = ResourceIndex::default();
        index.add_resource(rid, "db");
        index.add_resource(rid, "db");
        index.remove_resource(rid, "db");
        assert_eq!(index.lookup_resource_name(rid), None);
        assert_eq!(index.len(), 0);
    }
}
