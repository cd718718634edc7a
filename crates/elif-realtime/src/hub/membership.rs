//! Group and user membership

use crate::connection::ConnectionId;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
struct Index {
    members: HashMap<String, HashSet<ConnectionId>>,
    keys: HashMap<ConnectionId, HashSet<String>>,
}

/// Key to connection-set index with a reverse lookup, so a connection can leave
/// every key in one step
#[derive(Debug, Default)]
pub struct MembershipIndex {
    inner: RwLock<Index>,
}

impl MembershipIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the connection was already a member
    pub fn add(&self, key: &str, connection_id: &ConnectionId) -> bool {
        let mut index = self.inner.write();
        let added = index
            .members
            .entry(key.to_string())
            .or_default()
            .insert(connection_id.clone());
        index
            .keys
            .entry(connection_id.clone())
            .or_default()
            .insert(key.to_string());
        added
    }

    /// Returns `false` when the connection was not a member
    pub fn remove(&self, key: &str, connection_id: &ConnectionId) -> bool {
        let mut index = self.inner.write();
        let removed = match index.members.get_mut(key) {
            Some(members) => {
                let removed = members.remove(connection_id);
                if members.is_empty() {
                    index.members.remove(key);
                }
                removed
            }
            None => false,
        };

        if let Some(keys) = index.keys.get_mut(connection_id) {
            keys.remove(key);
            if keys.is_empty() {
                index.keys.remove(connection_id);
            }
        }
        removed
    }

    /// Drop a connection from every key, returning the keys that are now empty
    pub fn remove_connection(&self, connection_id: &ConnectionId) -> Vec<String> {
        let mut index = self.inner.write();
        let Some(keys) = index.keys.remove(connection_id) else {
            return Vec::new();
        };

        let mut emptied = Vec::new();
        for key in keys {
            if let Some(members) = index.members.get_mut(&key) {
                members.remove(connection_id);
                if members.is_empty() {
                    index.members.remove(&key);
                    emptied.push(key);
                }
            }
        }
        emptied
    }

    pub fn members(&self, key: &str) -> Vec<ConnectionId> {
        self.inner
            .read()
            .members
            .get(key)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn keys_of(&self, connection_id: &ConnectionId) -> Vec<String> {
        self.inner
            .read()
            .keys
            .get(connection_id)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, key: &str, connection_id: &ConnectionId) -> bool {
        self.inner
            .read()
            .members
            .get(key)
            .map(|members| members.contains(connection_id))
            .unwrap_or(false)
    }

    pub fn has_members(&self, key: &str) -> bool {
        self.inner.read().members.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_is_idempotent() {
        let index = MembershipIndex::new();
        let id = ConnectionId::from("c1");

        assert!(index.add("room", &id));
        assert!(!index.add("room", &id));
        assert_eq!(index.members("room"), vec![id]);
    }

    #[test]
    fn test_remove_non_member_is_noop() {
        let index = MembershipIndex::new();
        assert!(!index.remove("room", &ConnectionId::from("c1")));
        assert!(!index.has_members("room"));
    }

    #[test]
    fn test_remove_connection_leaves_every_group() {
        let index = MembershipIndex::new();
        let leaving = ConnectionId::from("c1");
        let staying = ConnectionId::from("c2");
        index.add("a", &leaving);
        index.add("b", &leaving);
        index.add("b", &staying);

        let mut emptied = index.remove_connection(&leaving);
        emptied.sort();

        assert_eq!(emptied, vec!["a".to_string()]);
        assert!(!index.contains("b", &leaving));
        assert!(index.contains("b", &staying));
        assert!(index.keys_of(&leaving).is_empty());
    }
}
