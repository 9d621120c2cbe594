//! Volatile memory store backing the `memory.*` methods.
//!
//! Keyed JSON values with tags. Persistence is out of scope; this is the
//! daemon-lifetime working set agents query between prompts.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// One stored entry.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryEntry {
    pub key: String,
    pub value: Value,
    pub tags: Vec<String>,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// In-memory keyed store.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, MemoryEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value; a missing key gets a generated one. Returns the key.
    pub fn store(
        &self,
        key: Option<String>,
        value: Value,
        tags: Vec<String>,
        owner: &str,
    ) -> String {
        let key = key.unwrap_or_else(|| format!("mem-{}", Uuid::new_v4().simple()));
        let now = Utc::now();
        self.entries
            .entry(key.clone())
            .and_modify(|entry| {
                entry.value = value.clone();
                entry.tags = tags.clone();
                entry.updated_at = now;
            })
            .or_insert_with(|| MemoryEntry {
                key: key.clone(),
                value,
                tags,
                owner: owner.to_string(),
                created_at: now,
                updated_at: now,
            });
        key
    }

    /// Query by key prefix and/or tag; both filters are conjunctive.
    pub fn query(&self, prefix: Option<&str>, tag: Option<&str>, limit: usize) -> Vec<MemoryEntry> {
        let mut matches: Vec<MemoryEntry> = self
            .entries
            .iter()
            .filter(|entry| prefix.map_or(true, |p| entry.key.starts_with(p)))
            .filter(|entry| tag.map_or(true, |t| entry.tags.iter().any(|have| have == t)))
            .map(|entry| entry.clone())
            .collect();
        matches.sort_by(|a, b| a.key.cmp(&b.key));
        matches.truncate(limit);
        matches
    }

    pub fn get(&self, key: &str) -> Option<MemoryEntry> {
        self.entries.get(key).map(|entry| entry.clone())
    }

    /// Delete an entry; true when it existed.
    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_get_delete() {
        let store = MemoryStore::new();
        let key = store.store(
            Some("notes/plan".into()),
            serde_json::json!({"step": 1}),
            vec!["planning".into()],
            "alice",
        );
        assert_eq!(key, "notes/plan");
        assert_eq!(store.get(&key).unwrap().value["step"], 1);

        assert!(store.delete(&key));
        assert!(!store.delete(&key));
        assert!(store.get(&key).is_none());
    }

    #[test]
    fn generated_keys_are_unique() {
        let store = MemoryStore::new();
        let a = store.store(None, serde_json::json!(1), vec![], "alice");
        let b = store.store(None, serde_json::json!(2), vec![], "alice");
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn update_keeps_created_at() {
        let store = MemoryStore::new();
        store.store(Some("k".into()), serde_json::json!(1), vec![], "alice");
        let created = store.get("k").unwrap().created_at;
        store.store(Some("k".into()), serde_json::json!(2), vec!["new".into()], "alice");

        let entry = store.get("k").unwrap();
        assert_eq!(entry.value, serde_json::json!(2));
        assert_eq!(entry.tags, vec!["new"]);
        assert_eq!(entry.created_at, created);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn query_filters_conjunctively() {
        let store = MemoryStore::new();
        store.store(Some("notes/a".into()), serde_json::json!(1), vec!["x".into()], "alice");
        store.store(Some("notes/b".into()), serde_json::json!(2), vec!["y".into()], "alice");
        store.store(Some("todo/c".into()), serde_json::json!(3), vec!["x".into()], "alice");

        assert_eq!(store.query(Some("notes/"), None, 100).len(), 2);
        assert_eq!(store.query(None, Some("x"), 100).len(), 2);
        assert_eq!(store.query(Some("notes/"), Some("x"), 100).len(), 1);
        assert_eq!(store.query(None, None, 2).len(), 2);
    }
}
