use serde_json::Value;
use std::collections::hash_map;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Key/value map visible to every hook invoked for one traced process
///
/// Values are opaque to the tracer; hooks store whatever the bridge can marshal.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PersistenceStore {
    values: HashMap<String, Value>,
}

impl PersistenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set<K: Into<String>, V: Into<Value>>(&mut self, key: K, value: V) {
        self.values.insert(key.into(), value.into());
    }

    /// Removes `key`, returning its previous value
    pub fn clear(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> hash_map::Iter<'_, String, Value> {
        self.values.iter()
    }
}

/// Store shared by every process of one tracer run
#[derive(Debug, Default, Clone)]
pub struct GlobalStore(Arc<Mutex<PersistenceStore>>);

impl GlobalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    pub fn set<K: Into<String>, V: Into<Value>>(&self, key: K, value: V) {
        self.lock().set(key, value);
    }

    pub fn clear(&self, key: &str) -> Option<Value> {
        self.lock().clear(key)
    }

    pub fn snapshot(&self) -> PersistenceStore {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, PersistenceStore> {
        // A hook that panicked while holding the lock leaves the map itself intact
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_get_clear() {
        let mut store = PersistenceStore::new();
        assert!(store.get("savedStr").is_none());

        store.set("savedStr", "GET / HTTP/1.1");
        assert_eq!(store.get("savedStr"), Some(&json!("GET / HTTP/1.1")));
        assert!(store.contains("savedStr"));

        store.set("savedStr", json!({"n": 2}));
        assert_eq!(store.len(), 1);

        assert_eq!(store.clear("savedStr"), Some(json!({"n": 2})));
        assert!(store.is_empty());
        assert_eq!(store.clear("savedStr"), None);
    }

    #[test]
    fn global_store_is_shared_between_clones() {
        let a = GlobalStore::new();
        let b = a.clone();
        a.set("count", 3);
        assert_eq!(b.get("count"), Some(json!(3)));
        b.clear("count");
        assert!(a.snapshot().is_empty());
    }
}
