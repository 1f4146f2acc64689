//! Process-wide status table.
//!
//! Every component gets a [`StatusHandle`] for its own key and writes free
//! text into it ("Idle", "Sending foo.json", "Crashed", ...). Readers take a
//! merged snapshot of any set of keys. Reads and writes hold the lock only
//! for the copy, so querying status never waits on a component's main loop.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

pub type StatusMap = HashMap<String, String>;

#[derive(Debug, Clone, Default)]
pub struct StatusTable {
    inner: Arc<RwLock<BTreeMap<String, String>>>,
}

impl StatusTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write handle for `key`. The key is registered with an empty value.
    pub fn handle(&self, key: impl Into<String>) -> StatusHandle {
        let key = key.into();
        self.write().entry(key.clone()).or_default();
        StatusHandle {
            key,
            table: self.clone(),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.read().get(key).cloned()
    }

    /// Snapshot of the given keys. Unknown keys are skipped.
    pub fn merge<S: AsRef<str>>(&self, keys: &[S]) -> StatusMap {
        let table = self.read();
        keys.iter()
            .filter_map(|k| {
                table
                    .get(k.as_ref())
                    .map(|v| (k.as_ref().to_string(), v.clone()))
            })
            .collect()
    }

    /// Snapshot of every key.
    pub fn snapshot(&self) -> StatusMap {
        self.read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn update(&self, key: &str, value: String) {
        self.write().insert(key.to_string(), value);
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, String>> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, String>> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Write access to a single key of a [`StatusTable`].
#[derive(Debug, Clone)]
pub struct StatusHandle {
    key: String,
    table: StatusTable,
}

impl StatusHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn update(&self, value: impl Into<String>) {
        self.table.update(&self.key, value.into());
    }

    pub fn get(&self) -> String {
        self.table.get(&self.key).unwrap_or_default()
    }

    /// This key as a one-entry map.
    pub fn map(&self) -> StatusMap {
        self.table.merge(&[self.key.as_str()])
    }

    pub fn table(&self) -> &StatusTable {
        &self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_write_their_own_key() {
        let table = StatusTable::new();
        let sender = table.handle("data-sender");
        let agg = table.handle("mm-aggregator");

        sender.update("Idle");
        agg.update("Aggregating");

        assert_eq!(sender.get(), "Idle");
        assert_eq!(table.get("mm-aggregator").as_deref(), Some("Aggregating"));

        let merged = table.merge(&["data-sender", "missing"]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged["data-sender"], "Idle");

        assert_eq!(table.snapshot().len(), 2);
    }

    #[test]
    fn test_new_handle_starts_empty() {
        let table = StatusTable::new();
        let handle = table.handle("x");
        assert_eq!(handle.get(), "");
        assert_eq!(handle.map().get("x").map(String::as_str), Some(""));
    }

    #[test]
    fn test_concurrent_writers_and_readers() {
        let table = StatusTable::new();
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let handle = table.handle(format!("svc-{i}"));
                let reader = table.clone();
                std::thread::spawn(move || {
                    for n in 0..100 {
                        handle.update(format!("step {n}"));
                        let _ = reader.snapshot();
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }

        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 8);
        assert!(snapshot.values().all(|v| v == "step 99"));
    }
}
