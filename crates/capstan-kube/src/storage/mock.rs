//! In-memory release storage for testing

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::ReleaseStorage;
use crate::error::{KubeError, Result};
use crate::release::ReleaseRecord;

/// In-memory storage driver, cheap to clone and share across tasks
#[derive(Clone)]
pub struct MockReleaseStorage {
    /// (namespace, name) -> revision -> record
    store: Arc<RwLock<HashMap<(String, String), BTreeMap<u32, ReleaseRecord>>>>,
    operations: Arc<RwLock<OperationCounts>>,
}

/// Counts of operations performed, for testing assertions
#[derive(Debug, Default, Clone)]
pub struct OperationCounts {
    pub gets: usize,
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
}

impl MockReleaseStorage {
    pub fn new() -> Self {
        Self {
            store: Arc::new(RwLock::new(HashMap::new())),
            operations: Arc::new(RwLock::new(OperationCounts::default())),
        }
    }

    /// Create with pre-populated records
    pub fn with_records(records: Vec<ReleaseRecord>) -> Self {
        let storage = Self::new();
        {
            let mut store = storage.store.write().unwrap();
            for record in records {
                store
                    .entry((record.namespace.clone(), record.name.clone()))
                    .or_default()
                    .insert(record.revision, record);
            }
        }
        storage
    }

    /// Operation counts for assertions
    pub fn operation_counts(&self) -> OperationCounts {
        self.operations.read().unwrap().clone()
    }

    /// Total record count across all releases
    pub fn record_count(&self) -> usize {
        self.store.read().unwrap().values().map(|revs| revs.len()).sum()
    }

    fn count(&self, bump: impl FnOnce(&mut OperationCounts)) {
        bump(&mut self.operations.write().unwrap());
    }
}

impl Default for MockReleaseStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReleaseStorage for MockReleaseStorage {
    async fn get(&self, namespace: &str, name: &str, revision: u32) -> Result<ReleaseRecord> {
        self.count(|ops| ops.gets += 1);

        self.store
            .read()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .and_then(|revisions| revisions.get(&revision))
            .cloned()
            .ok_or_else(|| KubeError::ReleaseNotFound {
                name: name.to_string(),
                namespace: namespace.to_string(),
            })
    }

    async fn latest(&self, namespace: &str, name: &str) -> Result<Option<ReleaseRecord>> {
        self.count(|ops| ops.gets += 1);

        Ok(self
            .store
            .read()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .and_then(|revisions| revisions.values().next_back())
            .cloned())
    }

    async fn history(&self, namespace: &str, name: &str) -> Result<Vec<ReleaseRecord>> {
        self.count(|ops| ops.gets += 1);

        Ok(self
            .store
            .read()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .map(|revisions| revisions.values().rev().cloned().collect())
            .unwrap_or_default())
    }

    async fn create(&self, record: &ReleaseRecord) -> Result<()> {
        self.count(|ops| ops.creates += 1);

        let mut store = self.store.write().unwrap();
        let revisions = store
            .entry((record.namespace.clone(), record.name.clone()))
            .or_default();
        if revisions.contains_key(&record.revision) {
            return Err(KubeError::Storage(format!(
                "release record {} already exists",
                record.storage_key()
            )));
        }
        revisions.insert(record.revision, record.clone());
        Ok(())
    }

    async fn update(&self, record: &ReleaseRecord) -> Result<()> {
        self.count(|ops| ops.updates += 1);

        let mut store = self.store.write().unwrap();
        let revisions = store
            .entry((record.namespace.clone(), record.name.clone()))
            .or_default();
        if !revisions.contains_key(&record.revision) {
            return Err(KubeError::Storage(format!(
                "release record {} does not exist",
                record.storage_key()
            )));
        }
        revisions.insert(record.revision, record.clone());
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str, revision: u32) -> Result<()> {
        self.count(|ops| ops.deletes += 1);

        if let Some(revisions) = self
            .store
            .write()
            .unwrap()
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            revisions.remove(&revision);
        }
        Ok(())
    }
}
