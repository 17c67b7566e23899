use std::{collections::HashMap, sync::Arc, time::SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use crate::store::Storage;

/// Storage held in process memory. Clones share the same contents, so a
/// test can keep a handle and inspect or sabotage what the manager sees.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    entries: HashMap<String, Vec<u8>>,
    modified: Option<SystemTime>,
    fail_reads: bool,
    fail_writes: bool,
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory store read failed")]
    Read,
    #[error("memory store write failed")]
    Write,
    #[error("memory store has never been written")]
    NoModificationTime,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// overrides the modification time, `None` makes the query fail
    pub fn set_modification_time(&self, time: Option<SystemTime>) {
        self.inner.lock().modified = time;
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.inner.lock().fail_reads = fail;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }

    /// raw stored value, bypassing failure injection
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.lock().entries.get(key).cloned()
    }
}

#[async_trait]
impl Storage for MemoryStore {
    type Error = MemoryError;

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, Self::Error> {
        let inner = self.inner.lock();
        if inner.fail_reads {
            return Err(MemoryError::Read);
        }
        Ok(inner.entries.get(key).cloned())
    }

    async fn write(&self, key: &str, value: &[u8]) -> Result<(), Self::Error> {
        let mut inner = self.inner.lock();
        if inner.fail_writes {
            return Err(MemoryError::Write);
        }
        inner.entries.insert(key.to_owned(), value.to_vec());
        inner.modified = Some(SystemTime::now());
        Ok(())
    }

    async fn modification_time(&self) -> Result<SystemTime, Self::Error> {
        self.inner.lock().modified.ok_or(MemoryError::NoModificationTime)
    }
}
