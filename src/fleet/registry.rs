//! Registry of live workers.
//!
//! The registry is the source of truth for which containers belong to a
//! worker; the watchdog treats any pool-labelled container without a
//! registered worker as an orphan.

use std::collections::HashMap;
use std::sync::RwLock;

use super::Worker;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A worker with this name already exists. Registration is atomic:
    /// check and insert happen under one lock.
    #[error("worker '{name}' is already registered")]
    Duplicate { name: String },
}

/// Where workers are recorded. Registration must be atomic; two concurrent
/// provisions with the same name resolve to exactly one winner.
pub trait WorkerRegistry: Send + Sync {
    fn register(&self, worker: Worker) -> Result<(), RegistryError>;
    /// Remove and return the worker, if it was registered. Idempotent.
    fn deregister(&self, name: &str) -> Option<Worker>;
    fn get(&self, name: &str) -> Option<Worker>;
    fn enumerate(&self) -> Vec<Worker>;
}

/// Process-local registry.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    workers: RwLock<HashMap<String, Worker>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Worker>> {
        self.workers.write().expect("registry lock poisoned")
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Worker>> {
        self.workers.read().expect("registry lock poisoned")
    }
}

impl WorkerRegistry for InMemoryRegistry {
    fn register(&self, worker: Worker) -> Result<(), RegistryError> {
        let mut workers = self.write();
        if workers.contains_key(&worker.name) {
            return Err(RegistryError::Duplicate {
                name: worker.name.clone(),
            });
        }
        workers.insert(worker.name.clone(), worker);
        Ok(())
    }

    fn deregister(&self, name: &str) -> Option<Worker> {
        self.write().remove(name)
    }

    fn get(&self, name: &str) -> Option<Worker> {
        self.read().get(name).cloned()
    }

    fn enumerate(&self) -> Vec<Worker> {
        self.read().values().cloned().collect()
    }
}
