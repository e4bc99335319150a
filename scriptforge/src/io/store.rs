//! Request snapshot storage for submit/poll callers.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Result, anyhow};

use crate::core::state::RequestSnapshot;

/// Keyed snapshot storage injected into the layers that need it.
pub trait RequestStore: Send + Sync {
    fn get(&self, request_id: &str) -> Result<Option<RequestSnapshot>>;
    fn put(&self, snapshot: RequestSnapshot) -> Result<()>;
}

/// Process-local store backed by a mutex-guarded map.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    snapshots: Mutex<HashMap<String, RequestSnapshot>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RequestStore for InMemoryStore {
    fn get(&self, request_id: &str) -> Result<Option<RequestSnapshot>> {
        let snapshots = self
            .snapshots
            .lock()
            .map_err(|_| anyhow!("request store lock poisoned"))?;
        Ok(snapshots.get(request_id).cloned())
    }

    fn put(&self, snapshot: RequestSnapshot) -> Result<()> {
        let mut snapshots = self
            .snapshots
            .lock()
            .map_err(|_| anyhow!("request store lock poisoned"))?;
        snapshots.insert(snapshot.request_id.clone(), snapshot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::DesignStatus;

    fn snapshot(id: &str, status: DesignStatus) -> RequestSnapshot {
        RequestSnapshot {
            request_id: id.to_string(),
            status,
            iteration: 1,
            script: None,
            validation_score: None,
            error_message: None,
        }
    }

    #[test]
    fn put_replaces_previous_snapshot() {
        let store = InMemoryStore::new();
        assert!(store.get("a").expect("get").is_none());

        store.put(snapshot("a", DesignStatus::Planning)).expect("put");
        store.put(snapshot("a", DesignStatus::Completed)).expect("put");
        store.put(snapshot("b", DesignStatus::Pending)).expect("put");

        assert_eq!(store.len(), 2);
        let got = store.get("a").expect("get").expect("present");
        assert_eq!(got.status, DesignStatus::Completed);
    }
}
