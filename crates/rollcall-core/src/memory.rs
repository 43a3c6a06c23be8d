//! In-process identity store and attendance log.

use std::sync::{Mutex, RwLock};

use crate::store::{AttendanceSink, IdentityStore, StoreError};
use crate::types::{AttendanceEvent, Descriptor, Identity};

/// Insertion-ordered identity store guarded by a `RwLock`.
///
/// Readers get an owned snapshot; a descriptor replace takes the write lock
/// for a single slot assignment.
#[derive(Debug, Default)]
pub struct MemoryStore {
    identities: RwLock<Vec<Identity>>,
    events: Mutex<Vec<AttendanceEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new identity. Handles are unique.
    pub fn insert(&self, identity: Identity) -> Result<(), StoreError> {
        let mut identities = self.identities.write().map_err(poisoned)?;
        if identities.iter().any(|i| i.handle == identity.handle) {
            return Err(StoreError::AlreadyExists(identity.handle));
        }
        identities.push(identity);
        Ok(())
    }

    /// All recorded attendance events, oldest first.
    pub fn events(&self) -> Result<Vec<AttendanceEvent>, StoreError> {
        Ok(self.events.lock().map_err(poisoned)?.clone())
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> StoreError {
    StoreError::Backend("memory store lock poisoned".into())
}

impl IdentityStore for MemoryStore {
    fn find_by_handle(&self, handle: &str) -> Result<Identity, StoreError> {
        self.identities
            .read()
            .map_err(poisoned)?
            .iter()
            .find(|i| i.handle == handle)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(handle.to_string()))
    }

    fn list_with_descriptor(&self) -> Result<Vec<Identity>, StoreError> {
        Ok(self
            .identities
            .read()
            .map_err(poisoned)?
            .iter()
            .filter(|i| i.descriptor.is_some())
            .cloned()
            .collect())
    }

    fn set_descriptor(&self, handle: &str, descriptor: &Descriptor) -> Result<(), StoreError> {
        let mut identities = self.identities.write().map_err(poisoned)?;
        let identity = identities
            .iter_mut()
            .find(|i| i.handle == handle)
            .ok_or_else(|| StoreError::NotFound(handle.to_string()))?;
        identity.descriptor = Some(descriptor.clone());
        Ok(())
    }
}

impl AttendanceSink for MemoryStore {
    fn append(&self, event: &AttendanceEvent) -> Result<(), StoreError> {
        self.events.lock().map_err(poisoned)?.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn d(x: f32) -> Descriptor {
        Descriptor::new(vec![x, 0.0], "test-v1")
    }

    #[test]
    fn test_duplicate_handle_rejected() {
        let store = MemoryStore::new();
        store.insert(Identity::new("a", "A")).unwrap();
        assert_eq!(
            store.insert(Identity::new("a", "Again")),
            Err(StoreError::AlreadyExists("a".into()))
        );
    }

    #[test]
    fn test_snapshot_insertion_order() {
        let store = MemoryStore::new();
        for h in ["c", "a", "b", "none"] {
            store.insert(Identity::new(h, h)).unwrap();
        }
        store.set_descriptor("b", &d(0.2)).unwrap();
        store.set_descriptor("c", &d(0.3)).unwrap();
        store.set_descriptor("a", &d(0.1)).unwrap();

        let handles: Vec<String> = store
            .list_with_descriptor()
            .unwrap()
            .into_iter()
            .map(|i| i.handle)
            .collect();
        assert_eq!(handles, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_set_descriptor_unknown() {
        let store = MemoryStore::new();
        assert_eq!(
            store.set_descriptor("ghost", &d(0.0)),
            Err(StoreError::NotFound("ghost".into()))
        );
    }

    #[test]
    fn test_concurrent_enrollments_distinct_identities() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..8 {
            store.insert(Identity::new(format!("h{i}"), "x")).unwrap();
        }

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        store.set_descriptor(&format!("h{i}"), &d(i as f32)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snapshot = store.list_with_descriptor().unwrap();
        assert_eq!(snapshot.len(), 8);
        for (i, identity) in snapshot.iter().enumerate() {
            assert_eq!(identity.descriptor, Some(d(i as f32)));
        }
    }

    #[test]
    fn test_concurrent_enrollments_same_identity() {
        let store = Arc::new(MemoryStore::new());
        store.insert(Identity::new("shared", "Shared")).unwrap();
        let written: Vec<Descriptor> = (0..8)
            .map(|i| Descriptor::new(vec![i as f32; 64], "test-v1"))
            .collect();

        let threads: Vec<_> = written
            .iter()
            .cloned()
            .map(|descriptor| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        store.set_descriptor("shared", &descriptor).unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let stored = store.find_by_handle("shared").unwrap().descriptor.unwrap();
        assert!(written.contains(&stored), "interleaved write: {stored:?}");
    }
}
