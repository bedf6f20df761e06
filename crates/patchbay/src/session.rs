//! Per-connection session storage.
//!
//! A session is opaque collaborator data scoped to the lifetime of a logical
//! connection. Identity is the session id, never the OS descriptor: the
//! kernel reuses descriptor numbers immediately after close, while ids from
//! the dispatcher's generator are never handed out twice, so a late lookup
//! can only miss, not alias a stranger's state.
//!
//! Dropping the boxed data is the destructor, and removal happens exactly
//! once: on explicit clear or when the owning connection is torn down.

use std::any::Any;
use std::collections::HashMap;

use crate::connection::ConnId;

struct SessionData {
    owner: ConnId,
    data: Box<dyn Any + Send>,
}

#[derive(Default)]
pub(crate) struct SessionStore {
    map: HashMap<u32, SessionData>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install session data owned by `conn`.
    ///
    /// Re-registering an id replaces the entry; the old data is dropped.
    pub fn register(&mut self, owner: ConnId, session_id: u32, data: Box<dyn Any + Send>) {
        tracing::debug!(session_id, conn = owner.0, "session registered");
        self.map.insert(session_id, SessionData { owner, data });
    }

    /// Look up session data by id.
    pub fn data(&mut self, session_id: u32) -> Option<&mut (dyn Any + Send)> {
        self.map.get_mut(&session_id).map(|s| &mut *s.data)
    }

    /// Remove one session, dropping its data.
    pub fn clear(&mut self, session_id: u32) -> bool {
        let removed = self.map.remove(&session_id).is_some();
        if removed {
            tracing::debug!(session_id, "session cleared");
        }
        removed
    }

    /// Remove every session owned by a torn-down connection.
    pub fn clear_for_conn(&mut self, conn: ConnId) -> usize {
        let before = self.map.len();
        self.map.retain(|_, s| s.owner != conn);
        before - self.map.len()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Counts drops so tests can assert the destructor ran exactly once.
    struct DropTracker(Arc<AtomicUsize>);

    impl Drop for DropTracker {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn data_is_reachable_by_id_and_downcastable() {
        let mut store = SessionStore::new();
        store.register(ConnId(1), 10, Box::new(41u32));

        let data = store.data(10).unwrap();
        *data.downcast_mut::<u32>().unwrap() += 1;
        assert_eq!(*store.data(10).unwrap().downcast_ref::<u32>().unwrap(), 42);
        assert!(store.data(11).is_none());
    }

    #[test]
    fn destructor_runs_exactly_once_on_clear() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut store = SessionStore::new();
        store.register(ConnId(1), 10, Box::new(DropTracker(drops.clone())));

        assert!(store.clear(10));
        assert!(!store.clear(10));
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn teardown_only_touches_the_owning_conn() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut store = SessionStore::new();
        store.register(ConnId(1), 10, Box::new(DropTracker(drops.clone())));
        store.register(ConnId(1), 11, Box::new(DropTracker(drops.clone())));
        store.register(ConnId(2), 12, Box::new(DropTracker(drops.clone())));

        assert_eq!(store.clear_for_conn(ConnId(1)), 2);
        assert_eq!(drops.load(Ordering::SeqCst), 2);
        assert!(store.data(12).is_some());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn reregistering_replaces_and_drops_the_old_data() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut store = SessionStore::new();
        store.register(ConnId(1), 10, Box::new(DropTracker(drops.clone())));
        store.register(ConnId(1), 10, Box::new(7u32));

        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(store.data(10).unwrap().downcast_ref::<u32>().is_some());
    }
}
