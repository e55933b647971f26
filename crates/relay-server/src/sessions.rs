use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use pullwire_transfer::{SessionSnapshot, TransferSession};

/// Terminal sessions remembered for status queries.
pub const FINISHED_SESSIONS_KEPT: usize = 256;

/// Index of sessions by id, for status queries.
///
/// Active sessions are held live; once retired a session is kept as a
/// snapshot in a bounded, oldest-first history.
pub struct SessionBook {
    inner: Mutex<BookInner>,
    capacity: usize,
}

#[derive(Default)]
struct BookInner {
    active: HashMap<String, Arc<TransferSession>>,
    finished: VecDeque<SessionSnapshot>,
}

impl Default for SessionBook {
    fn default() -> Self {
        Self::with_capacity(FINISHED_SESSIONS_KEPT)
    }
}

impl SessionBook {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(BookInner::default()),
            capacity,
        }
    }

    pub fn insert(&self, session: Arc<TransferSession>) {
        self.lock().active.insert(session.id(), session);
    }

    /// Moves a session from the live set into the history.
    pub fn retire(&self, session_id: &str) {
        let mut inner = self.lock();
        let Some(session) = inner.active.remove(session_id) else {
            return;
        };
        inner.finished.push_back(session.snapshot());
        while inner.finished.len() > self.capacity {
            inner.finished.pop_front();
        }
    }

    pub fn get(&self, session_id: &str) -> Option<SessionSnapshot> {
        let inner = self.lock();
        if let Some(session) = inner.active.get(session_id) {
            return Some(session.snapshot());
        }
        inner
            .finished
            .iter()
            .rev()
            .find(|s| s.session_id == session_id)
            .cloned()
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    fn lock(&self) -> MutexGuard<'_, BookInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
