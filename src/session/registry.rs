//! Registry of live sessions.
//!
//! `SessionRegistry` stores non-owning weak references to sessions so
//! management tasks can look a session up by id without keeping it alive.
//! Sessions remove themselves during the last shutdown step; entries whose
//! session was dropped without shutdown are pruned lazily at lookup time.

use std::{
    fmt,
    sync::{
        Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use dashmap::DashMap;
use serde::Serialize;

use super::{Session, SessionInner};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier assigned to a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct SessionId(u64);

impl From<u64> for SessionId {
    fn from(value: u64) -> Self { Self(value) }
}

impl SessionId {
    /// Allocate a process-unique id.
    #[must_use]
    pub fn next() -> Self { Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)) }

    /// Return the inner `u64` representation.
    #[must_use]
    pub fn as_u64(&self) -> u64 { self.0 }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "SessionId({})", self.0) }
}

/// Concurrent registry of sessions keyed by [`SessionId`].
#[derive(Default)]
pub struct SessionRegistry(DashMap<SessionId, Weak<SessionInner>>);

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry").field("len", &self.0.len()).finish()
    }
}

impl SessionRegistry {
    /// Retrieve the session for `id` if it is still alive.
    pub fn get(&self, id: &SessionId) -> Option<Session> {
        let guard = self.0.get(id);
        let inner = guard.as_ref().and_then(|weak| weak.upgrade());
        drop(guard);
        if inner.is_none() {
            self.0.remove_if(id, |_, weak| weak.strong_count() == 0);
        }
        inner.map(Session::from_inner)
    }

    pub(crate) fn insert(&self, session: &Session) { self.0.insert(session.id(), session.downgrade()); }

    /// Remove a session, typically during its teardown.
    pub fn remove(&self, id: &SessionId) { self.0.remove(id); }

    /// Remove all stale weak references.
    pub fn prune(&self) { self.0.retain(|_, weak| weak.strong_count() > 0); }

    /// Prune stale references, then return the ids of live sessions.
    #[must_use]
    pub fn active_ids(&self) -> Vec<SessionId> {
        let mut ids = Vec::with_capacity(self.0.len());
        self.0.retain(|id, weak| {
            if weak.strong_count() > 0 {
                ids.push(*id);
                true
            } else {
                false
            }
        });
        ids
    }

    #[must_use]
    pub fn len(&self) -> usize { self.0.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}
