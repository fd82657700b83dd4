//! Process-wide registry of named media sessions.
//!
//! Maps the stream name clients put in their URLs to a [`MediaSession`].
//! Removal is deferred while connections are still bound: a removed (or
//! replaced) session that is still referenced is latched
//! delete-when-unreferenced and lives outside the registry until the last
//! binding releases it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::media::MediaSession;

/// Thread-safe stream-name → [`MediaSession`] map.
///
/// Cloning is cheap and shares the underlying table. All reference-count
/// transitions happen under the table lock so that a concurrent
/// administrative removal cannot race a SETUP binding.
#[derive(Clone)]
pub struct StreamRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<MediaSession>>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        StreamRegistry {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a session under its stream name. An existing session under
    /// the same name is displaced and treated exactly as if
    /// [`remove`](Self::remove) had been called on it.
    pub fn add(&self, session: Arc<MediaSession>) {
        let name = session.stream_name().to_string();
        let displaced = self.sessions.write().insert(name.clone(), session);
        tracing::info!(stream = %name, "media session registered");
        if let Some(old) = displaced {
            Self::retire(old);
        }
    }

    /// Unregister the session under `name`. If no connection is bound the
    /// session is destroyed now; otherwise it is destroyed when the last
    /// bound connection goes away.
    pub fn remove(&self, name: &str) {
        let removed = self.sessions.write().remove(name);
        if let Some(session) = removed {
            tracing::info!(stream = %name, "media session removed");
            Self::retire(session);
        }
    }

    /// Look up a session by exact stream name.
    pub fn lookup(&self, name: &str) -> Option<Arc<MediaSession>> {
        self.sessions.read().get(name).cloned()
    }

    /// Snapshot of every registered session.
    pub fn sessions(&self) -> Vec<Arc<MediaSession>> {
        self.sessions.read().values().cloned().collect()
    }

    /// Look up `name` and bind the caller to the session, incrementing its
    /// reference count under the table lock.
    pub(crate) fn bind(&self, name: &str) -> Option<Arc<MediaSession>> {
        let sessions = self.sessions.read();
        sessions.get(name).map(|session| {
            session.retain();
            session.clone()
        })
    }

    /// Release one binding. A latched session whose last reference just
    /// dropped is evicted, unless the name has already been reused by a
    /// newer session.
    pub(crate) fn release_binding(&self, session: &Arc<MediaSession>) {
        let mut sessions = self.sessions.write();
        if session.release() == 0 && session.delete_when_unreferenced() {
            if let Some(current) = sessions.get(session.stream_name()) {
                if Arc::ptr_eq(current, session) {
                    sessions.remove(session.stream_name());
                    tracing::debug!(
                        stream = %session.stream_name(),
                        "unreferenced media session destroyed"
                    );
                }
            }
        }
    }

    /// Handle a session leaving the registry: destroy it now when nothing
    /// is bound, otherwise latch it for destruction on last release.
    fn retire(session: Arc<MediaSession>) {
        if session.reference_count() == 0 {
            tracing::debug!(stream = %session.stream_name(), "media session destroyed");
        } else {
            tracing::debug!(
                stream = %session.stream_name(),
                references = session.reference_count(),
                "media session still referenced, deferring destruction"
            );
            session.mark_delete_when_unreferenced();
        }
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}
