use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Registered,
    Ended,
}

/// Something a session holds that must be disposed when it ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionResource {
    SharedMemorySegment { mapping_name: String },
}

#[derive(Debug)]
pub struct EndedSession {
    pub session_id: String,
    pub capability_id: String,
    /// Status right before the session ended.
    pub status: SessionStatus,
    pub resources: Vec<SessionResource>,
}

#[derive(Debug)]
struct SessionEntry {
    capability_id: String,
    status: SessionStatus,
    resources: Vec<SessionResource>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, SessionEntry>,
    pending: HashMap<String, oneshot::Sender<bool>>,
}

/// Open and registered sessions of one runtime plus their pending
/// registration waiters.
#[derive(Default)]
pub struct SessionTable {
    inner: Mutex<Inner>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark the session open and return a receiver that resolves `true` once
    /// the host confirms it, or `false` if the wait is abandoned. A stale
    /// waiter for the same id resolves `false`.
    pub fn begin_registration(
        &self,
        session_id: &str,
        capability_id: &str,
    ) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock();
        if let Some(stale) = inner.pending.insert(session_id.to_string(), tx) {
            let _ = stale.send(false);
        }
        inner.sessions.insert(
            session_id.to_string(),
            SessionEntry {
                capability_id: capability_id.to_string(),
                status: SessionStatus::Pending,
                resources: Vec::new(),
            },
        );
        rx
    }

    /// Move an open session to registered. Returns false for sessions that
    /// are not open or already registered.
    pub fn accept_registration(&self, session_id: &str) -> bool {
        let mut inner = self.lock();
        let Some(entry) = inner.sessions.get_mut(session_id) else {
            return false;
        };
        if entry.status != SessionStatus::Pending {
            return false;
        }
        entry.status = SessionStatus::Registered;
        if let Some(waiter) = inner.pending.remove(session_id) {
            let _ = waiter.send(true);
        }
        true
    }

    pub fn add_resource(&self, session_id: &str, resource: SessionResource) -> bool {
        match self.lock().sessions.get_mut(session_id) {
            Some(entry) => {
                entry.resources.push(resource);
                true
            }
            None => false,
        }
    }

    pub fn end_session(&self, session_id: &str) -> Option<EndedSession> {
        let mut inner = self.lock();
        if let Some(waiter) = inner.pending.remove(session_id) {
            let _ = waiter.send(false);
        }
        inner
            .sessions
            .remove(session_id)
            .map(|entry| EndedSession {
                session_id: session_id.to_string(),
                capability_id: entry.capability_id,
                status: entry.status,
                resources: entry.resources,
            })
    }

    /// End every session, failing all pending waiters.
    pub fn fail_all(&self) -> Vec<EndedSession> {
        let mut inner = self.lock();
        for (_, waiter) in inner.pending.drain() {
            let _ = waiter.send(false);
        }
        let mut ended: Vec<EndedSession> = inner
            .sessions
            .drain()
            .map(|(session_id, entry)| EndedSession {
                session_id,
                capability_id: entry.capability_id,
                status: entry.status,
                resources: entry.resources,
            })
            .collect();
        ended.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        ended
    }

    pub fn status(&self, session_id: &str) -> SessionStatus {
        self.lock()
            .sessions
            .get(session_id)
            .map(|e| e.status)
            .unwrap_or(SessionStatus::Ended)
    }

    pub fn is_open(&self, session_id: &str) -> bool {
        self.lock().sessions.contains_key(session_id)
    }

    pub fn is_registered(&self, session_id: &str) -> bool {
        self.status(session_id) == SessionStatus::Registered
    }

    pub fn open_for_capability(&self, capability_id: &str) -> bool {
        self.lock()
            .sessions
            .values()
            .any(|e| e.capability_id == capability_id)
    }

    pub fn capability_of(&self, session_id: &str) -> Option<String> {
        self.lock()
            .sessions
            .get(session_id)
            .map(|e| e.capability_id.clone())
    }

    pub fn open_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn registered_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock()
            .sessions
            .iter()
            .filter(|(_, e)| e.status == SessionStatus::Registered)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }
}
