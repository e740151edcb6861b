//! Coalescing of concurrent duplicate queries
//!
//! The first task to reserve a key becomes the leader and receives the
//! publish slot; everyone else shares the session and waits for the leader's
//! response. Sessions are ref-counted and destroyed when the last waiter
//! releases. Coalescing is scoped to the client session: the key includes
//! both endpoints of the connection.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use hickory_proto::op::{Message, Query};
use rustc_hash::FxHashMap;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::name::canonical_from;

/// Session tag identifying one client perspective
pub fn session_tag(local: SocketAddr, peer: SocketAddr) -> String {
    format!("{}\t{}", local, peer)
}

/// Coalescing key: endpoints plus the canonical question
pub fn session_key(local: SocketAddr, peer: SocketAddr, question: &Query) -> String {
    format!(
        "{}\t{}\t{}\t{}\t{}",
        local,
        peer,
        canonical_from(question.name()),
        question.query_class(),
        question.query_type()
    )
}

/// Shared state of one set of coalesced duplicate queries
pub struct InflightSession {
    rx: watch::Receiver<Option<Arc<Message>>>,
}

impl InflightSession {
    /// Wait until the leader publishes, then return the shared response.
    ///
    /// A leader that drops its slot without publishing closes the channel,
    /// which surfaces here as an error.
    pub async fn wait(&self) -> Result<Arc<Message>> {
        let mut rx = self.rx.clone();
        let value = rx
            .wait_for(|slot| slot.is_some())
            .await
            .map_err(|_| Error::LeaderDropped)?;
        Ok(value.clone().expect("watch value checked by predicate"))
    }
}

/// Leader-held publish slot; publishing consumes it
pub struct ResponseSlot {
    tx: watch::Sender<Option<Arc<Message>>>,
}

impl ResponseSlot {
    /// Publish the shared response and signal readiness exactly once
    pub fn publish(self, response: Arc<Message>) {
        let _ = self.tx.send(Some(response));
    }
}

struct SessionEntry {
    session: Arc<InflightSession>,
    refs: usize,
}

/// Lookup table of in-progress sessions
#[derive(Default)]
pub struct InflightManager {
    sessions: Mutex<FxHashMap<String, SessionEntry>>,
}

impl InflightManager {
    pub fn new() -> Self {
        InflightManager::default()
    }

    /// Join the session for the key, creating it if none is in progress.
    ///
    /// The publish slot is returned only to the creator, who thereby takes
    /// the leader role.
    pub fn reserve(&self, key: &str) -> (Arc<InflightSession>, Option<ResponseSlot>) {
        let mut sessions = self.sessions.lock().expect("inflight lock poisoned");
        if let Some(entry) = sessions.get_mut(key) {
            entry.refs += 1;
            return (entry.session.clone(), None);
        }
        let (tx, rx) = watch::channel(None);
        let session = Arc::new(InflightSession { rx });
        sessions.insert(
            key.to_string(),
            SessionEntry {
                session: session.clone(),
                refs: 1,
            },
        );
        (session, Some(ResponseSlot { tx }))
    }

    /// Drop one reservation; destroys the session at zero. Returns whether
    /// the session is still active.
    pub fn release(&self, key: &str) -> bool {
        let mut sessions = self.sessions.lock().expect("inflight lock poisoned");
        match sessions.get_mut(key) {
            None => false,
            Some(entry) if entry.refs > 1 => {
                entry.refs -= 1;
                true
            }
            Some(_) => {
                sessions.remove(key);
                false
            }
        }
    }

    /// Number of distinct in-progress sessions
    pub fn len(&self) -> usize {
        self.sessions.lock().expect("inflight lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases the reservation on every exit path of a serve call
pub struct ReleaseGuard<'a> {
    manager: &'a InflightManager,
    key: &'a str,
}

impl<'a> ReleaseGuard<'a> {
    pub fn new(manager: &'a InflightManager, key: &'a str) -> Self {
        ReleaseGuard { manager, key }
    }
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        self.manager.release(self.key);
    }
}
