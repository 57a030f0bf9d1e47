/// Live session registry.
///
/// Every accepted connection registers a handle here so the admin API can
/// enumerate sessions and force-close them, and so bans can terminate all
/// sessions from an address. Closing goes through each session's
/// cancellation token; the session task observes it in its select loop and
/// tears the connection down itself.
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Handle to one live client session.
#[derive(Debug)]
pub struct SessionHandle {
    pub id: u64,
    pub ip: IpAddr,
    pub tls: bool,
    pub started: Instant,
    nick: Mutex<Option<String>>,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// Set the nickname once registration completes.
    pub fn set_nick(&self, nick: &str) {
        *self.nick.lock().unwrap_or_else(|e| e.into_inner()) = Some(nick.to_owned());
    }

    pub fn nick(&self) -> Option<String> {
        self.nick.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Token the session task selects on; cancelled on kick or ban.
    pub fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Serializable snapshot of one session, for `GET /sessions`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: u64,
    pub ip: String,
    pub nick: Option<String>,
    pub tls: bool,
    pub connected_secs: u64,
}

/// Registry of all live sessions, shared between listeners and the admin API.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<u64, Arc<SessionHandle>>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session and return its handle.
    pub fn register(&self, ip: IpAddr, tls: bool) -> Arc<SessionHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = Arc::new(SessionHandle {
            id,
            ip,
            tls,
            started: Instant::now(),
            nick: Mutex::new(None),
            cancel: CancellationToken::new(),
        });
        self.lock().insert(id, handle.clone());
        handle
    }

    /// Remove a session after its task finishes.
    pub fn deregister(&self, id: u64) {
        self.lock().remove(&id);
    }

    /// Cancel one session by id. Returns false if no such session.
    pub fn kick(&self, id: u64) -> bool {
        match self.lock().get(&id) {
            Some(handle) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every session from `ip`. Returns the number cancelled.
    pub fn close_ip(&self, ip: IpAddr) -> usize {
        let mut closed = 0;
        for handle in self.lock().values() {
            if handle.ip == ip {
                handle.cancel.cancel();
                closed += 1;
            }
        }
        closed
    }

    /// Cancel every session. Used at shutdown.
    pub fn close_all(&self) {
        for handle in self.lock().values() {
            handle.cancel.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot all sessions for the admin API, ordered by id.
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .lock()
            .values()
            .map(|h| SessionInfo {
                id: h.id,
                ip: h.ip.to_string(),
                nick: h.nick(),
                tls: h.tls,
                connected_secs: h.started.elapsed().as_secs(),
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<SessionHandle>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn register_assigns_unique_ids() {
        let registry = SessionRegistry::new();
        let a = registry.register(ip("10.0.0.1"), false);
        let b = registry.register(ip("10.0.0.2"), true);
        assert_ne!(a.id, b.id);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn deregister_removes_session() {
        let registry = SessionRegistry::new();
        let handle = registry.register(ip("10.0.0.1"), false);
        registry.deregister(handle.id);
        assert!(registry.is_empty());
    }

    #[test]
    fn kick_cancels_token() {
        let registry = SessionRegistry::new();
        let handle = registry.register(ip("10.0.0.1"), false);
        let token = handle.cancelled();
        assert!(!token.is_cancelled());
        assert!(registry.kick(handle.id));
        assert!(token.is_cancelled());
    }

    #[test]
    fn kick_unknown_id_returns_false() {
        let registry = SessionRegistry::new();
        assert!(!registry.kick(42));
    }

    #[test]
    fn close_ip_cancels_only_matching_sessions() {
        let registry = SessionRegistry::new();
        let a = registry.register(ip("10.0.0.1"), false);
        let b = registry.register(ip("10.0.0.1"), true);
        let c = registry.register(ip("10.0.0.2"), false);

        assert_eq!(registry.close_ip(ip("10.0.0.1")), 2);
        assert!(a.cancelled().is_cancelled());
        assert!(b.cancelled().is_cancelled());
        assert!(!c.cancelled().is_cancelled());
    }

    #[test]
    fn snapshot_reports_nick_and_order() {
        let registry = SessionRegistry::new();
        let a = registry.register(ip("10.0.0.1"), false);
        let _b = registry.register(ip("10.0.0.2"), true);
        a.set_nick("alice");

        let infos = registry.snapshot();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].nick.as_deref(), Some("alice"));
        assert_eq!(infos[1].nick, None);
        assert!(infos[0].id < infos[1].id);
    }
}
