//! Server-side session registry.
//!
//! Sessions outlive physical connections. A session is re-bound to whichever
//! transport last carried its id, and is closed by the sweeper once no
//! traffic has been seen for the idle timeout.

use crate::config::ServerConfig;
use crate::{Result, RomError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info};

/// One logical client conversation on the server.
pub struct ServerSession {
    id: String,
    last_seen: Mutex<Instant>,
    /// Where server-originated messages go: a stream connection's writer or
    /// this session's own long-poll mailbox.
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    mailbox_tx: mpsc::Sender<String>,
    mailbox_rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
    closed: AtomicBool,
}

impl ServerSession {
    fn new(id: String) -> Self {
        let (mailbox_tx, mailbox_rx) = mpsc::channel(ServerConfig::OUTBOUND_QUEUE_CAPACITY);
        Self {
            id,
            last_seen: Mutex::new(Instant::now()),
            outbound: Mutex::new(None),
            mailbox_tx,
            mailbox_rx: tokio::sync::Mutex::new(mailbox_rx),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Route outbound traffic to a stream connection.
    pub fn bind(&self, tx: &mpsc::Sender<String>) {
        let mut outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let rebound = match outbound.as_ref() {
            Some(current) => !current.same_channel(tx),
            None => true,
        };
        if rebound {
            debug!("Session {} bound to a new connection", self.id);
            *outbound = Some(tx.clone());
        }
    }

    /// Route outbound traffic to the long-poll mailbox.
    pub fn bind_mailbox(&self) {
        let tx = self.mailbox_tx.clone();
        self.bind(&tx);
    }

    /// Queue a server-originated message.
    ///
    /// Fails with [`RomError::Closed`] for a closed session,
    /// [`RomError::NotConnected`] when no transport is bound and a transport
    /// error when the bound queue is full or its connection is gone.
    pub fn push(&self, text: String) -> Result<()> {
        if self.is_closed() {
            return Err(RomError::Closed);
        }
        let tx = self
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(RomError::NotConnected)?;
        tx.try_send(text).map_err(|e| match e {
            TrySendError::Full(_) => RomError::transport(format!(
                "outbound queue for session {} is full ({} messages)",
                self.id,
                ServerConfig::OUTBOUND_QUEUE_CAPACITY
            )),
            TrySendError::Closed(_) => {
                RomError::transport(format!("connection of session {} is gone", self.id))
            }
        })
    }

    /// Wait up to `wait` for mailbox messages, then drain what is queued.
    pub async fn poll(&self, wait: Duration) -> Vec<String> {
        let mut rx = self.mailbox_rx.lock().await;
        let mut messages = Vec::new();
        if let Ok(Some(first)) = tokio::time::timeout(wait, rx.recv()).await {
            messages.push(first);
            while let Ok(next) = rx.try_recv() {
                messages.push(next);
            }
        }
        messages
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// All live server sessions, keyed by id.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<ServerSession>>>,
    idle_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            idle_timeout,
        }
    }

    /// Look up a session by id.
    pub fn resume(&self, id: &str) -> Option<Arc<ServerSession>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Resume `requested` if it is live, otherwise create a session with a
    /// fresh id. The flag reports whether a session was created.
    pub fn get_or_create(&self, requested: Option<&str>) -> (Arc<ServerSession>, bool) {
        if let Some(session) = requested.and_then(|id| self.resume(id)) {
            return (session, false);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let session = Arc::new(ServerSession::new(id.clone()));
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), session.clone());
        match requested {
            Some(old) => info!("Unknown session {}, created {}", old, id),
            None => info!("Created session {}", id),
        }
        (session, true)
    }

    /// Record traffic for a session. Returns false for an unknown id.
    pub fn touch(&self, id: &str) -> bool {
        match self.resume(id) {
            Some(session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    /// Remove a session and detach it from its transport.
    pub fn close(&self, id: &str) -> Option<Arc<ServerSession>> {
        let session = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)?;
        session.mark_closed();
        info!("Closed session {}", id);
        Some(session)
    }

    /// Close every session idle for longer than the timeout. Returns the
    /// closed ids.
    pub fn sweep(&self) -> Vec<String> {
        let expired: Vec<String> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| s.idle_for() > self.idle_timeout)
            .map(|s| s.id.clone())
            .collect();

        expired
            .into_iter()
            .filter(|id| self.close(id).is_some())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_id_creates_new_session() {
        let registry = SessionRegistry::new(Duration::from_secs(60));
        let (first, created) = registry.get_or_create(None);
        assert!(created);

        let (again, created) = registry.get_or_create(Some(first.id()));
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &again));

        let (other, created) = registry.get_or_create(Some("stale-id"));
        assert!(created);
        assert_ne!(other.id(), "stale-id");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_sweep_closes_idle_sessions() {
        let registry = SessionRegistry::new(Duration::from_millis(20));
        let (idle, _) = registry.get_or_create(None);
        std::thread::sleep(Duration::from_millis(40));
        let (fresh, _) = registry.get_or_create(None);

        let closed = registry.sweep();
        assert_eq!(closed, vec![idle.id().to_string()]);
        assert!(idle.is_closed());
        assert!(registry.resume(fresh.id()).is_some());
        assert!(!registry.touch(idle.id()));
    }

    #[tokio::test]
    async fn test_push_follows_latest_binding() {
        let registry = SessionRegistry::new(Duration::from_secs(60));
        let (session, _) = registry.get_or_create(None);
        assert!(matches!(
            session.push("nowhere".into()),
            Err(RomError::NotConnected)
        ));

        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        session.bind(&tx1);
        session.push("one".into()).unwrap();
        session.bind(&tx2);
        session.push("two".into()).unwrap();

        assert_eq!(rx1.recv().await.as_deref(), Some("one"));
        assert_eq!(rx2.recv().await.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn test_mailbox_poll_drains_queue() {
        let registry = SessionRegistry::new(Duration::from_secs(60));
        let (session, _) = registry.get_or_create(None);
        session.bind_mailbox();
        session.push("a".into()).unwrap();
        session.push("b".into()).unwrap();

        let messages = session.poll(Duration::from_millis(100)).await;
        assert_eq!(messages, vec!["a".to_string(), "b".to_string()]);

        let empty = session.poll(Duration::from_millis(20)).await;
        assert!(empty.is_empty());
    }

    #[test]
    fn test_closed_session_rejects_push() {
        let registry = SessionRegistry::new(Duration::from_secs(60));
        let (session, _) = registry.get_or_create(None);
        session.bind_mailbox();
        registry.close(session.id());
        assert!(matches!(session.push("late".into()), Err(RomError::Closed)));
    }

    #[tokio::test]
    async fn test_full_or_dead_queue_is_reported() {
        let registry = SessionRegistry::new(Duration::from_secs(60));
        let (session, _) = registry.get_or_create(None);
        let (tx, rx) = mpsc::channel(2);
        session.bind(&tx);
        session.push("1".into()).unwrap();
        session.push("2".into()).unwrap();
        let err = session.push("3".into()).unwrap_err();
        assert!(err.to_string().contains("full"), "{}", err);

        drop(rx);
        let err = session.push("4".into()).unwrap_err();
        assert!(err.to_string().contains("gone"), "{}", err);
    }
}
