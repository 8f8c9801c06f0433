//! Client session: one logical conversation over a sequence of physical
//! connections.
//!
//! # Background tasks
//!
//! - one reader per physical connection, decoding frames and resolving the
//!   pending table
//! - one delivery task for inbound notifications and one for lifecycle
//!   callbacks, so neither runs on the reader
//! - one keep-alive loop, started on the first successful connect
//! - one reconnect loop at a time, started when a connection drops
//!
//! All of them stop when the session is closed. The reader, delivery and
//! keep-alive tasks hold weak references and also stop once every
//! [`Session`] handle is dropped.

use super::listener::{SessionListener, SessionState};
use super::tracker::PendingRequests;
use crate::cancel::CancellationToken;
use crate::config::SessionOptions;
use crate::error::codes;
use crate::protocol::{codec, methods, CloseStatus, Message, Request, Response, ResponseError};
use crate::retry::{retry_async, RetryPolicy};
use crate::transport::{Connector, FrameSink, TransportEvent};
use crate::{Result, RomError};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Receives inbound notifications (server-pushed requests without an id).
pub type NotificationHandler = Arc<dyn Fn(Request) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Lifecycle {
    Connected,
    Reconnecting,
    Reconnected(bool),
    Disconnected,
    ConnectionFailed(RomError),
}

struct Inner {
    connector: Arc<dyn Connector>,
    options: SessionOptions,
    pending: PendingRequests,
    next_id: AtomicU64,
    session_id: Mutex<Option<String>>,
    state: Mutex<SessionState>,
    sink: Mutex<Option<Arc<dyn FrameSink>>>,
    /// Incremented for every physical connection.
    generation: AtomicU64,
    /// Highest generation whose disconnect has been handled.
    handled_generation: AtomicU64,
    connect_lock: tokio::sync::Mutex<()>,
    token: CancellationToken,
    listener: Mutex<Option<Arc<dyn SessionListener>>>,
    observers: Mutex<Vec<Arc<dyn SessionListener>>>,
    handler: Mutex<Option<NotificationHandler>>,
    inbound_tx: mpsc::UnboundedSender<Request>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Request>>>,
    lifecycle_tx: mpsc::UnboundedSender<Lifecycle>,
    lifecycle_rx: Mutex<Option<mpsc::UnboundedReceiver<Lifecycle>>>,
    keepalive_started: AtomicBool,
    reconnecting: AtomicBool,
}

/// A reconnect-resilient JSON-RPC session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("label", &self.inner.options.label)
            .field("session_id", &self.session_id())
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    pub fn new<C: Connector>(connector: C, options: SessionOptions) -> Self {
        Self::with_connector(Arc::new(connector), options)
    }

    pub fn with_connector(connector: Arc<dyn Connector>, options: SessionOptions) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                connector,
                options,
                pending: PendingRequests::new(),
                next_id: AtomicU64::new(1),
                session_id: Mutex::new(None),
                state: Mutex::new(SessionState::Idle),
                sink: Mutex::new(None),
                generation: AtomicU64::new(0),
                handled_generation: AtomicU64::new(0),
                connect_lock: tokio::sync::Mutex::new(()),
                token: CancellationToken::new(),
                listener: Mutex::new(None),
                observers: Mutex::new(Vec::new()),
                handler: Mutex::new(None),
                inbound_tx,
                inbound_rx: Mutex::new(Some(inbound_rx)),
                lifecycle_tx,
                lifecycle_rx: Mutex::new(Some(lifecycle_rx)),
                keepalive_started: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
            }),
        }
    }

    fn label(&self) -> &str {
        &self.inner.options.label
    }

    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    /// Server-assigned session id, once known.
    pub fn session_id(&self) -> Option<String> {
        lock(&self.inner.session_id).clone()
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.inner.state)
    }

    fn set_state(&self, state: SessionState) {
        let mut current = lock(&self.inner.state);
        if *current != state {
            debug!("[{}] {} -> {}", self.label(), *current, state);
            *current = state;
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Install the handler for inbound notifications, replacing any previous one.
    pub fn set_notification_handler(&self, handler: impl Fn(Request) + Send + Sync + 'static) {
        *lock(&self.inner.handler) = Some(Arc::new(handler));
    }

    pub fn set_listener(&self, listener: Arc<dyn SessionListener>) {
        *lock(&self.inner.listener) = Some(listener);
    }

    /// Register an additional lifecycle observer for layers built on the session.
    pub(crate) fn add_observer(&self, observer: Arc<dyn SessionListener>) {
        lock(&self.inner.observers).push(observer);
    }

    fn emit(&self, event: Lifecycle) {
        let _ = self.inner.lifecycle_tx.send(event);
    }

    /// Open the transport and learn (or resume) the session id.
    ///
    /// A no-op when already established. Fails with [`RomError::Closed`] after
    /// [`close`](Self::close).
    pub async fn connect(&self) -> Result<()> {
        self.inner.token.check()?;
        let _guard = self.inner.connect_lock.lock().await;
        self.inner.token.check()?;

        let resuming = match self.state() {
            SessionState::Established => return Ok(()),
            SessionState::Reconnecting => true,
            _ => false,
        };
        if !resuming {
            self.set_state(SessionState::Connecting);
        }
        self.start_delivery();

        match self.establish().await {
            Ok(same_session) => {
                self.set_state(SessionState::Established);
                self.start_keepalive();
                if resuming {
                    info!(
                        "[{}] Reconnected (same session: {})",
                        self.label(),
                        same_session
                    );
                    self.emit(Lifecycle::Reconnected(same_session));
                } else {
                    self.emit(Lifecycle::Connected);
                }
                Ok(())
            }
            Err(e) => {
                if !resuming {
                    self.set_state(SessionState::Idle);
                    self.emit(Lifecycle::ConnectionFailed(e.clone()));
                }
                Err(e)
            }
        }
    }

    /// Open one physical connection and run the keep-alive handshake on it.
    /// Returns whether the server kept the previous session.
    async fn establish(&self) -> Result<bool> {
        let options = &self.inner.options;
        let retry = RetryPolicy::fixed(
            options.handshake_retry_attempts,
            options.handshake_retry_delay,
        );
        let connector = self.inner.connector.clone();
        let connect_timeout = options.connect_timeout;

        let (result, attempts) = retry_async(
            &retry,
            || {
                let connector = connector.clone();
                async move {
                    tokio::time::timeout(connect_timeout, connector.connect())
                        .await
                        .map_err(|_| RomError::Timeout(connect_timeout))?
                }
            },
            RomError::is_retryable,
        )
        .await;
        let connection = result?;
        debug!(
            "[{}] Transport open to {} after {} attempt(s)",
            self.label(),
            self.inner.connector.describe(),
            attempts
        );

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let sink = connection.sink.clone();
        *lock(&self.inner.sink) = Some(connection.sink);
        tokio::spawn(read_loop(
            Arc::downgrade(&self.inner),
            connection.events,
            generation,
        ));

        let previous = self.session_id();
        let response = match self.request(methods::KEEP_ALIVE, None).await {
            Ok(response) => response,
            Err(e) => {
                lock(&self.inner.sink).take();
                let _ = sink.close(CloseStatus::Normal).await;
                return Err(e);
            }
        };
        if let Err(error) = response.payload {
            lock(&self.inner.sink).take();
            let _ = sink.close(CloseStatus::Normal).await;
            return Err(RomError::from_response_error(error));
        }

        let current = response.session_id;
        let same_session = previous.is_some() && previous == current;
        if !same_session {
            info!(
                "[{}] Session established: {}",
                self.label(),
                current.as_deref().unwrap_or("<none>")
            );
        }
        *lock(&self.inner.session_id) = current;
        Ok(same_session)
    }

    fn start_delivery(&self) {
        if let Some(rx) = lock(&self.inner.inbound_rx).take() {
            tokio::spawn(deliver_notifications(Arc::downgrade(&self.inner), rx));
        }
        if let Some(rx) = lock(&self.inner.lifecycle_rx).take() {
            tokio::spawn(deliver_lifecycle(Arc::downgrade(&self.inner), rx));
        }
    }

    fn start_keepalive(&self) {
        let Some(interval) = self.inner.options.keepalive_interval else {
            return;
        };
        if self.inner.keepalive_started.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(keepalive_loop(
            Arc::downgrade(&self.inner),
            interval,
            self.inner.token.clone(),
        ));
    }

    /// Close the session: stop background loops, abort every pending request
    /// and release the transport. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.inner.token.is_cancelled() {
            return Ok(());
        }
        self.inner.token.cancel();
        self.set_state(SessionState::Closed);

        let aborted = self.inner.pending.abort_all("session closed");
        let sink = lock(&self.inner.sink).take();
        if let Some(sink) = sink {
            if let Err(e) = sink.close(CloseStatus::Normal).await {
                debug!("[{}] Error closing transport: {}", self.label(), e);
            }
        }
        info!(
            "[{}] Session closed ({} pending request(s) aborted)",
            self.label(),
            aborted
        );
        self.emit(Lifecycle::Disconnected);
        Ok(())
    }

    /// Send a request and wait for its response, bounded by the request timeout.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Response> {
        self.inner.token.check()?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request::new(id, method, params).with_session_id(self.session_id());
        let text = codec::encode(&request.into())?;

        // Registered before the send so a racing response is not lost.
        let slot = self.inner.pending.prepare(id, method)?;
        debug!("[{}] -> {} (id={})", self.label(), method, id);
        if let Err(e) = self.send_text(text).await {
            self.inner.pending.remove(id);
            return Err(e);
        }
        slot.wait(self.inner.options.request_timeout).await
    }

    /// Send a request and return its result, mapping an error response to a
    /// typed [`RomError`].
    pub async fn send_request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.request(method, params)
            .await?
            .payload
            .map_err(RomError::from_response_error)
    }

    /// Fire-and-forget.
    pub async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.inner.token.check()?;
        let request = Request::notification(method, params).with_session_id(self.session_id());
        debug!("[{}] -> {} (notification)", self.label(), method);
        self.send_text(codec::encode(&request.into())?).await
    }

    /// Write raw message text on the current transport. Fails fast when no
    /// transport is connected.
    pub async fn send_text(&self, text: String) -> Result<()> {
        self.inner.token.check()?;
        let sink = lock(&self.inner.sink).clone().ok_or(RomError::NotConnected)?;
        sink.send_text(text).await
    }

    fn handle_inbound(&self, text: &str) {
        match codec::decode(text) {
            Err(e) => warn!("[{}] Dropping undecodable message: {}", self.label(), e),
            Ok(Message::Response(response)) => {
                if let Some(sid) = &response.session_id {
                    let mut known = lock(&self.inner.session_id);
                    if known.is_none() {
                        *known = Some(sid.clone());
                    }
                }
                self.inner.pending.resolve(response);
            }
            Ok(Message::Request(request)) if request.is_notification() => {
                // Only fails once the delivery task is gone with the session.
                if self.inner.inbound_tx.send(request).is_err() {
                    debug!("[{}] Notification after delivery stopped", self.label());
                }
            }
            Ok(Message::Request(request)) => {
                // No client-side methods are exposed.
                let reply = Response::error(
                    request.id,
                    ResponseError::new(
                        codes::METHOD_NOT_FOUND,
                        format!("Method not found: {}", request.method),
                    ),
                )
                .with_session_id(self.session_id());
                let session = self.clone();
                tokio::spawn(async move {
                    if let Ok(text) = codec::encode(&reply.into()) {
                        let _ = session.send_text(text).await;
                    }
                });
            }
        }
    }

    fn on_disconnect(&self, generation: u64, status: CloseStatus) {
        if self.inner.token.is_cancelled()
            || generation != self.inner.generation.load(Ordering::SeqCst)
            || self
                .inner
                .handled_generation
                .fetch_max(generation, Ordering::SeqCst)
                >= generation
        {
            return;
        }

        lock(&self.inner.sink).take();
        let aborted = self.inner.pending.abort_all("connection lost");
        warn!(
            "[{}] Connection lost: {} ({} pending request(s) aborted)",
            self.label(),
            status,
            aborted
        );
        self.emit(Lifecycle::Disconnected);

        if status.is_fatal() {
            let error = RomError::transport(format!("connection closed: {}", status));
            self.set_state(SessionState::Closed);
            self.inner.token.cancel();
            self.emit(Lifecycle::ConnectionFailed(error));
            return;
        }
        if status.requires_new_session() {
            lock(&self.inner.session_id).take();
        }

        self.set_state(SessionState::Reconnecting);
        if !self.inner.reconnecting.swap(true, Ordering::SeqCst) {
            tokio::spawn(self.clone().reconnect_loop());
        }
    }

    async fn reconnect_loop(self) {
        self.emit(Lifecycle::Reconnecting);
        let options = self.inner.options.clone();
        let mut last_error = None;

        for attempt in 1..=options.max_reconnect_attempts {
            tokio::select! {
                _ = self.inner.token.cancelled() => {
                    self.inner.reconnecting.store(false, Ordering::SeqCst);
                    return;
                }
                _ = tokio::time::sleep(options.reconnect_delay) => {}
            }
            if self.state() == SessionState::Established {
                break;
            }
            match self.connect().await {
                Ok(()) => {
                    self.inner.reconnecting.store(false, Ordering::SeqCst);
                    return;
                }
                Err(RomError::Closed) => {
                    self.inner.reconnecting.store(false, Ordering::SeqCst);
                    return;
                }
                Err(e) => {
                    warn!(
                        "[{}] Reconnect attempt {}/{} failed: {}",
                        self.label(),
                        attempt,
                        options.max_reconnect_attempts,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        self.inner.reconnecting.store(false, Ordering::SeqCst);
        if self.state() == SessionState::Established {
            return;
        }
        let error = last_error.unwrap_or_else(|| RomError::transport("reconnect gave up"));
        warn!("[{}] Giving up on reconnect: {}", self.label(), error);
        self.set_state(SessionState::Closed);
        self.inner.token.cancel();
        self.inner.pending.abort_all("reconnect failed");
        self.emit(Lifecycle::ConnectionFailed(error));
    }

    /// Drop the current transport and enter the reconnect path.
    async fn force_reconnect(&self) {
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let sink = lock(&self.inner.sink).clone();
        if let Some(sink) = sink {
            let _ = sink.close(CloseStatus::GoingAway).await;
        }
        self.on_disconnect(generation, CloseStatus::Abnormal);
    }
}

async fn read_loop(
    inner: Weak<Inner>,
    mut events: mpsc::Receiver<TransportEvent>,
    generation: u64,
) {
    let status = loop {
        match events.recv().await {
            Some(TransportEvent::Frame(text)) => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                Session { inner }.handle_inbound(&text);
            }
            Some(TransportEvent::Closed(status)) => break status,
            None => break CloseStatus::Abnormal,
        }
    };
    if let Some(inner) = inner.upgrade() {
        Session { inner }.on_disconnect(generation, status);
    }
}

async fn deliver_notifications(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<Request>) {
    while let Some(request) = rx.recv().await {
        let handler = match inner.upgrade() {
            Some(inner) => lock(&inner.handler).clone(),
            None => return,
        };
        match handler {
            Some(handler) => handler(request),
            None => debug!("No notification handler for '{}'", request.method),
        }
    }
}

async fn deliver_lifecycle(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<Lifecycle>) {
    while let Some(event) = rx.recv().await {
        let targets: Vec<Arc<dyn SessionListener>> = match inner.upgrade() {
            Some(inner) => {
                let mut targets = lock(&inner.observers).clone();
                targets.extend(lock(&inner.listener).clone());
                targets
            }
            None => return,
        };
        for target in &targets {
            match &event {
                Lifecycle::Connected => target.connected(),
                Lifecycle::Reconnecting => target.reconnecting(),
                Lifecycle::Reconnected(same) => target.reconnected(*same),
                Lifecycle::Disconnected => target.disconnected(),
                Lifecycle::ConnectionFailed(error) => target.connection_failed(error),
            }
        }
    }
}

async fn keepalive_loop(
    inner: Weak<Inner>,
    interval: std::time::Duration,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let session = Session { inner };
        if session.state() != SessionState::Established {
            continue;
        }
        match session.send_request(methods::KEEP_ALIVE, None).await {
            Ok(_) => debug!("[{}] keep-alive ok", session.label()),
            Err(RomError::Closed) => return,
            Err(e)
                if e.is_retryable()
                    || matches!(e, RomError::NotConnected | RomError::Aborted { .. }) =>
            {
                warn!(
                    "[{}] Keep-alive failed, forcing reconnect: {}",
                    session.label(),
                    e
                );
                session.force_reconnect().await;
            }
            Err(e) => warn!("[{}] Keep-alive rejected: {}", session.label(), e),
        }
    }
}
