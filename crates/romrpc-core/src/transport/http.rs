//! HTTP long-poll binding.
//!
//! Every outbound message is one `POST {base}/rpc`; the response body, when
//! present, is the correlated reply. Server push travels back through a
//! background task that keeps one `poll` request parked on the server. Its
//! params carry any replies the client owes for server-originated requests;
//! its result is the list of messages queued for the session.
//!
//! The binding is header-less: the poll task learns the session id by peeking
//! at replies, and starts once one is known.

use super::{Connection, Connector, FrameSink, TransportEvent};
use crate::cancel::CancellationToken;
use crate::config::{ServerConfig, SessionConfig};
use crate::protocol::{codec, methods, CloseStatus, Message, Request};
use crate::{Result, RomError};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Slack added to the long-poll wait before the client gives up on a poll.
const POLL_SLACK: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct HttpConnector {
    base_url: String,
    client: reqwest::Client,
    request_timeout: Duration,
    long_poll_wait: Duration,
}

impl HttpConnector {
    /// `base_url` without a trailing slash, e.g. `http://127.0.0.1:8080`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            request_timeout: SessionConfig::REQUEST_TIMEOUT,
            long_poll_wait: ServerConfig::LONG_POLL_WAIT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Must match the server's long-poll wait closely enough for the poll to
    /// come back before the client-side deadline.
    pub fn with_long_poll_wait(mut self, wait: Duration) -> Self {
        self.long_poll_wait = wait;
        self
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self) -> Result<Connection> {
        let health = format!("{}/health", self.base_url);
        let response = self
            .client
            .get(&health)
            .timeout(SessionConfig::CONNECT_TIMEOUT)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RomError::transport(format!(
                "health check returned {}",
                response.status()
            )));
        }

        let (events_tx, events_rx) = mpsc::channel(ServerConfig::OUTBOUND_QUEUE_CAPACITY);
        let (session_tx, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            client: self.client.clone(),
            rpc_url: format!("{}/rpc", self.base_url),
            request_timeout: self.request_timeout,
            poll_timeout: self.long_poll_wait + POLL_SLACK,
            connected: AtomicBool::new(true),
            session_id: session_tx,
            owed_replies: Mutex::new(Vec::new()),
            events: events_tx,
            closed: CancellationToken::new(),
            next_poll_id: AtomicU64::new(1),
        });

        tokio::spawn(poll_loop(shared.clone()));

        Ok(Connection {
            sink: Arc::new(HttpSink { shared }),
            events: events_rx,
        })
    }

    fn describe(&self) -> String {
        self.base_url.clone()
    }
}

struct Shared {
    client: reqwest::Client,
    rpc_url: String,
    request_timeout: Duration,
    poll_timeout: Duration,
    connected: AtomicBool,
    session_id: watch::Sender<Option<String>>,
    owed_replies: Mutex<Vec<Value>>,
    events: mpsc::Sender<TransportEvent>,
    closed: CancellationToken,
    next_poll_id: AtomicU64,
}

impl Shared {
    async fn post(&self, body: String, timeout: Duration) -> Result<Option<String>> {
        let response = self
            .client
            .post(&self.rpc_url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .timeout(timeout)
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RomError::transport(format!("server returned {}", status)));
        }
        let text = response.text().await?;
        if text.is_empty() {
            return Ok(None);
        }
        if let Some(sid) = codec::peek_session_id(&text) {
            self.session_id.send_if_modified(|current| {
                if current.as_deref() == Some(sid.as_str()) {
                    false
                } else {
                    *current = Some(sid);
                    true
                }
            });
        }
        Ok(Some(text))
    }

    async fn fail(&self, status: CloseStatus) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.closed.cancel();
            let _ = self.events.send(TransportEvent::Closed(status)).await;
        }
    }
}

async fn poll_loop(shared: Arc<Shared>) {
    let mut session_rx = shared.session_id.subscribe();
    loop {
        let session_id = loop {
            if let Some(sid) = session_rx.borrow_and_update().clone() {
                break sid;
            }
            tokio::select! {
                _ = shared.closed.cancelled() => return,
                changed = session_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        };

        let outcome = tokio::select! {
            _ = shared.closed.cancelled() => return,
            outcome = poll_once(&shared, session_id) => outcome,
        };

        match outcome {
            Ok(messages) => {
                for message in messages {
                    if shared.events.send(TransportEvent::Frame(message)).await.is_err() {
                        return;
                    }
                }
            }
            Err(RomError::ServerObject { message, .. }) => {
                warn!("Poll rejected by server: {}", message);
                shared.fail(CloseStatus::SessionNotReliable).await;
                return;
            }
            Err(e) => {
                if !shared.closed.is_cancelled() {
                    debug!("Poll failed: {}", e);
                    shared.fail(CloseStatus::Abnormal).await;
                }
                return;
            }
        }
    }
}

async fn poll_once(shared: &Shared, session_id: String) -> Result<Vec<String>> {
    let replies: Vec<Value> =
        std::mem::take(&mut *shared.owed_replies.lock().unwrap_or_else(PoisonError::into_inner));
    let id = shared.next_poll_id.fetch_add(1, Ordering::Relaxed);
    let request = Request::new(id, methods::POLL, Some(Value::Array(replies)))
        .with_session_id(Some(session_id));
    let text = codec::encode(&request.into())?;

    let body = shared
        .post(text, shared.poll_timeout)
        .await?
        .ok_or_else(|| RomError::protocol("empty poll reply"))?;
    let response = codec::decode_response(&body)?;
    match response.payload {
        Ok(Value::Array(items)) => items
            .into_iter()
            .map(|item| serde_json::to_string(&item).map_err(RomError::from))
            .collect(),
        Ok(other) => Err(RomError::protocol(format!(
            "poll result must be a list, got {}",
            other
        ))),
        Err(error) => Err(RomError::from_response_error(error)),
    }
}

struct HttpSink {
    shared: Arc<Shared>,
}

#[async_trait]
impl FrameSink for HttpSink {
    async fn send_text(&self, text: String) -> Result<()> {
        if !self.is_connected() {
            return Err(RomError::NotConnected);
        }

        // Replies to server-originated requests ride on the next poll.
        if let Ok(Message::Response(_)) = codec::decode(&text) {
            let value: Value = serde_json::from_str(&text)?;
            self.shared
                .owed_replies
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(value);
            return Ok(());
        }

        match self.shared.post(text, self.shared.request_timeout).await {
            Ok(Some(reply)) => {
                let _ = self.shared.events.send(TransportEvent::Frame(reply)).await;
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                self.shared.fail(CloseStatus::Abnormal).await;
                Err(RomError::transport(format!("POST failed: {}", e)))
            }
        }
    }

    async fn close(&self, _status: CloseStatus) -> Result<()> {
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.closed.cancel();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_fails_without_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = HttpConnector::new(format!("http://{}", addr));
        let err = connector.connect().await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let connector = HttpConnector::new("http://localhost:9000/");
        assert_eq!(connector.describe(), "http://localhost:9000");
    }
}
