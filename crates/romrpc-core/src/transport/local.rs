//! In-process binding: a channel pair between a client session and a server
//! running in the same process.
//!
//! Nothing but the message text crosses the channel, so session continuity
//! relies entirely on the session id carried inside the payload.

use super::{Connection, Connector, FrameSink, TransportEvent};
use crate::config::ServerConfig;
use crate::protocol::CloseStatus;
use crate::{Result, RomError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

/// Server side of the in-process binding.
///
/// `accept` receives the client's outbound queue and the sender for events
/// flowing back to the client. Dropping `outbound` without a
/// [`TransportEvent::Closed`] is reported to the client as an abnormal close.
pub trait LocalAcceptor: Send + Sync + 'static {
    fn accept(&self, inbound: mpsc::Receiver<String>, outbound: mpsc::Sender<TransportEvent>);
}

#[derive(Clone)]
pub struct LocalConnector {
    acceptor: Arc<dyn LocalAcceptor>,
}

impl LocalConnector {
    pub fn new(acceptor: Arc<dyn LocalAcceptor>) -> Self {
        Self { acceptor }
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self) -> Result<Connection> {
        let (to_server, from_client) = mpsc::channel(ServerConfig::OUTBOUND_QUEUE_CAPACITY);
        let (to_client, from_server) = mpsc::channel(ServerConfig::OUTBOUND_QUEUE_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(ServerConfig::OUTBOUND_QUEUE_CAPACITY);

        self.acceptor.accept(from_client, to_client);

        let connected = Arc::new(AtomicBool::new(true));
        tokio::spawn(forward(from_server, events_tx, connected.clone()));

        Ok(Connection {
            sink: Arc::new(LocalSink {
                tx: Mutex::new(Some(to_server)),
                connected,
            }),
            events: events_rx,
        })
    }

    fn describe(&self) -> String {
        "local".to_string()
    }
}

async fn forward(
    mut from_server: mpsc::Receiver<TransportEvent>,
    events: mpsc::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
) {
    let status = loop {
        match from_server.recv().await {
            Some(TransportEvent::Frame(text)) => {
                if events.send(TransportEvent::Frame(text)).await.is_err() {
                    break CloseStatus::Normal;
                }
            }
            Some(TransportEvent::Closed(status)) => break status,
            None => break CloseStatus::Abnormal,
        }
    };
    connected.store(false, Ordering::SeqCst);
    let _ = events.send(TransportEvent::Closed(status)).await;
}

struct LocalSink {
    tx: Mutex<Option<mpsc::Sender<String>>>,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSink for LocalSink {
    async fn send_text(&self, text: String) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match tx {
            Some(tx) if self.is_connected() => tx.send(text).await.map_err(|_| {
                self.connected.store(false, Ordering::SeqCst);
                RomError::transport("local endpoint gone")
            }),
            _ => Err(RomError::NotConnected),
        }
    }

    async fn close(&self, status: CloseStatus) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        if self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            debug!("Local connection closed: {}", status);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
