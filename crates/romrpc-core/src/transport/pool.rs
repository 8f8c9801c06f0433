//! Request/response binding over pooled framed-TCP sockets.
//!
//! Each send borrows a socket, writes the frame and, for a request with an
//! id, reads until the correlated response arrives. There is no server push:
//! a socket with unread bytes or a pending EOF fails validation on borrow and
//! is discarded.

use super::{Connection, Connector, FrameSink, TransportEvent};
use crate::config::{PoolOptions, ServerConfig};
use crate::protocol::{codec, read_frame, write_frame, CloseStatus, Frame, Message};
use crate::{Result, RomError};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

/// A bounded set of idle framed-TCP sockets to one address.
pub struct ConnectionPool {
    addr: SocketAddr,
    options: PoolOptions,
    idle: Mutex<Vec<TcpStream>>,
}

impl ConnectionPool {
    pub fn new(addr: SocketAddr, options: PoolOptions) -> Self {
        Self {
            addr,
            options,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Take a validated idle socket, or open a new one.
    pub async fn borrow(&self) -> Result<TcpStream> {
        loop {
            let candidate = self
                .idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop();
            match candidate {
                Some(stream) if Self::validate(&stream) => return Ok(stream),
                Some(_) => debug!("Discarding stale pooled connection to {}", self.addr),
                None => break,
            }
        }

        let stream = tokio::time::timeout(self.options.connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| RomError::Timeout(self.options.connect_timeout))?
            .map_err(|e| RomError::transport(format!("connect {}: {}", self.addr, e)))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// An idle socket is usable only if nothing is waiting to be read.
    fn validate(stream: &TcpStream) -> bool {
        let mut buf = [0u8; 1];
        matches!(stream.try_read(&mut buf), Err(e) if e.kind() == std::io::ErrorKind::WouldBlock)
    }

    /// Return a healthy socket after a completed exchange.
    pub fn give_back(&self, stream: TcpStream) {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.options.max_idle {
            idle.push(stream);
        }
    }

    /// Drop a socket that saw a transport error.
    pub fn discard(&self, stream: TcpStream) {
        debug!("Discarding pooled connection to {}", self.addr);
        drop(stream);
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Connector whose connections share one [`ConnectionPool`].
#[derive(Clone)]
pub struct PooledConnector {
    pool: Arc<ConnectionPool>,
}

impl PooledConnector {
    pub fn new(addr: SocketAddr, options: PoolOptions) -> Self {
        Self {
            pool: Arc::new(ConnectionPool::new(addr, options)),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }
}

#[async_trait]
impl Connector for PooledConnector {
    async fn connect(&self) -> Result<Connection> {
        // Fail early if the endpoint is unreachable.
        let stream = self.pool.borrow().await?;
        self.pool.give_back(stream);

        let (events_tx, events_rx) = mpsc::channel(ServerConfig::OUTBOUND_QUEUE_CAPACITY);
        Ok(Connection {
            sink: Arc::new(PoolSink {
                pool: self.pool.clone(),
                events: Mutex::new(Some(events_tx)),
                connected: AtomicBool::new(true),
            }),
            events: events_rx,
        })
    }

    fn describe(&self) -> String {
        format!("pool://{}", self.pool.addr)
    }
}

struct PoolSink {
    pool: Arc<ConnectionPool>,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    connected: AtomicBool,
}

impl PoolSink {
    async fn exchange(stream: &mut TcpStream, text: &str, expects_reply: bool) -> Result<Vec<String>> {
        write_frame(stream, text).await?;
        let mut frames = Vec::new();
        if !expects_reply {
            return Ok(frames);
        }
        loop {
            match read_frame(stream).await? {
                Some(Frame::Text(reply)) => {
                    let is_response = matches!(codec::decode(&reply), Ok(Message::Response(_)));
                    frames.push(reply);
                    if is_response {
                        return Ok(frames);
                    }
                }
                Some(Frame::Close(status)) => {
                    return Err(RomError::transport(format!("closed by peer: {}", status)))
                }
                None => return Err(RomError::transport("connection closed before reply")),
            }
        }
    }
}

#[async_trait]
impl FrameSink for PoolSink {
    async fn send_text(&self, text: String) -> Result<()> {
        let events = match self.events.lock().unwrap_or_else(PoisonError::into_inner).clone() {
            Some(events) if self.is_connected() => events,
            _ => return Err(RomError::NotConnected),
        };
        let expects_reply = matches!(
            codec::decode(&text),
            Ok(Message::Request(ref r)) if !r.is_notification()
        );

        let mut stream = self.pool.borrow().await?;
        match Self::exchange(&mut stream, &text, expects_reply).await {
            Ok(frames) => {
                self.pool.give_back(stream);
                for frame in frames {
                    let _ = events.send(TransportEvent::Frame(frame)).await;
                }
                Ok(())
            }
            Err(e) => {
                self.pool.discard(stream);
                Err(RomError::transport(format!("pooled exchange failed: {}", e)))
            }
        }
    }

    async fn close(&self, _status: CloseStatus) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
