//! Pluggable transport bindings.
//!
//! A [`Connector`] opens one physical connection at a time. The resulting
//! [`Connection`] splits into a [`FrameSink`] for outbound text and a channel
//! of [`TransportEvent`]s for everything that comes back, including the close
//! status when the connection ends.
//!
//! Bindings:
//! - [`tcp`]: framed socket stream with close frames
//! - [`local`]: in-process channel pair (header-less message queue)
//! - [`http`]: HTTP POST per message plus a long-poll task for server push
//! - [`pool`]: strict request/response over pooled framed sockets

pub mod http;
pub mod local;
pub mod pool;
pub mod tcp;

use crate::protocol::CloseStatus;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use http::HttpConnector;
pub use local::{LocalAcceptor, LocalConnector};
pub use pool::{ConnectionPool, PooledConnector};
pub use tcp::TcpConnector;

/// Inbound traffic from one physical connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Frame(String),
    /// Terminal: no frames follow.
    Closed(CloseStatus),
}

/// Outbound half of a connection.
///
/// Implementations serialize concurrent sends so one frame is fully written
/// before the next starts, and fail fast with [`RomError::NotConnected`]
/// once the connection is gone.
///
/// [`RomError::NotConnected`]: crate::RomError::NotConnected
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_text(&self, text: String) -> Result<()>;

    async fn close(&self, status: CloseStatus) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// An open physical connection.
pub struct Connection {
    pub sink: Arc<dyn FrameSink>,
    pub events: mpsc::Receiver<TransportEvent>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("connected", &self.sink.is_connected())
            .finish()
    }
}

/// Factory for physical connections to one endpoint.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Connection>;

    /// Endpoint description for log lines.
    fn describe(&self) -> String;
}
