//! Framed TCP binding.
//!
//! Outbound frames go through one writer task per connection. A caller that
//! stops waiting on [`FrameSink::send_text`] never leaves half a frame on the
//! socket: the writer finishes every frame it has started.

use super::{Connection, Connector, FrameSink, TransportEvent};
use crate::config::{ServerConfig, SessionConfig};
use crate::protocol::{read_frame, write_close_frame, write_frame, CloseStatus, Frame};
use crate::{Result, RomError};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Opens framed TCP connections to a fixed address.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: SocketAddr,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: SessionConfig::CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Connection> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| RomError::Timeout(self.connect_timeout))?
            .map_err(|e| RomError::transport(format!("connect {}: {}", self.addr, e)))?;
        stream.set_nodelay(true)?;
        debug!("Connected to {}", self.addr);
        Ok(spawn_stream(stream))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

/// Wrap an accepted or connected stream into a [`Connection`].
pub(crate) fn spawn_stream(stream: TcpStream) -> Connection {
    let (reader, writer) = stream.into_split();
    let connected = Arc::new(AtomicBool::new(true));
    let (events_tx, events_rx) = mpsc::channel(ServerConfig::OUTBOUND_QUEUE_CAPACITY);

    let (commands_tx, commands_rx) = mpsc::unbounded_channel();

    tokio::spawn(read_loop(reader, events_tx, connected.clone()));
    tokio::spawn(write_loop(writer, commands_rx, connected.clone()));

    Connection {
        sink: Arc::new(TcpSink {
            commands: commands_tx,
            connected,
        }),
        events: events_rx,
    }
}

enum WriteCommand {
    Frame(String, oneshot::Sender<Result<()>>),
    Close(CloseStatus, oneshot::Sender<Result<()>>),
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut commands: mpsc::UnboundedReceiver<WriteCommand>,
    connected: Arc<AtomicBool>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            WriteCommand::Frame(text, done) => match write_frame(&mut writer, &text).await {
                Ok(()) => {
                    let _ = done.send(Ok(()));
                }
                // Rejected before any byte was written; the stream is intact.
                Err(e @ RomError::Protocol { .. }) => {
                    let _ = done.send(Err(e));
                }
                Err(e) => {
                    connected.store(false, Ordering::SeqCst);
                    let _ = done.send(Err(RomError::transport(format!("send failed: {}", e))));
                    break;
                }
            },
            WriteCommand::Close(status, done) => {
                let outcome = write_close_frame(&mut writer, status).await;
                let _ = writer.shutdown().await;
                let _ = done.send(outcome);
                break;
            }
        }
    }
    // Anything still queued fails on its dropped acknowledgement.
    connected.store(false, Ordering::SeqCst);
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    events: mpsc::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
) {
    let status = loop {
        match read_frame(&mut reader).await {
            Ok(Some(Frame::Text(text))) => {
                if events.send(TransportEvent::Frame(text)).await.is_err() {
                    break CloseStatus::Normal;
                }
            }
            Ok(Some(Frame::Close(status))) => break status,
            Ok(None) => break CloseStatus::Abnormal,
            Err(RomError::Protocol { message }) => {
                warn!("Dropping connection on bad frame: {}", message);
                break CloseStatus::ProtocolError;
            }
            Err(e) => {
                debug!("Read failed: {}", e);
                break CloseStatus::Abnormal;
            }
        }
    };
    connected.store(false, Ordering::SeqCst);
    let _ = events.send(TransportEvent::Closed(status)).await;
}

struct TcpSink {
    commands: mpsc::UnboundedSender<WriteCommand>,
    connected: Arc<AtomicBool>,
}

impl TcpSink {
    async fn submit(&self, command: WriteCommand, done: oneshot::Receiver<Result<()>>) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| RomError::NotConnected)?;
        done.await
            .unwrap_or_else(|_| Err(RomError::transport("writer stopped before the frame was sent")))
    }
}

#[async_trait]
impl FrameSink for TcpSink {
    async fn send_text(&self, text: String) -> Result<()> {
        if !self.is_connected() {
            return Err(RomError::NotConnected);
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.submit(WriteCommand::Frame(text, done_tx), done_rx).await
    }

    async fn close(&self, status: CloseStatus) -> Result<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let (done_tx, done_rx) = oneshot::channel();
        match self.submit(WriteCommand::Close(status, done_tx), done_rx).await {
            Err(RomError::NotConnected) => Ok(()),
            other => other,
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
