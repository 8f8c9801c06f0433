//! JSON-RPC server core: session resolution, dispatch, and the framed-TCP
//! and in-process bindings.
//!
//! # Thread Safety
//!
//! Each connection runs in its own task, and each inbound frame is dispatched
//! on a task of its own, so a slow call never blocks the connection reader.
//! The [`RpcHandler`] must tolerate concurrent calls for different sessions
//! and different objects.

use super::sessions::{ServerSession, SessionRegistry};
use crate::config::{ServerConfig, ServerOptions};
use crate::error::{codes, types};
use crate::protocol::{
    codec, methods, read_frame, write_close_frame, write_frame, CloseStatus, Frame, Message,
    Request, Response, ResponseError,
};
use crate::transport::{LocalAcceptor, LocalConnector, TransportEvent};
use crate::{Result, RomError};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Per-call context handed to the [`RpcHandler`].
#[derive(Clone)]
pub struct CallContext {
    pub session: Arc<ServerSession>,
}

impl CallContext {
    pub fn session_id(&self) -> &str {
        self.session.id()
    }
}

/// Application-level method dispatch.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    /// Handle one request. `keepAlive` and `poll` never reach the handler.
    async fn handle(&self, ctx: &CallContext, method: &str, params: Option<Value>)
        -> Result<Value>;

    /// Called once when a session is closed or swept.
    async fn session_closed(&self, _session_id: &str) {}
}

/// Where replies and pushes for the current frame should go.
pub enum Binding {
    /// A stream connection's outbound queue.
    Stream(mpsc::Sender<String>),
    /// The session's long-poll mailbox.
    Mailbox,
}

/// Handle to a running TCP listener. Dropping shuts it down.
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting and tell every connection to close with `GoingAway`.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

pub struct JsonRpcServer {
    handler: Arc<dyn RpcHandler>,
    registry: Arc<SessionRegistry>,
    options: ServerOptions,
}

impl JsonRpcServer {
    /// Create the server and start its session sweeper.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(handler: Arc<dyn RpcHandler>, options: ServerOptions) -> Arc<Self> {
        let server = Arc::new(Self {
            handler,
            registry: Arc::new(SessionRegistry::new(options.session_idle_timeout)),
            options,
        });
        tokio::spawn(sweep_loop(
            Arc::downgrade(&server),
            server.options.sweep_interval,
        ));
        server
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Close a session and let the handler release what it owned.
    pub async fn close_session(&self, session_id: &str) -> bool {
        if self.registry.close(session_id).is_some() {
            self.handler.session_closed(session_id).await;
            true
        } else {
            false
        }
    }

    /// Close idle sessions. Returns how many were closed.
    pub async fn sweep(&self) -> usize {
        let closed = self.registry.sweep();
        for id in &closed {
            info!("Session {} expired", id);
            self.handler.session_closed(id).await;
        }
        closed.len()
    }

    /// Process one inbound message and return the reply text, if any.
    pub async fn handle_frame(&self, text: &str, binding: &Binding) -> Option<String> {
        let request = match codec::decode(text) {
            Ok(Message::Request(request)) => request,
            Ok(Message::Response(response)) => {
                debug!("Ignoring client response (id={:?})", response.id);
                return None;
            }
            Err(e) => {
                let code = if serde_json::from_str::<Value>(text).is_err() {
                    codes::PARSE_ERROR
                } else {
                    codes::INVALID_REQUEST
                };
                warn!("Rejecting malformed message: {}", e);
                let reply = Response::error(
                    None,
                    ResponseError::new(code, e.to_string()).with_type(types::PROTOCOL),
                );
                return encode_reply(reply);
            }
        };

        let (session, _) = self.registry.get_or_create(request.session_id.as_deref());
        session.touch();
        match binding {
            Binding::Stream(tx) => session.bind(tx),
            Binding::Mailbox => session.bind_mailbox(),
        }

        self.dispatch(session, request).await
    }

    async fn dispatch(&self, session: Arc<ServerSession>, request: Request) -> Option<String> {
        debug!(
            "<- {} (id={:?}, session={})",
            request.method,
            request.id,
            session.id()
        );
        let outcome = match request.method.as_str() {
            methods::KEEP_ALIVE => Ok(json!({})),
            methods::POLL => Err(RomError::protocol(
                "poll is only valid over the HTTP binding",
            )),
            method => {
                let ctx = CallContext {
                    session: session.clone(),
                };
                self.handler.handle(&ctx, method, request.params).await
            }
        };

        if request.id.is_none() {
            if let Err(e) = outcome {
                warn!("Notification '{}' failed: {}", request.method, e);
            }
            return None;
        }

        let reply = match outcome {
            Ok(result) => Response::success(request.id, result),
            Err(e) => {
                debug!("'{}' failed: {}", request.method, e);
                Response::error(request.id, e.to_response_error())
            }
        };
        encode_reply(reply.with_session_id(Some(session.id().to_string())))
    }

    /// Answer a long-poll request: take the client's replies, then park until
    /// server messages are queued or the long-poll wait elapses.
    pub async fn handle_poll(&self, request: Request) -> Option<String> {
        let session = match request
            .session_id
            .as_deref()
            .and_then(|id| self.registry.resume(id))
        {
            Some(session) => session,
            None => {
                let reply = Response::error(
                    request.id,
                    ResponseError::new(codes::INVALID_SESSION, "unknown or expired session"),
                );
                return encode_reply(reply);
            }
        };
        session.touch();
        session.bind_mailbox();

        if let Some(Value::Array(replies)) = &request.params {
            for reply in replies {
                debug!("Ignoring client reply in poll: {}", reply);
            }
        }

        let messages = session.poll(self.options.long_poll_wait).await;
        session.touch();
        let items: Vec<Value> = messages
            .iter()
            .filter_map(|m| serde_json::from_str(m).ok())
            .collect();
        let reply = Response::success(request.id, Value::Array(items))
            .with_session_id(Some(session.id().to_string()));
        encode_reply(reply)
    }

    /// Start the framed-TCP listener.
    pub async fn start_tcp(self: &Arc<Self>, addr: SocketAddr) -> Result<ServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        info!("JSON-RPC server listening on tcp://{}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(accept_loop(
            self.clone(),
            listener,
            shutdown_rx,
            conn_shutdown_rx,
            active_connections,
        ));

        Ok(ServerHandle {
            addr,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    /// A connector that reaches this server through an in-process channel.
    pub fn local_connector(self: &Arc<Self>) -> LocalConnector {
        LocalConnector::new(Arc::new(LocalEndpoint {
            server: self.clone(),
        }))
    }
}

fn encode_reply(reply: Response) -> Option<String> {
    match codec::encode(&reply.into()) {
        Ok(text) => Some(text),
        Err(e) => {
            error!("Failed to encode reply: {}", e);
            None
        }
    }
}

async fn sweep_loop(server: Weak<JsonRpcServer>, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(server) = server.upgrade() else {
            return;
        };
        server.sweep().await;
    }
}

async fn accept_loop(
    server: Arc<JsonRpcServer>,
    listener: TcpListener,
    mut shutdown_rx: oneshot::Receiver<()>,
    conn_shutdown_rx: watch::Receiver<bool>,
    active_connections: Arc<AtomicUsize>,
) {
    let max_connections = server.options.max_connections;
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                info!("JSON-RPC server shutting down");
                break;
            }
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((mut stream, peer_addr)) => {
                        let current = active_connections.load(Ordering::Relaxed);
                        if current >= max_connections {
                            warn!(
                                "Rejecting connection from {}: at max capacity ({})",
                                peer_addr, max_connections
                            );
                            tokio::spawn(async move {
                                let _ = write_close_frame(&mut stream, CloseStatus::PolicyViolation).await;
                            });
                            continue;
                        }

                        active_connections.fetch_add(1, Ordering::Relaxed);
                        let server = server.clone();
                        let conns = active_connections.clone();
                        let conn_shutdown = conn_shutdown_rx.clone();

                        tokio::spawn(async move {
                            debug!("Connection from {}", peer_addr);
                            if let Err(e) = handle_connection(stream, server, conn_shutdown).await {
                                debug!("Connection {} ended: {}", peer_addr, e);
                            }
                            conns.fetch_sub(1, Ordering::Relaxed);
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    server: Arc<JsonRpcServer>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<String>(ServerConfig::OUTBOUND_QUEUE_CAPACITY);
    let (close_tx, mut close_rx) = oneshot::channel::<CloseStatus>();
    let mut close_tx = Some(close_tx);

    let writer_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                next = rx.recv() => match next {
                    Some(text) => {
                        if let Err(e) = write_frame(&mut writer, &text).await {
                            debug!("Write failed: {}", e);
                            return;
                        }
                    }
                    None => return,
                },
                status = &mut close_rx => {
                    if let Ok(status) = status {
                        let _ = write_close_frame(&mut writer, status).await;
                    }
                    return;
                }
            }
        }
    });

    let outcome = loop {
        let frame = tokio::select! {
            result = read_frame(&mut reader) => result,
            _ = shutdown_rx.changed() => {
                if let Some(close) = close_tx.take() {
                    let _ = close.send(CloseStatus::GoingAway);
                }
                break Ok(());
            }
        };
        match frame {
            Ok(Some(Frame::Text(text))) => {
                let server = server.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let binding = Binding::Stream(tx.clone());
                    if let Some(reply) = server.handle_frame(&text, &binding).await {
                        let _ = tx.send(reply).await;
                    }
                });
            }
            Ok(Some(Frame::Close(status))) => {
                debug!("Peer closed: {}", status);
                break Ok(());
            }
            Ok(None) => break Ok(()),
            Err(e @ RomError::Protocol { .. }) => {
                if let Some(close) = close_tx.take() {
                    let _ = close.send(CloseStatus::ProtocolError);
                }
                break Err(e);
            }
            Err(e) => break Err(e),
        }
    };

    // Sessions may still hold a sender, so the writer is stopped through the
    // close channel rather than by draining its queue.
    drop(close_tx);
    drop(tx);
    let mut writer_task = writer_task;
    if tokio::time::timeout(std::time::Duration::from_millis(200), &mut writer_task)
        .await
        .is_err()
    {
        debug!("Writer did not finish in time");
        writer_task.abort();
    }
    outcome
}

struct LocalEndpoint {
    server: Arc<JsonRpcServer>,
}

impl LocalAcceptor for LocalEndpoint {
    fn accept(&self, mut inbound: mpsc::Receiver<String>, outbound: mpsc::Sender<TransportEvent>) {
        let server = self.server.clone();
        tokio::spawn(async move {
            let (tx, mut rx) = mpsc::channel::<String>(ServerConfig::OUTBOUND_QUEUE_CAPACITY);
            let forward_to = outbound.clone();
            let forwarder = tokio::spawn(async move {
                while let Some(text) = rx.recv().await {
                    if forward_to.send(TransportEvent::Frame(text)).await.is_err() {
                        return;
                    }
                }
            });

            while let Some(text) = inbound.recv().await {
                let server = server.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let binding = Binding::Stream(tx.clone());
                    if let Some(reply) = server.handle_frame(&text, &binding).await {
                        let _ = tx.send(reply).await;
                    }
                });
            }
            forwarder.abort();
            debug!("Local connection closed");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Request;

    struct EchoHandler;

    #[async_trait]
    impl RpcHandler for EchoHandler {
        async fn handle(
            &self,
            ctx: &CallContext,
            method: &str,
            params: Option<Value>,
        ) -> Result<Value> {
            match method {
                "echo" => Ok(params.unwrap_or(Value::Null)),
                "whoami" => Ok(json!(ctx.session_id())),
                "push" => {
                    let note = Request::notification("onEvent", params);
                    let sent = ctx.session.push(codec::encode(&note.into())?).is_ok();
                    Ok(json!(sent))
                }
                "fail" => Err(RomError::object_not_found("w-9")),
                other => Err(RomError::unknown_method(other)),
            }
        }
    }

    fn server() -> Arc<JsonRpcServer> {
        JsonRpcServer::new(Arc::new(EchoHandler), ServerOptions::default())
    }

    async fn call(stream: &mut TcpStream, request: Request) -> Response {
        let text = codec::encode(&request.into()).unwrap();
        write_frame(stream, &text).await.unwrap();
        loop {
            match read_frame(stream).await.unwrap() {
                Some(Frame::Text(reply)) => {
                    if let Ok(Message::Response(r)) = codec::decode(&reply) {
                        return r;
                    }
                }
                other => panic!("unexpected frame: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_server_start_and_shutdown() {
        let mut handle = server()
            .start_tcp("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert!(handle.addr().port() > 0);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_session_assigned_and_resumed() {
        let server = server();
        let handle = server.start_tcp("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();

        let first = call(&mut stream, Request::new(1, "keepAlive", None)).await;
        let sid = first.session_id.clone().unwrap();

        let second = call(
            &mut stream,
            Request::new(2, "whoami", None).with_session_id(Some(sid.clone())),
        )
        .await;
        assert_eq!(second.result(), Some(&json!(sid)));
        assert_eq!(second.session_id.as_deref(), Some(sid.as_str()));
        assert_eq!(server.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_error_response_carries_code_and_type() {
        let server = server();
        let handle = server.start_tcp("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();

        let reply = call(&mut stream, Request::new(1, "fail", None)).await;
        let err = reply.error_ref().unwrap();
        assert_eq!(err.code, codes::OBJECT_NOT_FOUND);
        assert_eq!(err.error_type.as_deref(), Some(types::OBJECT_NOT_FOUND));

        let reply = call(&mut stream, Request::new(2, "nope", None)).await;
        assert_eq!(reply.error_ref().unwrap().code, codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_json_returns_parse_error() {
        let server = server();
        let handle = server.start_tcp("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();

        write_frame(&mut stream, "not valid json").await.unwrap();
        let reply = match read_frame(&mut stream).await.unwrap() {
            Some(Frame::Text(text)) => codec::decode_response(&text).unwrap(),
            other => panic!("unexpected frame: {:?}", other),
        };
        assert_eq!(reply.error_ref().unwrap().code, codes::PARSE_ERROR);

        write_frame(&mut stream, r#"{"jsonrpc":"2.0","id":1}"#).await.unwrap();
        let reply = match read_frame(&mut stream).await.unwrap() {
            Some(Frame::Text(text)) => codec::decode_response(&text).unwrap(),
            other => panic!("unexpected frame: {:?}", other),
        };
        assert_eq!(reply.error_ref().unwrap().code, codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_push_reaches_bound_connection() {
        let server = server();
        let handle = server.start_tcp("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();

        let text = codec::encode(&Request::new(1, "push", Some(json!({"n": 1}))).into()).unwrap();
        write_frame(&mut stream, &text).await.unwrap();

        let mut saw_note = false;
        let mut saw_reply = false;
        while !(saw_note && saw_reply) {
            match read_frame(&mut stream).await.unwrap() {
                Some(Frame::Text(text)) => match codec::decode(&text).unwrap() {
                    Message::Request(note) => {
                        assert_eq!(note.method, "onEvent");
                        saw_note = true;
                    }
                    Message::Response(reply) => {
                        assert_eq!(reply.result(), Some(&json!(true)));
                        saw_reply = true;
                    }
                },
                other => panic!("unexpected frame: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_shutdown_sends_going_away() {
        let server = server();
        let mut handle = server.start_tcp("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
        let _ = call(&mut stream, Request::new(1, "keepAlive", None)).await;

        handle.shutdown();
        let frame = read_frame(&mut stream).await.unwrap();
        assert_eq!(frame, Some(Frame::Close(CloseStatus::GoingAway)));
    }

    #[tokio::test]
    async fn test_max_connections_rejects_with_policy_violation() {
        let server = JsonRpcServer::new(
            Arc::new(EchoHandler),
            ServerOptions::default().with_max_connections(1),
        );
        let handle = server.start_tcp("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut first = TcpStream::connect(handle.addr()).await.unwrap();
        let _ = call(&mut first, Request::new(1, "keepAlive", None)).await;

        let mut second = TcpStream::connect(handle.addr()).await.unwrap();
        let frame = read_frame(&mut second).await.unwrap();
        assert_eq!(frame, Some(Frame::Close(CloseStatus::PolicyViolation)));
    }

    #[tokio::test]
    async fn test_close_session_notifies_handler() {
        use std::sync::Mutex;

        struct Recording(Mutex<Vec<String>>);

        #[async_trait]
        impl RpcHandler for Recording {
            async fn handle(&self, _: &CallContext, _: &str, _: Option<Value>) -> Result<Value> {
                Ok(Value::Null)
            }
            async fn session_closed(&self, session_id: &str) {
                self.0.lock().unwrap().push(session_id.to_string());
            }
        }

        let handler = Arc::new(Recording(Mutex::new(Vec::new())));
        let server = JsonRpcServer::new(handler.clone(), ServerOptions::default());
        let (session, _) = server.registry().get_or_create(None);

        assert!(server.close_session(session.id()).await);
        assert!(!server.close_session(session.id()).await);
        assert_eq!(*handler.0.lock().unwrap(), vec![session.id().to_string()]);
    }
}
