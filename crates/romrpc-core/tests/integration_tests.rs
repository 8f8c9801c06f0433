//! End-to-end tests: a ROM server and client talking over each binding.

use romrpc::rom::{
    ClassBuilder, ClientParams, EventEmitter, EventSchema, MethodSchema, ParamDecl, ParamType,
    RomClient, RomRpcHandler, RomServer, RomValue, ServerParams, TransactionState, TypeRegistry,
};
use romrpc::server::ServerHandle;
use romrpc::{
    router, Connector, HttpConnector, JsonRpcServer, PoolOptions, PooledConnector, RomError,
    ServerOptions, Session, SessionListener, SessionOptions, TcpConnector,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

struct Widget {
    color: Mutex<String>,
}

struct Counter {
    count: AtomicI64,
    emitter: EventEmitter,
}

fn registry() -> TypeRegistry {
    let mut registry = TypeRegistry::new();
    registry
        .register(
            ClassBuilder::new("Widget")
                .constructor(
                    vec![ParamDecl::required("color", ParamType::String)],
                    |params, _| {
                        Ok(Widget {
                            color: Mutex::new(params.str("color")?.to_string()),
                        })
                    },
                )
                .method(
                    MethodSchema::new("paint")
                        .param(ParamDecl::required("color", ParamType::String))
                        .returns(ParamType::Boolean),
                    |w: &Widget, params| {
                        *w.color.lock().unwrap() = params.str("color")?.to_string();
                        Ok(RomValue::Bool(true))
                    },
                )
                .method(
                    MethodSchema::new("color").returns(ParamType::String),
                    |w: &Widget, _| Ok(RomValue::String(w.color.lock().unwrap().clone())),
                ),
        )
        .register(
            ClassBuilder::new("Counter")
                .constructor(vec![], |_, ctx| {
                    Ok(Counter {
                        count: AtomicI64::new(0),
                        emitter: ctx.emitter(),
                    })
                })
                .method(
                    MethodSchema::new("increment").returns(ParamType::Integer),
                    |c: &Counter, _| {
                        let n = c.count.fetch_add(1, Ordering::SeqCst) + 1;
                        c.emitter
                            .emit("Changed", ServerParams::new().with("count", n))?;
                        Ok(RomValue::Int(n))
                    },
                )
                .event(
                    EventSchema::new("Changed")
                        .field(ParamDecl::required("count", ParamType::Integer)),
                ),
        );
    registry
}

fn options() -> SessionOptions {
    SessionOptions::default()
        .with_request_timeout(Duration::from_secs(5))
        .with_reconnect_delay(Duration::from_millis(50))
        .with_keepalive(None)
}

async fn serve() -> (Arc<RomServer>, Arc<JsonRpcServer>) {
    let rom = RomServer::new(registry());
    let server = RomRpcHandler::serve(
        rom.clone(),
        ServerOptions::default().with_long_poll_wait(Duration::from_millis(500)),
    );
    (rom, server)
}

async fn start_tcp(server: &Arc<JsonRpcServer>, addr: SocketAddr) -> ServerHandle {
    server.start_tcp(addr).await.unwrap()
}

async fn start_http(server: Arc<JsonRpcServer>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router(server)).await;
    });
    addr
}

async fn connect<C: Connector>(connector: C) -> RomClient {
    let client = RomClient::new(Session::new(connector, options()), registry().schemas());
    client.connect().await.unwrap();
    client
}

async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn color(name: &str) -> ClientParams {
    ClientParams::new().with("color", name)
}

async fn widget_scenario(client: &RomClient, rom: &RomServer) {
    let widget = client.create("Widget", color("red")).await.unwrap();
    assert!(widget.object_ref().unwrap().ends_with("_Widget"));

    let painted = widget.invoke("paint", color("blue")).await.unwrap();
    assert_eq!(painted, RomValue::Bool(true));
    assert_eq!(
        widget.invoke("color", ClientParams::new()).await.unwrap(),
        RomValue::String("blue".into())
    );

    widget.release().await.unwrap();
    let err = widget.invoke("paint", color("green")).await.unwrap_err();
    assert!(err.is_object_not_found());
    wait_until(|| rom.object_count() == 0).await;
}

#[tokio::test]
async fn test_widget_over_tcp() {
    let (rom, server) = serve().await;
    let handle = start_tcp(&server, "127.0.0.1:0".parse().unwrap()).await;
    let client = connect(TcpConnector::new(handle.addr())).await;
    assert!(client.session().session_id().is_some());

    widget_scenario(&client, &rom).await;
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_widget_over_http() {
    let (rom, server) = serve().await;
    let addr = start_http(server).await;
    let client = connect(
        HttpConnector::new(format!("http://{}", addr))
            .with_long_poll_wait(Duration::from_millis(500)),
    )
    .await;

    widget_scenario(&client, &rom).await;
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_widget_in_process() {
    let (rom, server) = serve().await;
    let client = connect(server.local_connector()).await;
    widget_scenario(&client, &rom).await;
}

#[tokio::test]
async fn test_widget_over_pooled_sockets_survives_server_restart() {
    let (rom, server) = serve().await;
    let handle = start_tcp(&server, "127.0.0.1:0".parse().unwrap()).await;
    let addr = handle.addr();
    let connector = PooledConnector::new(addr, PoolOptions::default());
    let pool = connector.pool().clone();
    let client = connect(connector).await;
    let session_id = client.session().session_id();
    assert!(session_id.is_some());

    let widget = client.create("Widget", color("red")).await.unwrap();
    widget.invoke("paint", color("green")).await.unwrap();

    let tx = client.transaction();
    let second = tx.create("Widget", color("white")).unwrap();
    let painted = tx.invoke(&second, "paint", color("blue")).unwrap();
    tx.commit().await.unwrap();
    assert_eq!(painted.get().await.unwrap(), RomValue::Bool(true));
    assert_eq!(rom.object_count(), 2);
    assert_eq!(pool.idle_count(), 1);

    // The idle socket goes stale when the listener restarts.
    drop(handle);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let _handle = start_tcp(&server, addr).await;

    assert_eq!(
        widget.invoke("color", ClientParams::new()).await.unwrap(),
        RomValue::String("green".into())
    );
    assert_eq!(pool.idle_count(), 1);
    assert_eq!(client.session().session_id(), session_id);

    widget.release().await.unwrap();
    second.release().await.unwrap();
    wait_until(|| rom.object_count() == 0).await;
    assert_eq!(client.session().pending_count(), 0);
}

#[tokio::test]
async fn test_concurrent_requests_share_one_session() {
    let (_rom, server) = serve().await;
    let handle = start_tcp(&server, "127.0.0.1:0".parse().unwrap()).await;
    let client = connect(TcpConnector::new(handle.addr())).await;

    let widgets = futures::future::try_join_all(
        ["red", "green", "blue", "white"]
            .iter()
            .map(|name| client.create("Widget", color(name))),
    )
    .await
    .unwrap();

    let colors = futures::future::try_join_all(
        widgets
            .iter()
            .map(|w| w.invoke("color", ClientParams::new())),
    )
    .await
    .unwrap();
    let colors: Vec<_> = colors.iter().map(|c| c.as_str().unwrap().to_string()).collect();
    assert_eq!(colors, vec!["red", "green", "blue", "white"]);
    assert_eq!(client.session().pending_count(), 0);
}

#[tokio::test]
async fn test_transaction_failure_propagation_over_tcp() {
    let (rom, server) = serve().await;
    let handle = start_tcp(&server, "127.0.0.1:0".parse().unwrap()).await;
    let client = connect(TcpConnector::new(handle.addr())).await;
    let widget = client.create("Widget", color("red")).await.unwrap();

    let tx = client.transaction();
    let first = tx.invoke(&widget, "paint", color("blue")).unwrap();
    let stale = client.object("missing_Widget", "Widget");
    let second = tx.invoke(&stale, "paint", color("green")).unwrap();
    let created = tx.create("Widget", color("white")).unwrap();
    let fourth = tx.invoke(&widget, "color", ClientParams::new()).unwrap();

    assert!(matches!(tx.commit().await, Err(RomError::Rollback { .. })));
    assert_eq!(tx.state(), TransactionState::Committed);
    assert_eq!(first.get().await.unwrap(), RomValue::Bool(true));
    assert!(second.get().await.unwrap_err().is_object_not_found());
    assert!(created.is_rolled_back());
    assert!(matches!(created.object_ref(), Err(RomError::Rollback { .. })));
    assert!(matches!(fourth.get().await, Err(RomError::Rollback { .. })));
    assert_eq!(rom.object_count(), 1);
}

#[tokio::test]
async fn test_events_over_http_long_poll() {
    let (_rom, server) = serve().await;
    let addr = start_http(server).await;
    let client = connect(
        HttpConnector::new(format!("http://{}", addr))
            .with_long_poll_wait(Duration::from_millis(500)),
    )
    .await;

    let counter = client.create("Counter", ClientParams::new()).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    counter
        .add_listener("Changed", move |event| {
            let _ = tx.send(event.data.i64("count").unwrap());
        })
        .await
        .unwrap();

    for _ in 0..3 {
        counter.invoke("increment", ClientParams::new()).await.unwrap();
    }
    let mut seen = Vec::new();
    while seen.len() < 3 {
        let count = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        seen.push(count);
    }
    assert_eq!(seen, vec![1, 2, 3]);
    client.close().await.unwrap();
}

#[derive(Default)]
struct Lifecycle {
    resumed: AtomicUsize,
    replaced: AtomicUsize,
}

impl SessionListener for Lifecycle {
    fn reconnected(&self, same_session: bool) {
        if same_session {
            self.resumed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.replaced.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[tokio::test]
async fn test_reconnect_resumes_session_after_server_restart() {
    let (rom, server) = serve().await;
    let handle = start_tcp(&server, "127.0.0.1:0".parse().unwrap()).await;
    let addr = handle.addr();
    let client = connect(TcpConnector::new(addr)).await;
    let lifecycle = Arc::new(Lifecycle::default());
    client.session().set_listener(lifecycle.clone());

    let widget = client.create("Widget", color("red")).await.unwrap();
    let session_id = client.session().session_id();

    // Restart the listener; the server keeps its session table.
    drop(handle);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let _handle = start_tcp(&server, addr).await;
    wait_until(|| lifecycle.resumed.load(Ordering::SeqCst) == 1).await;

    assert_eq!(client.session().session_id(), session_id);
    assert_eq!(lifecycle.replaced.load(Ordering::SeqCst), 0);
    assert_eq!(
        widget.invoke("color", ClientParams::new()).await.unwrap(),
        RomValue::String("red".into())
    );
    assert_eq!(rom.object_count(), 1);
}
