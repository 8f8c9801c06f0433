//! Client side of the Remote Object Model.
//!
//! [`RomClient`] turns proxy operations into `create` / `invoke` /
//! `release` / `subscribe` requests on a [`Session`], using the declared
//! [`SchemaSet`] to flatten arguments and unflatten results. Inbound
//! `onEvent` notifications are routed by subscription token to listeners on
//! the session's delivery task.

use super::builder::ObjectBuilder;
use super::events::{keys as event_keys, EventListener, ListenerEntry, ListenerTable, RemoteEvent};
use super::flatten::{flatten_params, ReferenceResolver, Unflattener};
use super::objects::ObjectTable;
use super::proxy::RemoteObject;
use super::schema::{MethodSchema, ParamType, RemoteClassSchema, SchemaSet};
use super::server::keys;
use super::transaction::Transaction;
use super::value::{ParamMap, RomValue};
use crate::protocol::{methods, Request};
use crate::session::{Session, SessionListener};
use crate::{Result, RomError};
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Typed value on the client side.
pub type ClientValue = RomValue<RemoteObject>;
/// Named parameters on the client side.
pub type ClientParams = ParamMap<RemoteObject>;

pub(crate) struct ClientInner {
    pub(crate) session: Session,
    pub(crate) schemas: SchemaSet,
    pub(crate) objects: ObjectTable,
    pub(crate) listeners: ListenerTable,
    /// Where continuation-style calls run.
    pub(crate) runtime: Option<Handle>,
}

#[derive(Clone)]
pub struct RomClient {
    inner: Arc<ClientInner>,
}

/// Drops server-side state the client mirrors when the session is replaced.
struct SessionObserver {
    client: Weak<ClientInner>,
}

impl SessionListener for SessionObserver {
    fn reconnected(&self, same_session: bool) {
        if same_session {
            return;
        }
        if let Some(inner) = self.client.upgrade() {
            let listeners = inner.listeners.clear();
            let objects = inner.objects.invalidate_all();
            info!(
                "Server session replaced: dropped {} listeners, invalidated {} proxies",
                listeners, objects
            );
        }
    }
}

impl RomClient {
    /// Wrap `session`. Continuation-style calls run on the runtime current
    /// at construction, if any.
    pub fn new(session: Session, schemas: SchemaSet) -> Self {
        Self::with_runtime(session, schemas, Handle::try_current().ok())
    }

    pub fn with_runtime(session: Session, schemas: SchemaSet, runtime: Option<Handle>) -> Self {
        let inner = Arc::new(ClientInner {
            session,
            schemas,
            objects: ObjectTable::default(),
            listeners: ListenerTable::default(),
            runtime,
        });

        let weak = Arc::downgrade(&inner);
        inner.session.set_notification_handler(move |request| {
            if let Some(inner) = weak.upgrade() {
                RomClient::from_inner(inner).dispatch_notification(request);
            }
        });
        inner.session.add_observer(Arc::new(SessionObserver {
            client: Arc::downgrade(&inner),
        }));

        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<ClientInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<ClientInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn runtime(&self) -> Option<Handle> {
        self.inner.runtime.clone()
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    pub fn schemas(&self) -> &SchemaSet {
        &self.inner.schemas
    }

    pub async fn connect(&self) -> Result<()> {
        self.inner.session.connect().await
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.session.close().await
    }

    /// Number of live proxies.
    pub fn object_count(&self) -> usize {
        self.inner.objects.len()
    }

    /// Number of registered event listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    pub(crate) fn class(&self, type_name: &str) -> Result<&RemoteClassSchema> {
        self.inner
            .schemas
            .class(type_name)
            .ok_or_else(|| RomError::protocol(format!("unknown type '{}'", type_name)))
    }

    pub(crate) fn method_schema(&self, type_name: &str, method: &str) -> Result<&MethodSchema> {
        self.class(type_name)?
            .method(method)
            .ok_or_else(|| RomError::method_not_found(type_name, method))
    }

    /// Params of a `create` request.
    pub(crate) fn create_params(&self, type_name: &str, params: &ClientParams) -> Result<Value> {
        let decls = self.class(type_name)?.constructor.as_deref().ok_or_else(|| {
            RomError::protocol(format!("type {} cannot be created", type_name))
        })?;
        Ok(json!({
            (keys::TYPE): type_name,
            (keys::CONSTRUCTOR_PARAMS): flatten_params(params, decls)?,
        }))
    }

    /// Params of an `invoke` request, with the declared return type.
    pub(crate) fn invoke_params(
        &self,
        reference: &str,
        type_name: &str,
        method: &str,
        params: &ClientParams,
    ) -> Result<(Value, ParamType)> {
        let schema = self.method_schema(type_name, method)?;
        let request = json!({
            (keys::OBJECT): reference,
            (keys::OPERATION): method,
            (keys::OPERATION_PARAMS): flatten_params(params, &schema.params)?,
        });
        Ok((request, schema.returns.clone()))
    }

    /// The proxy a create result refers to.
    pub(crate) fn adopt(&self, type_name: &str, result: &Value) -> Result<RemoteObject> {
        match self.read_value(result, &ParamType::object(type_name))? {
            RomValue::Object(proxy) => Ok(proxy),
            _ => Err(RomError::protocol("create returned no object reference")),
        }
    }

    pub(crate) fn read_value(&self, value: &Value, ty: &ParamType) -> Result<ClientValue> {
        let mut unflattener = Unflattener::new(self);
        let typed = unflattener.unflatten(value, ty)?;
        if !unflattener.diagnostics().is_empty() {
            debug!(
                "Result shape coerced to {}: {:?}",
                ty.describe(),
                unflattener.diagnostics()
            );
        }
        Ok(typed)
    }

    /// Register a proxy patched after a transaction commit.
    pub(crate) fn adopt_proxy(&self, reference: &str, proxy: RemoteObject) {
        self.inner.objects.insert(reference, proxy);
    }

    /// Mark a proxy dead locally and drop its listeners.
    pub(crate) fn forget(&self, proxy: &RemoteObject) -> Option<String> {
        let reference = proxy.mark_released()?;
        self.inner.objects.mark_released(&reference);
        let dropped = self.inner.listeners.remove_object(&reference);
        debug!(
            "Released {} locally ({} listeners dropped)",
            reference,
            dropped.len()
        );
        Some(reference)
    }

    pub async fn create(&self, type_name: &str, params: ClientParams) -> Result<RemoteObject> {
        let request = self.create_params(type_name, &params)?;
        let result = self
            .inner
            .session
            .send_request(methods::CREATE, Some(request))
            .await?;
        self.adopt(type_name, &result)
    }

    pub async fn invoke(
        &self,
        object: &RemoteObject,
        method: &str,
        params: ClientParams,
    ) -> Result<ClientValue> {
        let reference = object.object_ref()?;
        let (request, returns) =
            self.invoke_params(&reference, object.type_name(), method, &params)?;
        let result = self
            .inner
            .session
            .send_request(methods::INVOKE, Some(request))
            .await?;
        self.read_value(&result, &returns)
    }

    /// Fire-and-forget release. The proxy is dead from here on even if the
    /// notification cannot be sent.
    pub async fn release(&self, object: &RemoteObject) -> Result<()> {
        if object.is_released() {
            return Ok(());
        }
        // Rejects provisional and rolled-back proxies.
        object.object_ref()?;
        let Some(reference) = self.forget(object) else {
            return Ok(());
        };
        self.inner
            .session
            .send_notification(methods::RELEASE, Some(json!({ (keys::OBJECT): reference })))
            .await
    }

    /// Subscribe to `event_type` on `object`. Returns the subscription token.
    pub async fn subscribe(
        &self,
        object: &RemoteObject,
        event_type: &str,
        listener: EventListener,
    ) -> Result<String> {
        let reference = object.object_ref()?;
        if self.class(object.type_name())?.event(event_type).is_none() {
            return Err(RomError::event_not_found(object.type_name(), event_type));
        }

        let result = self
            .inner
            .session
            .send_request(
                methods::SUBSCRIBE,
                Some(json!({ (keys::OBJECT): reference, (keys::TYPE): event_type })),
            )
            .await?;
        let token = match self.read_value(&result, &ParamType::String)? {
            RomValue::String(token) => token,
            _ => return Err(RomError::protocol("subscribe returned no token")),
        };

        self.inner.listeners.insert(
            token.clone(),
            ListenerEntry {
                object: reference,
                source: object.clone(),
                event_type: event_type.to_string(),
                listener,
            },
        );
        Ok(token)
    }

    pub async fn unsubscribe(&self, token: &str) -> Result<()> {
        let object = self.inner.listeners.remove(token).map(|e| e.object);
        self.inner
            .session
            .send_request(
                methods::UNSUBSCRIBE,
                Some(json!({ (keys::SUBSCRIPTION): token, (keys::OBJECT): object })),
            )
            .await
            .map(|_| ())
    }

    /// Start a batch of operations sent as one `transaction` message.
    pub fn transaction(&self) -> Transaction {
        Transaction::new(self.clone())
    }

    /// The proxy for a reference learned out of band.
    pub fn object(&self, reference: &str, type_name: &str) -> RemoteObject {
        self.inner
            .objects
            .get_or_insert(reference, type_name, &self.downgrade())
    }

    /// Deferred construction: parameters accumulate locally until `build`.
    pub fn builder(&self, type_name: &str) -> Result<ObjectBuilder> {
        if self.class(type_name)?.constructor.is_none() {
            return Err(RomError::protocol(format!(
                "type {} cannot be created",
                type_name
            )));
        }
        Ok(ObjectBuilder::new(self.clone(), type_name))
    }

    fn dispatch_notification(&self, request: Request) {
        if request.method != methods::ON_EVENT {
            debug!("Ignoring notification {}", request.method);
            return;
        }
        let params = request.params.unwrap_or(Value::Null);
        let Some(token) = params.get(event_keys::SUBSCRIPTION).and_then(Value::as_str) else {
            warn!("onEvent without a subscription token");
            return;
        };
        let Some(entry) = self.inner.listeners.get(token) else {
            debug!("onEvent for unknown subscription {}", token);
            return;
        };
        let event_type = params
            .get(event_keys::TYPE)
            .and_then(Value::as_str)
            .unwrap_or(entry.event_type.as_str())
            .to_string();

        let decls = self
            .inner
            .schemas
            .class(entry.source.type_name())
            .and_then(|class| class.event(&event_type))
            .map(|event| event.data.clone())
            .unwrap_or_default();
        let data = params.get(event_keys::DATA);
        let data = if decls.is_empty() {
            match data.map(|d| self.read_value(d, &ParamType::Any)) {
                Some(Ok(RomValue::Struct(map))) => Ok(map),
                Some(Ok(RomValue::Null)) | None => Ok(ClientParams::new()),
                Some(Ok(other)) => Ok(ClientParams::new().with(event_keys::DATA, other)),
                Some(Err(e)) => Err(e),
            }
        } else {
            Unflattener::new(self).unflatten_params(data, &decls)
        };

        match data {
            Ok(data) => (entry.listener)(RemoteEvent {
                source: entry.source.clone(),
                event_type,
                data,
                subscription: token.to_string(),
            }),
            Err(e) => warn!("Dropping {} event with bad payload: {}", event_type, e),
        }
    }
}

impl ReferenceResolver for RomClient {
    type Object = RemoteObject;

    fn resolve(&self, reference: &str, type_name: &str) -> Result<RemoteObject> {
        Ok(self
            .inner
            .objects
            .get_or_insert(reference, type_name, &self.downgrade()))
    }
}

impl std::fmt::Debug for RomClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RomClient")
            .field("session", &self.inner.session)
            .field("objects", &self.inner.objects.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{ServerOptions, SessionOptions};
    use crate::rom::handler::RomRpcHandler;
    use crate::rom::registry::{ClassBuilder, ServerParams, TypeRegistry};
    use crate::rom::schema::{EventSchema, FactorySchema, ParamDecl};
    use crate::rom::events::EventEmitter;
    use crate::rom::server::RomServer;
    use crate::server::JsonRpcServer;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    pub(crate) struct Widget {
        color: Mutex<String>,
    }

    pub(crate) struct Counter {
        count: AtomicI64,
        emitter: EventEmitter,
    }

    struct Pipeline;

    struct Element {
        pipeline: crate::rom::registry::ObjectHandle,
    }

    pub(crate) fn registry() -> TypeRegistry {
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
                        MethodSchema::new("snapshot").returns(ParamType::Struct(vec![
                            ParamDecl::required("value", ParamType::Integer),
                        ])),
                        |c: &Counter, _| {
                            Ok(RomValue::Struct(
                                ServerParams::new().with("value", c.count.load(Ordering::SeqCst)),
                            ))
                        },
                    )
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
            )
            .register(
                ClassBuilder::new("Pipeline")
                    .constructor(vec![], |_, _| Ok(Pipeline))
                    .factory(FactorySchema::new("element", "Element", "pipeline")),
            )
            .register(
                ClassBuilder::new("Element")
                    .constructor(
                        vec![ParamDecl::required("pipeline", ParamType::object("Pipeline"))],
                        |params, _| {
                            Ok(Element {
                                pipeline: params.object("pipeline")?.clone(),
                            })
                        },
                    )
                    .method(
                        MethodSchema::new("pipeline").returns(ParamType::object("Pipeline")),
                        |e: &Element, _| Ok(RomValue::Object(e.pipeline.clone())),
                    ),
            );
        registry
    }

    /// A connected client talking to an in-process server.
    pub(crate) async fn local_client() -> (RomClient, Arc<RomServer>, Arc<JsonRpcServer>) {
        let registry = registry();
        let schemas = registry.schemas();
        let rom = RomServer::new(registry);
        let server = RomRpcHandler::serve(rom.clone(), ServerOptions::default());
        let session = Session::new(
            server.local_connector(),
            SessionOptions::default()
                .with_request_timeout(Duration::from_secs(2))
                .with_keepalive(None),
        );
        let client = RomClient::new(session, schemas);
        client.connect().await.unwrap();
        (client, rom, server)
    }

    fn widget_params(color: &str) -> ClientParams {
        ClientParams::new().with("color", color)
    }

    #[tokio::test]
    async fn test_widget_scenario() {
        let (client, rom, _server) = local_client().await;

        let widget = client.create("Widget", widget_params("red")).await.unwrap();
        assert_eq!(rom.object_count(), 1);

        let painted = widget.invoke("paint", widget_params("blue")).await.unwrap();
        assert_eq!(painted, RomValue::Bool(true));

        widget.release().await.unwrap();
        assert!(widget.is_released());

        let pending_before = client.session().pending_count();
        let err = widget.invoke("paint", widget_params("green")).await.unwrap_err();
        assert!(err.is_object_not_found());
        assert_eq!(client.session().pending_count(), pending_before);

        // The release notification reaches the server eventually.
        for _ in 0..50 {
            if rom.object_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(rom.object_count(), 0);
    }

    #[tokio::test]
    async fn test_struct_with_lone_value_field_survives_the_wire() {
        let (client, _rom, _server) = local_client().await;
        let counter = client.create("Counter", ClientParams::new()).await.unwrap();
        counter.invoke("increment", ClientParams::new()).await.unwrap();

        let snapshot = counter.invoke("snapshot", ClientParams::new()).await.unwrap();
        let fields = snapshot.as_struct().expect("struct result");
        assert_eq!(fields.i64("value").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_local_validation_never_hits_the_wire() {
        let (client, _rom, _server) = local_client().await;
        assert!(matches!(
            client.create("Gadget", ClientParams::new()).await,
            Err(RomError::Protocol { .. })
        ));
        assert!(matches!(
            client.create("Widget", ClientParams::new()).await,
            Err(RomError::Protocol { .. })
        ));
        let widget = client.create("Widget", widget_params("red")).await.unwrap();
        match widget.invoke("fly", ClientParams::new()).await {
            Err(RomError::ServerObject { message, .. }) => assert!(message.contains("Widget.fly")),
            other => panic!("Expected ServerObject, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_error_is_typed() {
        let (client, _rom, _server) = local_client().await;
        let stale = client.object("gone_Widget", "Widget");
        let err = stale.invoke("color", ClientParams::new()).await.unwrap_err();
        assert!(err.is_object_not_found());
    }

    #[tokio::test]
    async fn test_returned_references_are_deduplicated() {
        let (client, _rom, _server) = local_client().await;
        let pipeline = client.create("Pipeline", ClientParams::new()).await.unwrap();
        let element = pipeline.factory("element").unwrap().build().await.unwrap();

        let back = element.invoke("pipeline", ClientParams::new()).await.unwrap();
        assert!(back.as_object().unwrap().ptr_eq(&pipeline));
        let again = element.invoke("pipeline", ClientParams::new()).await.unwrap();
        assert_eq!(back, again);
    }

    #[tokio::test]
    async fn test_events_reach_listener() {
        let (client, rom, _server) = local_client().await;
        let counter = client.create("Counter", ClientParams::new()).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = counter
            .add_listener("Changed", move |event| {
                let _ = tx.send(event);
            })
            .await
            .unwrap();
        assert_eq!(rom.subscription_count(), 1);

        counter.invoke("increment", ClientParams::new()).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type, "Changed");
        assert_eq!(event.data.i64("count").unwrap(), 1);
        assert!(event.source.ptr_eq(&counter));
        assert_eq!(event.subscription, token);

        counter.remove_listener(&token).await.unwrap();
        assert_eq!(rom.subscription_count(), 0);
        assert_eq!(client.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_undeclared_event_fails_locally() {
        let (client, _rom, _server) = local_client().await;
        let counter = client.create("Counter", ClientParams::new()).await.unwrap();
        assert!(counter.add_listener("Exploded", |_| {}).await.is_err());
    }

    #[tokio::test]
    async fn test_release_drops_listeners() {
        let (client, _rom, _server) = local_client().await;
        let counter = client.create("Counter", ClientParams::new()).await.unwrap();
        counter.add_listener("Changed", |_| {}).await.unwrap();
        assert_eq!(client.listener_count(), 1);
        counter.release().await.unwrap();
        assert_eq!(client.listener_count(), 0);
    }

    #[test]
    fn test_reconnect_to_new_session_invalidates_proxies() {
        let inner = Arc::new(ClientInner {
            session: Session::new(
                crate::transport::TcpConnector::new("127.0.0.1:9".parse().unwrap()),
                SessionOptions::default(),
            ),
            schemas: SchemaSet::new(),
            objects: ObjectTable::default(),
            listeners: ListenerTable::default(),
            runtime: None,
        });
        let client = RomClient::from_inner(inner.clone());
        let proxy = client.object("r1", "Widget");

        let observer = SessionObserver {
            client: Arc::downgrade(&inner),
        };
        observer.reconnected(true);
        assert!(!proxy.is_released());
        observer.reconnected(false);
        assert!(proxy.is_released());
    }
}
