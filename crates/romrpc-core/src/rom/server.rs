//! The authoritative set of live remote objects.
//!
//! [`RomServer`] resolves references, dispatches methods through the
//! [`TypeRegistry`] and owns the event subscriptions. It is transport
//! agnostic; [`RomRpcHandler`](super::handler::RomRpcHandler) plugs it into a
//! [`JsonRpcServer`](crate::server::JsonRpcServer).

use super::events::{EventEmitter, SubscriptionTable};
use super::flatten::{flatten, ReferenceResolver, Unflattener};
use super::registry::{ObjectContext, ObjectHandle, TypeRegistry};
use crate::config::ProtocolConfig;
use crate::protocol::methods;
use crate::server::ServerSession;
use crate::{Result, RomError};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

/// Wire keys of ROM requests.
pub mod keys {
    pub const TYPE: &str = "type";
    pub const CONSTRUCTOR_PARAMS: &str = "constructorParams";
    pub const OBJECT: &str = "object";
    pub const OPERATION: &str = "operation";
    pub const OPERATION_PARAMS: &str = "operationParams";
    pub const SUBSCRIPTION: &str = "subscription";
    pub const OPERATIONS: &str = "operations";
    pub const ID: &str = "id";
    pub const METHOD: &str = "method";
    pub const PARAMS: &str = "params";
    pub const RESULT: &str = "result";
    pub const ERROR: &str = "error";
}

struct LiveObject {
    handle: ObjectHandle,
    owner: String,
}

pub struct RomServer {
    registry: TypeRegistry,
    objects: RwLock<HashMap<String, LiveObject>>,
    subscriptions: Arc<SubscriptionTable>,
}

impl RomServer {
    pub fn new(registry: TypeRegistry) -> Arc<Self> {
        Arc::new(Self {
            registry,
            objects: RwLock::new(HashMap::new()),
            subscriptions: Arc::new(SubscriptionTable::new()),
        })
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Build an object of `type_name` and store it under a fresh reference.
    pub fn create(
        &self,
        session: &Arc<ServerSession>,
        type_name: &str,
        constructor_params: Option<&Value>,
    ) -> Result<String> {
        let class = self
            .registry
            .class(type_name)
            .ok_or_else(|| RomError::protocol(format!("unknown type '{}'", type_name)))?;
        let decls = class.schema().constructor.as_deref().ok_or_else(|| {
            RomError::protocol(format!("type {} cannot be created", type_name))
        })?;

        let params = Unflattener::new(self)
            .unflatten_params(constructor_params, decls)
            .map_err(as_protocol)?;

        let reference = format!("{}_{}", uuid::Uuid::new_v4(), type_name);
        let ctx = ObjectContext {
            reference: reference.clone(),
            session_id: session.id().to_string(),
            emitter: EventEmitter::new(&reference, &self.subscriptions),
        };
        let instance = class
            .construct(params, &ctx)
            .map_err(|e| RomError::invocation_failed(&format!("{} constructor", type_name), e))?;

        let handle = ObjectHandle::new(reference.clone(), type_name.to_string(), instance);
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                reference.clone(),
                LiveObject {
                    handle,
                    owner: session.id().to_string(),
                },
            );
        debug!("Created {} for session {}", reference, session.id());
        Ok(reference)
    }

    /// Run `operation` on the object behind `object_ref`.
    pub fn invoke(&self, object_ref: &str, operation: &str, params: Option<&Value>) -> Result<Value> {
        let handle = self.lookup(object_ref)?;
        let class = self
            .registry
            .class(handle.type_name())
            .ok_or_else(|| RomError::object_not_found(object_ref))?;
        let (schema, method) = class.method(operation)?;

        let params = Unflattener::new(self)
            .unflatten_params(params, &schema.params)
            .map_err(as_protocol)?;
        let context = format!("{}.{}", handle.type_name(), operation);
        let result = method(&handle, params).map_err(|e| RomError::invocation_failed(&context, e))?;
        flatten(&result, &schema.returns)
    }

    /// Drop an object. Unknown or already released references are fine.
    pub fn release(&self, object_ref: &str) -> bool {
        let removed = self
            .objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(object_ref)
            .is_some();
        if removed {
            let dropped = self.subscriptions.drop_object(object_ref);
            debug!("Released {} ({} subscriptions dropped)", object_ref, dropped);
        }
        removed
    }

    pub fn subscribe(
        &self,
        session: &Arc<ServerSession>,
        object_ref: &str,
        event_type: &str,
    ) -> Result<String> {
        let handle = self.lookup(object_ref)?;
        let declared = self
            .registry
            .class(handle.type_name())
            .map(|class| class.schema().event(event_type).is_some())
            .unwrap_or(false);
        if !declared {
            return Err(RomError::event_not_found(handle.type_name(), event_type));
        }
        Ok(self
            .subscriptions
            .subscribe(object_ref, event_type, session.clone()))
    }

    pub fn unsubscribe(&self, token: &str) -> bool {
        self.subscriptions.unsubscribe(token)
    }

    /// Run the operations of a `transaction` request in order, stopping at
    /// the first failure. The result lists `{id, result}` or `{id, error}`
    /// for each attempted operation; operations after a failure are absent.
    pub fn transaction(&self, session: &Arc<ServerSession>, operations: &Value) -> Result<Value> {
        let operations = operations
            .as_array()
            .ok_or_else(|| RomError::protocol("transaction operations must be an array"))?;

        let mut provisional: HashMap<String, String> = HashMap::new();
        let mut outcomes = Vec::with_capacity(operations.len());
        for op in operations {
            let id = op.get(keys::ID).cloned().unwrap_or(Value::Null);
            let outcome = self.transaction_step(session, op, &mut provisional);
            match outcome {
                Ok(result) => outcomes.push(json!({ (keys::ID): id, (keys::RESULT): result })),
                Err(e) => {
                    debug!("Transaction stopped at operation {}: {}", id, e);
                    outcomes.push(json!({
                        (keys::ID): id,
                        (keys::ERROR): serde_json::to_value(e.to_response_error())?,
                    }));
                    break;
                }
            }
        }
        Ok(Value::Array(outcomes))
    }

    fn transaction_step(
        &self,
        session: &Arc<ServerSession>,
        op: &Value,
        provisional: &mut HashMap<String, String>,
    ) -> Result<Value> {
        let method = op
            .get(keys::METHOD)
            .and_then(Value::as_str)
            .ok_or_else(|| RomError::protocol("transaction operation without a method"))?;
        let params = op
            .get(keys::PARAMS)
            .map(|p| substitute(p, provisional))
            .unwrap_or(Value::Null);

        match method {
            methods::CREATE => {
                let type_name = str_param(&params, keys::TYPE)?;
                let reference =
                    self.create(session, type_name, params.get(keys::CONSTRUCTOR_PARAMS))?;
                if let Some(id) = op.get(keys::ID) {
                    let key = format!("{}{}", ProtocolConfig::PROVISIONAL_REF_PREFIX, id_text(id));
                    provisional.insert(key, reference.clone());
                }
                Ok(Value::String(reference))
            }
            methods::INVOKE => self.invoke(
                str_param(&params, keys::OBJECT)?,
                str_param(&params, keys::OPERATION)?,
                params.get(keys::OPERATION_PARAMS),
            ),
            methods::RELEASE => {
                self.release(str_param(&params, keys::OBJECT)?);
                Ok(Value::Null)
            }
            other => Err(RomError::protocol(format!(
                "'{}' is not allowed inside a transaction",
                other
            ))),
        }
    }

    /// Release everything a closed session created and drop its
    /// subscriptions. Returns the number of released objects.
    pub fn close_session(&self, session_id: &str) -> usize {
        let owned: Vec<String> = self
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, o)| o.owner == session_id)
            .map(|(r, _)| r.clone())
            .collect();
        let released = owned.iter().filter(|r| self.release(r)).count();
        let dropped = self.subscriptions.drop_session(session_id);
        if released > 0 || dropped > 0 {
            info!(
                "Session {} closed: released {} objects, dropped {} subscriptions",
                session_id, released, dropped
            );
        }
        released
    }

    pub fn object_count(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    fn lookup(&self, object_ref: &str) -> Result<ObjectHandle> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(object_ref)
            .map(|o| o.handle.clone())
            .ok_or_else(|| RomError::object_not_found(object_ref))
    }
}

impl ReferenceResolver for RomServer {
    type Object = ObjectHandle;

    fn resolve(&self, reference: &str, type_name: &str) -> Result<ObjectHandle> {
        let handle = self.lookup(reference)?;
        if !type_name.is_empty() && handle.type_name() != type_name {
            return Err(RomError::protocol(format!(
                "{} is a {}, expected {}",
                reference,
                handle.type_name(),
                type_name
            )));
        }
        Ok(handle)
    }
}

/// Unflatten failures surface as protocol errors, whatever their cause.
fn as_protocol(err: RomError) -> RomError {
    match err {
        RomError::Protocol { .. } => err,
        other => RomError::protocol(other.to_string()),
    }
}

pub(crate) fn str_param<'a>(params: &'a Value, name: &str) -> Result<&'a str> {
    params
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| RomError::protocol(format!("missing string parameter '{}'", name)))
}

fn id_text(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replace every provisional reference string with its real reference.
fn substitute(value: &Value, provisional: &HashMap<String, String>) -> Value {
    match value {
        Value::String(s) if s.starts_with(ProtocolConfig::PROVISIONAL_REF_PREFIX) => provisional
            .get(s)
            .map(|real| Value::String(real.clone()))
            .unwrap_or_else(|| value.clone()),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, provisional)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, provisional)))
                .collect::<Map<String, Value>>(),
        ),
        other => other.clone(),
    }
}
