//! Event plumbing on both sides of the wire.
//!
//! Server: [`SubscriptionTable`] fans an event raised by an object out to
//! every session subscribed to it, as `onEvent` notifications.
//! Client: [`ListenerTable`] maps subscription tokens back to callbacks.

use super::flatten::flatten;
use super::proxy::RemoteObject;
use super::registry::ServerParams;
use super::schema::ParamType;
use super::value::{ParamMap, RomValue};
use crate::protocol::{codec, methods, Request};
use crate::server::ServerSession;
use crate::{Result, RomError};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tracing::{debug, warn};

/// Wire keys of an `onEvent` notification.
pub mod keys {
    pub const OBJECT: &str = "object";
    pub const TYPE: &str = "type";
    pub const DATA: &str = "data";
    pub const SUBSCRIPTION: &str = "subscription";
}

struct Subscription {
    object: String,
    event_type: String,
    session: Arc<ServerSession>,
}

/// Server-side subscriptions by token.
#[derive(Default)]
pub struct SubscriptionTable {
    subscriptions: RwLock<HashMap<String, Subscription>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, object: &str, event_type: &str, session: Arc<ServerSession>) -> String {
        let token = uuid::Uuid::new_v4().to_string();
        debug!(
            "Session {} subscribed to {}.{} as {}",
            session.id(),
            object,
            event_type,
            token
        );
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                token.clone(),
                Subscription {
                    object: object.to_string(),
                    event_type: event_type.to_string(),
                    session,
                },
            );
        token
    }

    pub fn unsubscribe(&self, token: &str) -> bool {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token)
            .is_some()
    }

    /// Drop every subscription on `object`.
    pub fn drop_object(&self, object: &str) -> usize {
        self.retain(|s| s.object != object)
    }

    /// Drop every subscription held by `session_id`.
    pub fn drop_session(&self, session_id: &str) -> usize {
        self.retain(|s| s.session.id() != session_id)
    }

    fn retain(&self, keep: impl Fn(&Subscription) -> bool) -> usize {
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscriptions.len();
        subscriptions.retain(|_, s| keep(s));
        before - subscriptions.len()
    }

    pub fn len(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push an event to every matching subscriber. Returns how many
    /// notifications were queued.
    ///
    /// Every subscriber is attempted. If any push fails the whole call fails
    /// with a transport error naming the sessions that missed the event.
    pub fn publish(&self, object: &str, event_type: &str, data: &Value) -> Result<usize> {
        let targets: Vec<(String, Arc<ServerSession>)> = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, s)| s.object == object && s.event_type == event_type)
            .map(|(token, s)| (token.clone(), s.session.clone()))
            .collect();

        let mut delivered = 0;
        let mut missed = Vec::new();
        for (token, session) in targets {
            let notification = Request::notification(
                methods::ON_EVENT,
                Some(json!({
                    (keys::OBJECT): object,
                    (keys::TYPE): event_type,
                    (keys::DATA): data,
                    (keys::SUBSCRIPTION): token,
                })),
            );
            match session.push(codec::encode(&notification.into())?) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        "Event {}.{} not delivered to session {}: {}",
                        object,
                        event_type,
                        session.id(),
                        e
                    );
                    missed.push(format!("{} ({})", session.id(), e));
                }
            }
        }
        if !missed.is_empty() {
            return Err(RomError::transport(format!(
                "event {}.{} reached {} subscriber(s), missed: {}",
                object,
                event_type,
                delivered,
                missed.join(", ")
            )));
        }
        Ok(delivered)
    }
}

/// Raises events for one server-side object.
#[derive(Clone)]
pub struct EventEmitter {
    object: String,
    table: Weak<SubscriptionTable>,
}

impl EventEmitter {
    pub(crate) fn new(object: &str, table: &Arc<SubscriptionTable>) -> Self {
        Self {
            object: object.to_string(),
            table: Arc::downgrade(table),
        }
    }

    /// An emitter that delivers nowhere.
    pub(crate) fn detached(object: &str) -> Self {
        Self {
            object: object.to_string(),
            table: Weak::new(),
        }
    }

    pub fn object_ref(&self) -> &str {
        &self.object
    }

    /// Raise `event_type` with `data`. Returns how many subscribers were
    /// notified; zero once the server is gone.
    pub fn emit(&self, event_type: &str, data: ServerParams) -> Result<usize> {
        let Some(table) = self.table.upgrade() else {
            return Ok(0);
        };
        let data = flatten(&RomValue::Struct(data), &ParamType::Any)?;
        table.publish(&self.object, event_type, &data)
    }
}

/// An event delivered to a client-side listener.
#[derive(Debug, Clone)]
pub struct RemoteEvent {
    pub source: RemoteObject,
    pub event_type: String,
    pub data: ParamMap<RemoteObject>,
    pub subscription: String,
}

/// Client-side event callback.
pub type EventListener = Arc<dyn Fn(RemoteEvent) + Send + Sync>;

#[derive(Clone)]
pub(crate) struct ListenerEntry {
    pub(crate) object: String,
    pub(crate) source: RemoteObject,
    pub(crate) event_type: String,
    pub(crate) listener: EventListener,
}

/// Client-side subscription tokens to listeners.
#[derive(Default)]
pub(crate) struct ListenerTable {
    entries: Mutex<HashMap<String, ListenerEntry>>,
}

impl ListenerTable {
    pub(crate) fn insert(&self, token: String, entry: ListenerEntry) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token, entry);
    }

    pub(crate) fn get(&self, token: &str) -> Option<ListenerEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
            .cloned()
    }

    pub(crate) fn remove(&self, token: &str) -> Option<ListenerEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token)
    }

    /// Remove every listener on `object`, returning their tokens.
    pub(crate) fn remove_object(&self, object: &str) -> Vec<String> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let tokens: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.object == object)
            .map(|(t, _)| t.clone())
            .collect();
        for token in &tokens {
            entries.remove(token);
        }
        tokens
    }

    pub(crate) fn clear(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let n = entries.len();
        entries.clear();
        n
    }

    pub(crate) fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
