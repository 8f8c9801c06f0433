//! Client-side proxy for one remote object.

use super::builder::ObjectBuilder;
use super::client::{ClientInner, ClientValue, ClientParams, RomClient};
use super::continuation::{spawn_with, Continuation};
use super::events::RemoteEvent;
use super::flatten::ObjectRef;
use crate::{Result, RomError};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// Where a proxy is in its lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyState {
    Live(String),
    /// Queued as a create in an uncommitted transaction.
    Provisional(String),
    Released(String),
    /// Its transaction failed before the object was created.
    RolledBack,
}

struct ProxyInner {
    type_name: String,
    state: Mutex<ProxyState>,
    client: Weak<ClientInner>,
}

/// Handle to a remote object. Clones share state; two proxies are equal only
/// when they are the same instance.
#[derive(Clone)]
pub struct RemoteObject {
    inner: Arc<ProxyInner>,
}

impl RemoteObject {
    fn with_state(state: ProxyState, type_name: &str, client: Weak<ClientInner>) -> Self {
        Self {
            inner: Arc::new(ProxyInner {
                type_name: type_name.to_string(),
                state: Mutex::new(state),
                client,
            }),
        }
    }

    pub(crate) fn live(reference: &str, type_name: &str, client: Weak<ClientInner>) -> Self {
        Self::with_state(ProxyState::Live(reference.to_string()), type_name, client)
    }

    pub(crate) fn provisional(reference: &str, type_name: &str, client: Weak<ClientInner>) -> Self {
        Self::with_state(ProxyState::Provisional(reference.to_string()), type_name, client)
    }

    pub(crate) fn released(reference: &str, type_name: &str, client: Weak<ClientInner>) -> Self {
        Self::with_state(ProxyState::Released(reference.to_string()), type_name, client)
    }

    pub fn type_name(&self) -> &str {
        &self.inner.type_name
    }

    pub fn state(&self) -> ProxyState {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The server reference. Fails locally once released, and while the
    /// object only exists inside an uncommitted transaction.
    pub fn object_ref(&self) -> Result<String> {
        match self.state() {
            ProxyState::Live(reference) => Ok(reference),
            ProxyState::Provisional(reference) => Err(RomError::protocol(format!(
                "{} is pending in an uncommitted transaction",
                reference
            ))),
            ProxyState::Released(reference) => Err(RomError::object_not_found(&reference)),
            ProxyState::RolledBack => Err(RomError::rollback(format!(
                "{} was never created",
                self.type_name()
            ))),
        }
    }

    /// Reference as it may appear inside a transaction: provisional allowed.
    pub(crate) fn wire_ref(&self) -> Result<String> {
        match self.state() {
            ProxyState::Provisional(reference) => Ok(reference),
            _ => self.object_ref(),
        }
    }

    pub fn is_released(&self) -> bool {
        matches!(self.state(), ProxyState::Released(_))
    }

    pub fn is_rolled_back(&self) -> bool {
        matches!(self.state(), ProxyState::RolledBack)
    }

    pub fn ptr_eq(&self, other: &RemoteObject) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn set_state(&self, state: ProxyState) {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Mark dead. Returns the reference if the proxy was live.
    pub(crate) fn mark_released(&self) -> Option<String> {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match &*state {
            ProxyState::Live(reference) => {
                let reference = reference.clone();
                *state = ProxyState::Released(reference.clone());
                Some(reference)
            }
            _ => None,
        }
    }

    pub(crate) fn patch(&self, reference: &str) {
        self.set_state(ProxyState::Live(reference.to_string()));
    }

    pub(crate) fn roll_back(&self) {
        self.set_state(ProxyState::RolledBack);
    }

    fn client(&self) -> Result<RomClient> {
        self.inner
            .client
            .upgrade()
            .map(RomClient::from_inner)
            .ok_or(RomError::Closed)
    }

    pub async fn invoke(&self, method: &str, params: ClientParams) -> Result<ClientValue> {
        self.client()?.invoke(self, method, params).await
    }

    /// Fire-and-forget release. Releasing twice is a no-op.
    pub async fn release(&self) -> Result<()> {
        if self.is_released() {
            return Ok(());
        }
        self.client()?.release(self).await
    }

    /// Subscribe `listener` to `event_type`. Returns the subscription token.
    pub async fn add_listener(
        &self,
        event_type: &str,
        listener: impl Fn(RemoteEvent) + Send + Sync + 'static,
    ) -> Result<String> {
        self.client()?
            .subscribe(self, event_type, Arc::new(listener))
            .await
    }

    pub async fn remove_listener(&self, token: &str) -> Result<()> {
        self.client()?.unsubscribe(token).await
    }

    /// Builder for a declared factory on this type, with this object
    /// already bound as the back-reference parameter.
    pub fn factory(&self, name: &str) -> Result<ObjectBuilder> {
        let client = self.client()?;
        let factory = client
            .class(self.type_name())?
            .factory(name)
            .cloned()
            .ok_or_else(|| RomError::method_not_found(self.type_name(), name))?;
        Ok(client
            .builder(&factory.target_type)?
            .with(factory.back_ref_param, ClientValue::Object(self.clone())))
    }

    pub fn invoke_with(
        &self,
        method: &str,
        params: ClientParams,
        continuation: Continuation<ClientValue>,
    ) {
        let proxy = self.clone();
        let method = method.to_string();
        spawn_with(
            self.runtime().as_ref(),
            async move { proxy.invoke(&method, params).await },
            continuation,
        );
    }

    pub fn release_with(&self, continuation: Continuation<()>) {
        let proxy = self.clone();
        spawn_with(
            self.runtime().as_ref(),
            async move { proxy.release().await },
            continuation,
        );
    }

    pub fn add_listener_with(
        &self,
        event_type: &str,
        listener: impl Fn(RemoteEvent) + Send + Sync + 'static,
        continuation: Continuation<String>,
    ) {
        let proxy = self.clone();
        let event_type = event_type.to_string();
        spawn_with(
            self.runtime().as_ref(),
            async move { proxy.add_listener(&event_type, listener).await },
            continuation,
        );
    }

    fn runtime(&self) -> Option<tokio::runtime::Handle> {
        self.inner
            .client
            .upgrade()
            .and_then(|inner| inner.runtime.clone())
    }
}

impl ObjectRef for RemoteObject {
    fn object_ref(&self) -> Result<String> {
        self.wire_ref()
    }
}

impl PartialEq for RemoteObject {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteObject")
            .field("type_name", &self.inner.type_name)
            .field("state", &self.state())
            .finish()
    }
}
