//! Synchronous facade over [`RomClient`].
//!
//! Each call blocks the calling thread on a runtime handle for at most the
//! configured wait. Calling from inside a runtime thread is refused rather
//! than deadlocking the worker.

use super::builder::ObjectBuilder;
use super::client::{ClientParams, ClientValue, RomClient};
use super::events::RemoteEvent;
use super::proxy::RemoteObject;
use super::schema::SchemaSet;
use super::transaction::Transaction;
use crate::config::{SessionConfig, SessionOptions};
use crate::session::Session;
use crate::transport::Connector;
use crate::{Result, RomError};
use std::future::Future;
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};

pub struct BlockingClient {
    client: RomClient,
    handle: Handle,
    timeout: Duration,
    owned: Option<Runtime>,
}

impl BlockingClient {
    /// Start a private runtime, connect a session through `connector` and
    /// wrap it.
    pub fn connect<C: Connector>(
        connector: C,
        schemas: SchemaSet,
        options: SessionOptions,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("romrpc-blocking")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        // Request timeout plus connect slack bounds each blocking wait.
        let timeout = options.request_timeout + options.connect_timeout;

        let client = {
            let _guard = runtime.enter();
            RomClient::with_runtime(Session::new(connector, options), schemas, Some(handle.clone()))
        };

        let blocking = Self {
            client,
            handle,
            timeout,
            owned: Some(runtime),
        };
        let client = blocking.client.clone();
        blocking.block(async move { client.connect().await })?;
        Ok(blocking)
    }

    /// Wrap an existing client driven by `handle`.
    pub fn new(client: RomClient, handle: Handle) -> Self {
        Self {
            client,
            handle,
            timeout: SessionConfig::REQUEST_TIMEOUT,
            owned: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn client(&self) -> &RomClient {
        &self.client
    }

    fn block<T>(&self, future: impl Future<Output = Result<T>>) -> Result<T> {
        if Handle::try_current().is_ok() {
            return Err(RomError::protocol(
                "blocking call made from inside an async runtime",
            ));
        }
        let timeout = self.timeout;
        self.handle.block_on(async move {
            tokio::time::timeout(timeout, future)
                .await
                .map_err(|_| RomError::Timeout(timeout))?
        })
    }

    pub fn create(&self, type_name: &str, params: ClientParams) -> Result<RemoteObject> {
        self.block(self.client.create(type_name, params))
    }

    pub fn invoke(
        &self,
        object: &RemoteObject,
        method: &str,
        params: ClientParams,
    ) -> Result<ClientValue> {
        self.block(self.client.invoke(object, method, params))
    }

    pub fn release(&self, object: &RemoteObject) -> Result<()> {
        self.block(object.release())
    }

    /// The listener runs on the runtime's delivery task, not the caller's
    /// thread.
    pub fn add_listener(
        &self,
        object: &RemoteObject,
        event_type: &str,
        listener: impl Fn(RemoteEvent) + Send + Sync + 'static,
    ) -> Result<String> {
        self.block(object.add_listener(event_type, listener))
    }

    pub fn remove_listener(&self, object: &RemoteObject, token: &str) -> Result<()> {
        self.block(object.remove_listener(token))
    }

    pub fn builder(&self, type_name: &str) -> Result<ObjectBuilder> {
        self.client.builder(type_name)
    }

    pub fn build(&self, builder: ObjectBuilder) -> Result<RemoteObject> {
        self.block(builder.build())
    }

    pub fn transaction(&self) -> Transaction {
        self.client.transaction()
    }

    pub fn commit(&self, transaction: &Transaction) -> Result<()> {
        self.block(transaction.commit())
    }

    pub fn close(&self) -> Result<()> {
        self.block(self.client.close())
    }
}

impl Drop for BlockingClient {
    fn drop(&mut self) {
        if let Some(runtime) = self.owned.take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for BlockingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingClient")
            .field("client", &self.client)
            .field("timeout", &self.timeout)
            .field("owns_runtime", &self.owned.is_some())
            .finish()
    }
}
