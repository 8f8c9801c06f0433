//! Deferred construction of remote objects.

use super::client::{ClientParams, ClientValue, RomClient};
use super::continuation::{spawn_with, Continuation};
use super::proxy::RemoteObject;
use super::transaction::Transaction;
use crate::Result;

/// Accumulates constructor parameters locally; nothing is sent until
/// [`build`](Self::build) or [`build_in`](Self::build_in).
#[derive(Debug)]
pub struct ObjectBuilder {
    client: RomClient,
    type_name: String,
    params: ClientParams,
}

impl ObjectBuilder {
    pub(crate) fn new(client: RomClient, type_name: &str) -> Self {
        Self {
            client,
            type_name: type_name.to_string(),
            params: ClientParams::new(),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn params(&self) -> &ClientParams {
        &self.params
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<ClientValue>) -> Self {
        self.params.insert(name, value);
        self
    }

    pub async fn build(self) -> Result<RemoteObject> {
        self.client.create(&self.type_name, self.params).await
    }

    pub fn build_with(self, continuation: Continuation<RemoteObject>) {
        let runtime = self.client.runtime();
        spawn_with(runtime.as_ref(), self.build(), continuation);
    }

    /// Queue the create in `transaction`. The returned proxy is provisional
    /// until the transaction commits.
    pub fn build_in(self, transaction: &Transaction) -> Result<RemoteObject> {
        transaction.create(&self.type_name, self.params)
    }
}

#[cfg(test)]
mod tests {
    use crate::rom::client::tests::local_client;
    use crate::rom::client::ClientParams;
    use crate::rom::continuation::Continuation;
    use crate::rom::value::RomValue;
    use crate::RomError;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_builder_sends_nothing_until_build() {
        let (client, rom, _server) = local_client().await;
        let builder = client.builder("Widget").unwrap().with("color", "red");
        assert_eq!(rom.object_count(), 0);
        assert_eq!(builder.params().str("color").unwrap(), "red");

        let widget = builder.build().await.unwrap();
        assert_eq!(rom.object_count(), 1);
        assert_eq!(
            widget.invoke("color", ClientParams::new()).await.unwrap(),
            RomValue::String("red".into())
        );
    }

    #[tokio::test]
    async fn test_factory_binds_back_reference() {
        let (client, _rom, _server) = local_client().await;
        let pipeline = client.create("Pipeline", ClientParams::new()).await.unwrap();
        let builder = pipeline.factory("element").unwrap();
        assert_eq!(builder.type_name(), "Element");
        assert!(builder
            .params()
            .object("pipeline")
            .unwrap()
            .ptr_eq(&pipeline));
        assert!(pipeline.factory("nope").is_err());
    }

    #[tokio::test]
    async fn test_build_with_continuation() {
        let (client, _rom, _server) = local_client().await;
        let (tx, rx) = oneshot::channel();
        client
            .builder("Widget")
            .unwrap()
            .with("color", "red")
            .build_with(Continuation::from_fn(move |result| {
                let _ = tx.send(result);
            }));
        let widget = rx.await.unwrap().unwrap();
        assert_eq!(widget.type_name(), "Widget");
    }

    #[tokio::test]
    async fn test_unknown_type_has_no_builder() {
        let (client, _rom, _server) = local_client().await;
        assert!(matches!(
            client.builder("Gadget"),
            Err(RomError::Protocol { .. })
        ));
    }
}
