//! Maps the ROM verbs onto a [`RomServer`].

use super::server::{keys, str_param, RomServer};
use crate::config::ServerOptions;
use crate::protocol::methods;
use crate::server::{CallContext, JsonRpcServer, RpcHandler};
use crate::{Result, RomError};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

pub struct RomRpcHandler {
    rom: Arc<RomServer>,
}

impl RomRpcHandler {
    pub fn new(rom: Arc<RomServer>) -> Self {
        Self { rom }
    }

    pub fn rom(&self) -> &Arc<RomServer> {
        &self.rom
    }

    /// A JSON-RPC server dispatching to `rom`.
    pub fn serve(rom: Arc<RomServer>, options: ServerOptions) -> Arc<JsonRpcServer> {
        JsonRpcServer::new(Arc::new(Self::new(rom)), options)
    }
}

#[async_trait]
impl RpcHandler for RomRpcHandler {
    async fn handle(&self, ctx: &CallContext, method: &str, params: Option<Value>) -> Result<Value> {
        let params = params.unwrap_or(Value::Null);
        match method {
            methods::CREATE => self
                .rom
                .create(
                    &ctx.session,
                    str_param(&params, keys::TYPE)?,
                    params.get(keys::CONSTRUCTOR_PARAMS),
                )
                .map(Value::String),
            methods::INVOKE => self.rom.invoke(
                str_param(&params, keys::OBJECT)?,
                str_param(&params, keys::OPERATION)?,
                params.get(keys::OPERATION_PARAMS),
            ),
            methods::RELEASE => {
                self.rom.release(str_param(&params, keys::OBJECT)?);
                Ok(Value::Null)
            }
            methods::SUBSCRIBE => self
                .rom
                .subscribe(
                    &ctx.session,
                    str_param(&params, keys::OBJECT)?,
                    str_param(&params, keys::TYPE)?,
                )
                .map(Value::String),
            methods::UNSUBSCRIBE => Ok(Value::Bool(
                self.rom
                    .unsubscribe(str_param(&params, keys::SUBSCRIPTION)?),
            )),
            methods::TRANSACTION => {
                let operations = params
                    .get(keys::OPERATIONS)
                    .ok_or_else(|| RomError::protocol("transaction without operations"))?;
                self.rom.transaction(&ctx.session, operations)
            }
            other => Err(RomError::unknown_method(other)),
        }
    }

    async fn session_closed(&self, session_id: &str) {
        self.rom.close_session(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;
    use crate::rom::registry::{ClassBuilder, TypeRegistry};
    use crate::server::{Binding, SessionRegistry};
    use crate::protocol::{codec, Request};
    use serde_json::json;
    use std::time::Duration;

    struct Thing;

    fn handler() -> RomRpcHandler {
        let mut registry = TypeRegistry::new();
        registry.register(ClassBuilder::new("Thing").constructor(vec![], |_, _| Ok(Thing)));
        RomRpcHandler::new(RomServer::new(registry))
    }

    fn ctx() -> CallContext {
        CallContext {
            session: SessionRegistry::new(Duration::from_secs(60)).get_or_create(None).0,
        }
    }

    #[tokio::test]
    async fn test_verbs_dispatch() {
        let h = handler();
        let ctx = ctx();
        let reference = h
            .handle(&ctx, "create", Some(json!({"type": "Thing"})))
            .await
            .unwrap();
        let reference = reference.as_str().unwrap().to_string();
        assert_eq!(h.rom().object_count(), 1);

        h.handle(&ctx, "release", Some(json!({"object": reference})))
            .await
            .unwrap();
        assert_eq!(h.rom().object_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_verb_parameter_is_protocol_error() {
        let h = handler();
        assert!(matches!(
            h.handle(&ctx(), "invoke", Some(json!({"operation": "x"}))).await,
            Err(RomError::Protocol { .. })
        ));
        assert!(matches!(
            h.handle(&ctx(), "create", None).await,
            Err(RomError::Protocol { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_verb_over_the_server() {
        let server = RomRpcHandler::serve(handler().rom().clone(), ServerOptions::default());
        let text = codec::encode(&Request::new(1, "teleport", None).into()).unwrap();
        let reply = server.handle_frame(&text, &Binding::Mailbox).await.unwrap();
        let response = codec::decode_response(&reply).unwrap();
        assert_eq!(response.error_ref().unwrap().code, codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_closing_session_releases_objects() {
        let h = handler();
        let ctx = ctx();
        h.handle(&ctx, "create", Some(json!({"type": "Thing"})))
            .await
            .unwrap();
        h.session_closed(ctx.session_id()).await;
        assert_eq!(h.rom().object_count(), 0);
    }
}
