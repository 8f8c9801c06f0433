//! JSON-RPC server: session registry, dispatch and server-side bindings.

pub mod http;
pub mod rpc;
pub mod sessions;

pub use http::router;
pub use rpc::{Binding, CallContext, JsonRpcServer, RpcHandler, ServerHandle};
pub use sessions::{ServerSession, SessionRegistry};
