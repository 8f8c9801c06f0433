//! Remote Object Model on top of the JSON-RPC session.
//!
//! The server side owns live objects in a [`RomServer`] built from a
//! [`TypeRegistry`]; [`RomRpcHandler`] maps the `create` / `invoke` /
//! `release` / `subscribe` / `unsubscribe` / `transaction` verbs onto it.
//! The client side hands out [`RemoteObject`] proxies from a [`RomClient`],
//! with [`Transaction`] batching and [`BlockingClient`] for synchronous
//! callers.

pub mod blocking;
pub mod builder;
pub mod client;
pub mod continuation;
pub mod events;
pub mod flatten;
pub mod handler;
mod objects;
pub mod proxy;
pub mod registry;
pub mod schema;
pub mod server;
pub mod transaction;
pub mod value;

pub use blocking::BlockingClient;
pub use builder::ObjectBuilder;
pub use client::{ClientParams, ClientValue, RomClient};
pub use continuation::Continuation;
pub use events::{EventEmitter, EventListener, RemoteEvent, SubscriptionTable};
pub use flatten::{flatten, flatten_params, ObjectRef, ReferenceResolver, Unflattener};
pub use handler::RomRpcHandler;
pub use proxy::{ProxyState, RemoteObject};
pub use registry::{
    ClassBuilder, ObjectContext, ObjectHandle, RemoteClass, ServerParams, ServerValue,
    TypeRegistry,
};
pub use schema::{
    EventSchema, FactorySchema, MethodSchema, ParamDecl, ParamType, RemoteClassSchema, SchemaSet,
};
pub use server::RomServer;
pub use transaction::{Transaction, TransactionState, TxResult};
pub use value::{ParamMap, RomValue};
