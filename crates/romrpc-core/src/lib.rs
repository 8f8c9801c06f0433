//! romrpc - JSON-RPC sessions and a Remote Object Model.
//!
//! The crate has two layers. The substrate ([`protocol`], [`session`],
//! [`transport`], [`server`]) moves JSON-RPC 2.0 messages over a session that
//! survives reconnects. The [`rom`] layer drives typed server-side objects
//! through client proxies on top of it.
//!
//! # Example
//!
//! ```rust,ignore
//! use romrpc::rom::{ClientParams, RomClient};
//! use romrpc::{Session, SessionOptions, TcpConnector};
//!
//! #[tokio::main]
//! async fn main() -> romrpc::Result<()> {
//!     let session = Session::new(
//!         TcpConnector::new("127.0.0.1:9400".parse().unwrap()),
//!         SessionOptions::default(),
//!     );
//!     let client = RomClient::new(session, schemas());
//!     client.connect().await?;
//!
//!     let widget = client
//!         .create("Widget", ClientParams::new().with("color", "red"))
//!         .await?;
//!     widget
//!         .invoke("paint", ClientParams::new().with("color", "blue"))
//!         .await?;
//!     widget.release().await?;
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod protocol;
pub mod retry;
pub mod rom;
pub mod server;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use cancel::CancellationToken;
pub use config::{PoolOptions, ServerOptions, SessionOptions};
pub use error::{RomError, Result};
pub use protocol::{Message, Request, RequestId, Response, ResponseError};
pub use server::{router, JsonRpcServer, RpcHandler};
pub use session::{Session, SessionListener, SessionState};
pub use transport::{Connector, HttpConnector, LocalConnector, PooledConnector, TcpConnector};
