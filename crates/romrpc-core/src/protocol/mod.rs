//! JSON-RPC 2.0 message model, codec and stream framing.

pub mod codec;
pub mod framing;
pub mod message;

pub use codec::{decode, decode_request, decode_response, encode, peek_session_id};
pub use framing::{read_frame, write_close_frame, write_frame, CloseStatus, Frame};
pub use message::{methods, Message, Request, RequestId, Response, ResponseError};
