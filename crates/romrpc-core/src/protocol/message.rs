//! In-memory JSON-RPC 2.0 message shapes.
//!
//! The session id is carried out-of-band of the payload on these types; the
//! codec decides where it lives on the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Integer request id. Unique per in-flight window of one session.
pub type RequestId = u64;

/// Reserved method names consumed by this crate.
pub mod methods {
    pub const CREATE: &str = "create";
    pub const INVOKE: &str = "invoke";
    pub const RELEASE: &str = "release";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const ON_EVENT: &str = "onEvent";
    pub const TRANSACTION: &str = "transaction";
    pub const POLL: &str = "poll";
    pub const KEEP_ALIVE: &str = "keepAlive";
}

/// A request. Without an id it is a notification: no response is expected.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: Option<RequestId>,
    pub method: String,
    pub params: Option<Value>,
    pub session_id: Option<String>,
}

impl Request {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: Some(id),
            method: method.into(),
            params,
            session_id: None,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: None,
            method: method.into(),
            params,
            session_id: None,
        }
    }

    pub fn with_session_id(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// A response: exactly one of result or error.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: Option<RequestId>,
    pub payload: Result<Value, ResponseError>,
    pub session_id: Option<String>,
}

impl Response {
    pub fn success(id: Option<RequestId>, result: Value) -> Self {
        Self {
            id,
            payload: Ok(result),
            session_id: None,
        }
    }

    pub fn error(id: Option<RequestId>, error: ResponseError) -> Self {
        Self {
            id,
            payload: Err(error),
            session_id: None,
        }
    }

    pub fn with_session_id(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn is_error(&self) -> bool {
        self.payload.is_err()
    }

    pub fn result(&self) -> Option<&Value> {
        self.payload.as_ref().ok()
    }

    pub fn error_ref(&self) -> Option<&ResponseError> {
        self.payload.as_ref().err()
    }
}

/// JSON-RPC 2.0 error object, with an optional type tag for client-side
/// error reconstruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

impl ResponseError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
            error_type: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }
}

/// Any message that can travel over a session.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Message::Request(r) => r.session_id.as_deref(),
            Message::Response(r) => r.session_id.as_deref(),
        }
    }

    pub fn is_notification(&self) -> bool {
        matches!(self, Message::Request(r) if r.is_notification())
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Message::Request(request)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}
