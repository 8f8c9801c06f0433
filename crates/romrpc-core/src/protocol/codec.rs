//! JSON text <-> [`Message`] conversion.
//!
//! The session id never travels as a top-level member. It is injected as a
//! `sessionId` property of the carrying member:
//!
//! ```text
//! request          -> params.sessionId
//! success response -> result.sessionId
//! error response   -> error.data.sessionId
//! ```
//!
//! A carrying member that is not a JSON object, or an object whose only
//! property is `value`, is wrapped as `{"value": <original>}` first. Decoding
//! strips the property and unwraps any lone `value`, so both shapes round-trip.

use super::message::{Message, Request, RequestId, Response, ResponseError};
use crate::config::ProtocolConfig;
use crate::{Result, RomError};
use serde_json::{Map, Value};

/// Serialize a message to its wire text.
pub fn encode(message: &Message) -> Result<String> {
    let value = match message {
        Message::Request(request) => encode_request(request),
        Message::Response(response) => encode_response(response)?,
    };
    Ok(serde_json::to_string(&value)?)
}

fn encode_request(request: &Request) -> Value {
    let mut obj = Map::new();
    obj.insert(
        "jsonrpc".into(),
        Value::String(ProtocolConfig::JSONRPC_VERSION.into()),
    );
    if let Some(id) = request.id {
        obj.insert("id".into(), Value::from(id));
    }
    obj.insert("method".into(), Value::String(request.method.clone()));

    let params = match &request.session_id {
        Some(sid) => Some(inject_session_id(request.params.clone(), sid)),
        None => request.params.clone(),
    };
    if let Some(params) = params {
        obj.insert("params".into(), params);
    }
    Value::Object(obj)
}

fn encode_response(response: &Response) -> Result<Value> {
    let mut obj = Map::new();
    obj.insert(
        "jsonrpc".into(),
        Value::String(ProtocolConfig::JSONRPC_VERSION.into()),
    );
    obj.insert(
        "id".into(),
        response.id.map(Value::from).unwrap_or(Value::Null),
    );

    match &response.payload {
        Ok(result) => {
            let result = match &response.session_id {
                Some(sid) => inject_session_id(Some(result.clone()), sid),
                None => result.clone(),
            };
            obj.insert("result".into(), result);
        }
        Err(error) => {
            let mut error = error.clone();
            if let Some(sid) = &response.session_id {
                error.data = Some(inject_session_id(error.data.take(), sid));
            }
            obj.insert("error".into(), serde_json::to_value(error)?);
        }
    }
    Ok(Value::Object(obj))
}

fn is_wrapper_shaped(map: &Map<String, Value>) -> bool {
    map.len() == 1 && map.contains_key(ProtocolConfig::VALUE_PROPERTY)
}

fn inject_session_id(member: Option<Value>, session_id: &str) -> Value {
    let mut map = match member {
        None => Map::new(),
        Some(Value::Object(map)) if !is_wrapper_shaped(&map) => map,
        Some(other) => {
            let mut map = Map::new();
            map.insert(ProtocolConfig::VALUE_PROPERTY.into(), other);
            map
        }
    };
    map.insert(
        ProtocolConfig::SESSION_ID_PROPERTY.into(),
        Value::String(session_id.to_string()),
    );
    Value::Object(map)
}

/// Remove an injected session id from a carrying member.
///
/// Returns the member as it was before injection (`None` when only the
/// session id was present) and the session id, if any.
fn extract_session_id(member: Option<Value>) -> (Option<Value>, Option<String>) {
    let mut map = match member {
        Some(Value::Object(map)) => map,
        other => return (other, None),
    };

    let session_id = match map.get(ProtocolConfig::SESSION_ID_PROPERTY) {
        Some(Value::String(_)) => match map.remove(ProtocolConfig::SESSION_ID_PROPERTY) {
            Some(Value::String(sid)) => Some(sid),
            _ => None,
        },
        _ => None,
    };

    if session_id.is_none() {
        return (Some(Value::Object(map)), None);
    }
    if map.is_empty() {
        return (None, session_id);
    }
    if is_wrapper_shaped(&map) {
        return (map.remove(ProtocolConfig::VALUE_PROPERTY), session_id);
    }
    (Some(Value::Object(map)), session_id)
}

/// Parse wire text into a request or a response.
///
/// Any malformed input is a [`RomError::Protocol`].
pub fn decode(text: &str) -> Result<Message> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| RomError::protocol(format!("parse error: {}", e)))?;
    let Value::Object(mut obj) = value else {
        return Err(RomError::protocol("message is not a JSON object"));
    };

    match obj.get("jsonrpc") {
        Some(Value::String(v)) if v == ProtocolConfig::JSONRPC_VERSION => {}
        _ => return Err(RomError::protocol("expected jsonrpc 2.0")),
    }

    let id = parse_id(obj.get("id"))?;
    let has_method = obj.contains_key("method");
    let has_outcome = obj.contains_key("result") || obj.contains_key("error");

    match (has_method, has_outcome) {
        (true, false) => {
            let method = match obj.remove("method") {
                Some(Value::String(m)) if !m.is_empty() => m,
                _ => return Err(RomError::protocol("method must be a non-empty string")),
            };
            let (params, session_id) = extract_session_id(obj.remove("params"));
            Ok(Message::Request(Request {
                id,
                method,
                params,
                session_id,
            }))
        }
        (false, true) => decode_response_object(id, obj).map(Message::Response),
        (true, true) => Err(RomError::protocol(
            "message carries both a method and a result/error",
        )),
        (false, false) => Err(RomError::protocol(
            "message is neither a request nor a response",
        )),
    }
}

fn decode_response_object(id: Option<RequestId>, mut obj: Map<String, Value>) -> Result<Response> {
    if obj.contains_key("result") && obj.contains_key("error") {
        return Err(RomError::protocol("response carries both result and error"));
    }

    if let Some(error) = obj.remove("error") {
        let mut error: ResponseError = serde_json::from_value(error)
            .map_err(|e| RomError::protocol(format!("malformed error object: {}", e)))?;
        let (data, session_id) = extract_session_id(error.data.take());
        error.data = data;
        if error.error_type.is_none() {
            error.error_type = error
                .data
                .as_ref()
                .and_then(|d| d.get("type"))
                .and_then(Value::as_str)
                .map(String::from);
        }
        return Ok(Response::error(id, error).with_session_id(session_id));
    }

    let (result, session_id) = extract_session_id(obj.remove("result"));
    let result = result.unwrap_or_else(|| Value::Object(Map::new()));
    Ok(Response::success(id, result).with_session_id(session_id))
}

fn parse_id(id: Option<&Value>) -> Result<Option<RequestId>> {
    match id {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| RomError::protocol(format!("id must be a non-negative integer, got {}", n))),
        Some(other) => Err(RomError::protocol(format!(
            "id must be an integer, got {}",
            other
        ))),
    }
}

/// Decode text that must be a request (or notification).
pub fn decode_request(text: &str) -> Result<Request> {
    match decode(text)? {
        Message::Request(request) => Ok(request),
        Message::Response(_) => Err(RomError::protocol("expected a request, got a response")),
    }
}

/// Decode text that must be a response.
pub fn decode_response(text: &str) -> Result<Response> {
    match decode(text)? {
        Message::Response(response) => Ok(response),
        Message::Request(_) => Err(RomError::protocol("expected a response, got a request")),
    }
}

/// Read the session id of a wire message without fully decoding it.
pub fn peek_session_id(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    let carrier = value
        .get("params")
        .or_else(|| value.get("result"))
        .or_else(|| value.get("error").and_then(|e| e.get("data")))?;
    carrier
        .get(ProtocolConfig::SESSION_ID_PROPERTY)
        .and_then(Value::as_str)
        .map(String::from)
}
