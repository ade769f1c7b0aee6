//! Line-framed remote procedure calls over TCP.
//!
//! Every message is one [`encode`](crate::codec::encode)d value followed by a
//! newline.
//!
//! ```text
//! request:  {"action": "call", "args": [...], "kwargs": {...}, "name": "run_once"}
//! response: {"result": "ok", "ret": 0}
//!           {"message": "KeyError: unknown run 3", "result": "error"}
//! ```

pub mod client;
pub mod server;

pub use client::RpcClient;
pub use server::{Arguments, MethodTable, RpcServer};

use crate::codec::Value;
use crate::error::{AppResult, DaqError};
use std::collections::BTreeMap;
use std::fmt;

/// Error returned by a method handler, rendered as `"<kind>: <message>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallError {
    pub kind: String,
    pub message: String,
}

impl CallError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new("ValueError", message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    pub fn key_error(message: impl Into<String>) -> Self {
        Self::new("KeyError", message)
    }

    pub fn lookup_error(message: impl Into<String>) -> Self {
        Self::new("LookupError", message)
    }

    pub fn runtime_error(message: impl Into<String>) -> Self {
        Self::new("RuntimeError", message)
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for CallError {}

/// A decoded `call` request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub name: String,
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
}

impl Request {
    pub fn to_value(&self) -> Value {
        let kwargs = self
            .kwargs
            .iter()
            .map(|(k, v)| (Value::from(k.as_str()), v.clone()));
        Value::map([
            ("action", Value::from("call")),
            ("name", Value::from(self.name.as_str())),
            ("args", Value::List(self.args.clone())),
            ("kwargs", Value::Map(kwargs.collect())),
        ])
    }

    pub fn from_value(value: &Value) -> Result<Self, CallError> {
        let protocol = |message: String| CallError::new("ProtocolError", message);
        match value.get("action").and_then(Value::as_str) {
            Some("call") => {}
            Some(other) => return Err(protocol(format!("unknown action '{}'", other))),
            None => return Err(protocol("request has no action".into())),
        }
        let name = value
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| protocol("request has no method name".into()))?
            .to_string();
        let args = match value.get("args") {
            None | Some(Value::Null) => Vec::new(),
            Some(args) => args
                .as_seq()
                .ok_or_else(|| protocol("args must be a list".into()))?
                .to_vec(),
        };
        let mut kwargs = BTreeMap::new();
        match value.get("kwargs") {
            None | Some(Value::Null) => {}
            Some(Value::Map(map)) => {
                for (key, v) in map {
                    let key = key
                        .as_str()
                        .ok_or_else(|| protocol("kwargs keys must be strings".into()))?;
                    kwargs.insert(key.to_string(), v.clone());
                }
            }
            Some(_) => return Err(protocol("kwargs must be a map".into())),
        }
        Ok(Self { name, args, kwargs })
    }
}

pub fn ok_response(ret: Value) -> Value {
    Value::map([("result", Value::from("ok")), ("ret", ret)])
}

pub fn error_response(message: impl Into<String>) -> Value {
    Value::map([
        ("result", Value::from("error")),
        ("message", Value::from(message.into())),
    ])
}

/// Turn a decoded response into the returned value or a `Remote` error.
pub fn parse_response(value: &Value) -> AppResult<Value> {
    match value.get("result").and_then(Value::as_str) {
        Some("ok") => Ok(value.get("ret").cloned().unwrap_or(Value::Null)),
        Some("error") => {
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown remote error");
            Err(DaqError::Remote(message.to_string()))
        }
        Some(other) => Err(DaqError::Protocol(format!("unknown result tag '{}'", other))),
        None => Err(DaqError::Protocol("response has no result tag".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode, encode};

    #[test]
    fn test_call_error_display() {
        assert_eq!(CallError::value_error("bad").to_string(), "ValueError: bad");
    }

    #[test]
    fn test_request_from_wire() {
        let value = decode(r#"{"action": "call", "name": "run_once", "args": [{"file": "a"}, null], "kwargs": {}}"#).unwrap();
        let request = Request::from_value(&value).unwrap();
        assert_eq!(request.name, "run_once");
        assert_eq!(request.args.len(), 2);
        assert_eq!(Request::from_value(&decode(&encode(&request.to_value())).unwrap()).unwrap(), request);
    }

    #[test]
    fn test_request_rejects_other_actions() {
        let value = decode(r#"{"action": "subscribe", "name": "x"}"#).unwrap();
        let err = Request::from_value(&value).unwrap_err();
        assert_eq!(err.kind, "ProtocolError");
    }

    #[test]
    fn test_parse_response() {
        assert_eq!(parse_response(&ok_response(Value::Int(4))).unwrap(), Value::Int(4));
        match parse_response(&error_response("KeyError: 3")) {
            Err(DaqError::Remote(message)) => assert_eq!(message, "KeyError: 3"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            parse_response(&Value::map([("result", "maybe")])),
            Err(DaqError::Protocol(_))
        ));
    }
}
