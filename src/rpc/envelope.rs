//! JSON-RPC envelope representations
//!
//! Requests arrive as `{method, params, id}` objects; responses leave as
//! `{jsonrpc, id, result}` or `{jsonrpc, id, error: {code, message}}`.

use serde_json::{json, Map, Value};

use crate::errors::{ErrorObject, RpcError};

pub const JSONRPC_VERSION: &str = "2.0";

/// Positional and keyword parameters of a call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    pub positional: Vec<Value>,
    pub named: Map<String, Value>,
}

impl Params {
    pub fn positional(values: Vec<Value>) -> Self {
        Self {
            positional: values,
            named: Map::new(),
        }
    }

    pub fn named(values: Map<String, Value>) -> Self {
        Self {
            positional: Vec::new(),
            named: values,
        }
    }

    pub fn from_value(value: Option<Value>) -> Result<Self, RpcError> {
        match value {
            None | Some(Value::Null) => Ok(Self::default()),
            Some(Value::Array(items)) => Ok(Self::positional(items)),
            Some(Value::Object(map)) => Ok(Self::named(map)),
            Some(_) => Err(RpcError::invalid_params(
                "params must be an array or an object",
            )),
        }
    }

    pub fn len(&self) -> usize {
        self.positional.len() + self.named.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wire form. Keyword parameters win when both are present.
    pub fn to_value(&self) -> Value {
        if self.named.is_empty() {
            Value::Array(self.positional.clone())
        } else {
            Value::Object(self.named.clone())
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub method: String,
    pub params: Params,
    pub id: Value,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: Params, id: Value) -> Self {
        Self {
            method: method.into(),
            params,
            id,
        }
    }

    /// Parses one envelope. Failures come back as the response to send.
    pub fn from_value(payload: Value) -> Result<Self, RpcResponse> {
        let Value::Object(mut object) = payload else {
            return Err(RpcResponse::failure(
                Value::Null,
                &RpcError::internal("Invalid request: expected a JSON object"),
            ));
        };

        let id = object.remove("id").unwrap_or(Value::Null);
        let method = match object.remove("method") {
            Some(Value::String(method)) if !method.trim().is_empty() => method,
            _ => {
                return Err(RpcResponse::failure(
                    id,
                    &RpcError::internal("Invalid request: method must be a non-empty string"),
                ))
            }
        };

        let params = match Params::from_value(object.remove("params")) {
            Ok(params) => params,
            Err(err) => return Err(RpcResponse::failure(id, &err)),
        };

        Ok(Self { method, params, id })
    }

    pub fn to_value(&self) -> Value {
        json!({
            "jsonrpc": JSONRPC_VERSION,
            "method": self.method,
            "params": self.params.to_value(),
            "id": self.id,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Result(Value),
    Error(ErrorObject),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse {
    pub id: Value,
    pub outcome: Outcome,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            outcome: Outcome::Result(result),
        }
    }

    pub fn failure(id: Value, err: &RpcError) -> Self {
        Self {
            id,
            outcome: Outcome::Error(err.to_error_object()),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, Outcome::Error(_))
    }

    pub fn error_code(&self) -> Option<i64> {
        match &self.outcome {
            Outcome::Error(error) => Some(error.code),
            Outcome::Result(_) => None,
        }
    }

    pub fn into_value(self) -> Value {
        let mut object = Map::new();
        object.insert("jsonrpc".to_string(), json!(JSONRPC_VERSION));
        object.insert("id".to_string(), self.id);
        match self.outcome {
            Outcome::Result(result) => {
                object.insert("result".to_string(), result);
            }
            Outcome::Error(error) => {
                object.insert(
                    "error".to_string(),
                    json!({ "code": error.code, "message": error.message }),
                );
            }
        }
        Value::Object(object)
    }

    /// Reads a response envelope produced by [`RpcResponse::into_value`].
    pub fn from_value(value: Value) -> Option<Self> {
        let Value::Object(mut object) = value else {
            return None;
        };
        let id = object.remove("id").unwrap_or(Value::Null);

        if let Some(error) = object.remove("error") {
            let code = error.get("code").and_then(Value::as_i64)?;
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return Some(Self {
                id,
                outcome: Outcome::Error(ErrorObject { code, message }),
            });
        }

        let result = object.remove("result")?;
        Some(Self::success(id, result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn parses_positional_request() {
        let request = RpcRequest::from_value(json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "calc.add",
            "params": [3, 7]
        }))
        .expect("valid request");

        assert_eq!(request.method, "calc.add");
        assert_eq!(request.id, json!(7));
        assert_eq!(request.params.positional, vec![json!(3), json!(7)]);
        assert!(request.params.named.is_empty());
    }

    #[test]
    fn parses_named_request_without_version() {
        let request = RpcRequest::from_value(json!({
            "id": "abc",
            "method": "server_info",
            "params": {"full": true}
        }))
        .expect("valid request");

        assert_eq!(request.params.named["full"], json!(true));
        assert_eq!(request.id, json!("abc"));
    }

    #[test]
    fn missing_params_are_empty() {
        let request =
            RpcRequest::from_value(json!({"id": 1, "method": "ping"})).expect("valid request");
        assert!(request.params.is_empty());
    }

    #[test]
    fn scalar_params_are_invalid_params() {
        let response = RpcRequest::from_value(json!({"id": 3, "method": "ping", "params": 5}))
            .expect_err("scalar params must fail");
        assert_eq!(response.id, json!(3));
        assert_eq!(response.error_code(), Some(ErrorKind::InvalidParams.code()));
    }

    #[test]
    fn missing_method_is_rejected_with_id() {
        let response =
            RpcRequest::from_value(json!({"id": 9, "params": []})).expect_err("must fail");
        assert_eq!(response.id, json!(9));
        assert_eq!(response.error_code(), Some(ErrorKind::InternalError.code()));
    }

    #[test]
    fn error_response_shape() {
        let value =
            RpcResponse::failure(json!(1), &RpcError::no_such_function("Function \"foo\" not available"))
                .into_value();
        assert_eq!(
            value,
            json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": {"code": -32601, "message": "Function \"foo\" not available"}
            })
        );
        let parsed = RpcResponse::from_value(value).expect("parse back");
        assert_eq!(parsed.error_code(), Some(-32601));
    }

    #[test]
    fn request_prefers_named_params_on_the_wire() {
        let mut named = Map::new();
        named.insert("a".to_string(), json!(1));
        let request = RpcRequest::new("calc.add", Params::named(named), json!(1));
        assert_eq!(request.to_value()["params"], json!({"a": 1}));
    }
}
