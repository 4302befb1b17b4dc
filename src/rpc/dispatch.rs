//! The request dispatcher
//!
//! Walks one request through `Received → Resolving → Validating → Invoking → Responding`
//! and classifies every failure into the three wire-visible kinds.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use serde_json::Value;
use tracing::{info, warn};

use crate::errors::{MethodError, RpcError};
use crate::rpc::context::{RequestContext, ServerMeta};
use crate::rpc::envelope::{RpcRequest, RpcResponse};
use crate::rpc::registry::HandlerNode;
use crate::rpc::validate;

pub const DEFAULT_MOUNT_PATH: &str = "/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Resolving,
    Validating,
    Invoking,
    Responding,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Resolving => "resolving",
            Self::Validating => "validating",
            Self::Invoking => "invoking",
            Self::Responding => "responding",
        }
    }
}

/// Serves one immutable handler tree.
#[derive(Debug)]
pub struct Dispatcher {
    root: HandlerNode,
    path: String,
}

impl Dispatcher {
    pub fn new(root: HandlerNode) -> Self {
        Self {
            root,
            path: DEFAULT_MOUNT_PATH.to_string(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn handler(&self) -> &HandlerNode {
        &self.root
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn raise_404(&self) -> bool {
        self.root.raise_404()
    }

    pub fn content_type(&self) -> &str {
        self.root.content_type()
    }

    /// Handles a decoded request body, either one envelope or a batch.
    pub fn handle_payload(&self, server: &ServerMeta, payload: Value) -> Value {
        match payload {
            Value::Array(batch) if batch.is_empty() => RpcResponse::failure(
                Value::Null,
                &RpcError::internal("Invalid request: empty batch"),
            )
            .into_value(),
            Value::Array(batch) => Value::Array(
                batch
                    .into_iter()
                    .map(|item| self.handle_value(server, item).into_value())
                    .collect(),
            ),
            other => self.handle_value(server, other).into_value(),
        }
    }

    pub fn handle_value(&self, server: &ServerMeta, payload: Value) -> RpcResponse {
        match RpcRequest::from_value(payload) {
            Ok(request) => self.dispatch(server, &request),
            Err(response) => {
                warn!(
                    stage = Stage::Received.as_str(),
                    code = response.error_code(),
                    "rejected malformed envelope"
                );
                response
            }
        }
    }

    pub fn dispatch(&self, server: &ServerMeta, request: &RpcRequest) -> RpcResponse {
        let started_at = Instant::now();
        let (stage, result) = self.run(server, request);

        let response = match result {
            Ok(value) => RpcResponse::success(request.id.clone(), value),
            Err(err) => RpcResponse::failure(request.id.clone(), &err),
        };

        info!(
            method = %request.method,
            stage = stage.as_str(),
            outcome = if response.is_error() { "failure" } else { "success" },
            code = response.error_code(),
            duration_us = started_at.elapsed().as_micros() as u64,
            "rpc call audited"
        );

        response
    }

    fn run(&self, server: &ServerMeta, request: &RpcRequest) -> (Stage, Result<Value, RpcError>) {
        let entry = match self.root.resolve(&request.method) {
            Ok(entry) => entry,
            Err(_) => {
                return (
                    Stage::Resolving,
                    Err(RpcError::no_such_function(format!(
                        "Function \"{}\" not available.",
                        request.method
                    ))),
                )
            }
        };

        let args = match validate::bind(entry.signature(), &request.params) {
            Ok(args) => args,
            Err(err) => return (Stage::Validating, Err(err)),
        };

        let ctx = RequestContext {
            method: &request.method,
            id: &request.id,
            server,
            root: &self.root,
        };

        match panic::catch_unwind(AssertUnwindSafe(|| entry.invoke(&ctx, &args))) {
            Ok(Ok(value)) => (Stage::Responding, Ok(value)),
            Ok(Err(err @ MethodError::Serialize(_))) => (Stage::Responding, Err(err.into())),
            Ok(Err(err)) => (Stage::Invoking, Err(err.into())),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(method = %request.method, error = %message, "callable panicked");
                (
                    Stage::Invoking,
                    Err(RpcError::internal(format!("Unhandled server exception: {message}"))),
                )
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;
    use crate::backend::{ConcurrencyMode, Mid};
    use crate::errors::ErrorKind;
    use crate::rpc::envelope::{Outcome, Params};
    use crate::rpc::registry::Signature;

    fn dispatcher() -> Dispatcher {
        let mut root = HandlerNode::root();
        root.register(
            "calc.add",
            Signature::new().required("a").required("b"),
            "",
            |_, args| {
                let a = args.require("a")?.as_f64().ok_or_else(|| MethodError::failed("a"))?;
                let b = args.require("b")?.as_f64().ok_or_else(|| MethodError::failed("b"))?;
                Ok(a + b)
            },
        )
        .expect("add");
        root.register("strict", Signature::new().required("n"), "", |_, args| {
            match args.require("n")?.as_i64() {
                Some(n) if n > 0 => Ok(n),
                _ => Err(MethodError::invalid_params("n must be positive")),
            }
        })
        .expect("strict");
        root.register("boom", Signature::new(), "", |_, _| -> Result<(), MethodError> {
            panic!("exploded")
        })
        .expect("boom");
        root.register("unencodable", Signature::new(), "", |_, _| {
            Ok(BTreeMap::from([((1, 2), "pair")]))
        })
        .expect("unencodable");
        root.register("whoami", Signature::new(), "", |ctx, _| {
            Ok(json!({"method": ctx.method, "id": ctx.id, "server": ctx.server.name}))
        })
        .expect("whoami");
        Dispatcher::new(root)
    }

    fn meta() -> ServerMeta {
        ServerMeta::new("test", Mid::generate(), ConcurrencyMode::Thread)
    }

    fn call(method: &str, params: Value) -> RpcResponse {
        let params = Params::from_value(Some(params)).expect("params shape");
        dispatcher().dispatch(&meta(), &RpcRequest::new(method, params, json!(1)))
    }

    fn kind_of(response: &RpcResponse) -> Option<ErrorKind> {
        response.error_code().and_then(ErrorKind::from_code)
    }

    #[test]
    fn registered_call_succeeds() {
        let response = call("calc.add", json!([3, 7]));
        assert_eq!(response.outcome, Outcome::Result(json!(10.0)));
        assert_eq!(response.id, json!(1));
    }

    #[test]
    fn non_finite_result_is_internal_error() {
        let response = call("calc.add", json!([1e308, 1e308]));
        assert_eq!(kind_of(&response), Some(ErrorKind::InternalError));
    }

    #[test]
    fn unknown_path_is_no_such_function() {
        assert_eq!(kind_of(&call("foo", json!(["ciao"]))), Some(ErrorKind::NoSuchFunction));
        assert_eq!(kind_of(&call("calc", json!([]))), Some(ErrorKind::NoSuchFunction));
    }

    #[test]
    fn extra_argument_is_invalid_params() {
        assert_eq!(
            kind_of(&call("calc.add", json!([3, 7, 9]))),
            Some(ErrorKind::InvalidParams)
        );
    }

    #[test]
    fn callable_rejection_is_invalid_params() {
        assert_eq!(kind_of(&call("strict", json!([-1]))), Some(ErrorKind::InvalidParams));
        assert!(!call("strict", json!([4])).is_error());
    }

    #[test]
    fn callable_failure_is_internal() {
        assert_eq!(
            kind_of(&call("calc.add", json!(["a", "b"]))),
            Some(ErrorKind::InternalError)
        );
    }

    #[test]
    fn panic_is_internal() {
        assert_eq!(kind_of(&call("boom", json!([]))), Some(ErrorKind::InternalError));
    }

    #[test]
    fn unserializable_result_is_internal() {
        assert_eq!(
            kind_of(&call("unencodable", json!([]))),
            Some(ErrorKind::InternalError)
        );
    }

    #[test]
    fn context_reaches_the_callable() {
        let response = call("whoami", json!(null));
        assert_eq!(
            response.outcome,
            Outcome::Result(json!({"method": "whoami", "id": 1, "server": "test"}))
        );
    }

    #[test]
    fn batch_answers_each_item_in_order() {
        let value = dispatcher().handle_payload(
            &meta(),
            json!([
                {"id": 1, "method": "calc.add", "params": [1, 2]},
                {"id": 2, "method": "nope"},
                "garbage"
            ]),
        );
        let items = value.as_array().expect("batch response");
        assert_eq!(items.len(), 3);
        assert_eq!(items[0]["result"], json!(3.0));
        assert_eq!(items[1]["error"]["code"], json!(-32601));
        assert_eq!(items[2]["error"]["code"], json!(-32603));
    }

    #[test]
    fn empty_batch_is_internal() {
        let value = dispatcher().handle_payload(&meta(), json!([]));
        assert_eq!(value["error"]["code"], json!(-32603));
    }
}
