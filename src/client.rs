//! Client proxy for calling a served handler tree
//!
//! A [`JsonProxy`] builds dotted method names by attribute chaining
//! (`proxy.attr("calc").attr("add")`) and maps error envelopes back onto the
//! error kinds the server raised.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::errors::ErrorKind;
use crate::rpc::{Dispatcher, Outcome, Params, RpcRequest, RpcResponse, ServerMeta, SEPARATOR};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no such function: {0}")]
    NoSuchFunction(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("server fault {code}: {message}")]
    Fault { code: i64, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("params must be an array, an object or null")]
    InvalidParamsShape,
}

impl ClientError {
    /// The server-side error kind, when the failure came from an error envelope.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::NoSuchFunction(_) => Some(ErrorKind::NoSuchFunction),
            Self::InvalidParams(_) => Some(ErrorKind::InvalidParams),
            Self::Internal(_) => Some(ErrorKind::InternalError),
            _ => None,
        }
    }

    fn from_error_object(code: i64, message: String) -> Self {
        match ErrorKind::from_code(code) {
            Some(ErrorKind::NoSuchFunction) => Self::NoSuchFunction(message),
            Some(ErrorKind::InvalidParams) => Self::InvalidParams(message),
            Some(ErrorKind::InternalError) => Self::Internal(message),
            None => Self::Fault { code, message },
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Moves an encoded request body to a server and returns the encoded reply.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, body: Vec<u8>) -> Result<Vec<u8>, ClientError>;

    fn address(&self) -> String;
}

pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, body: Vec<u8>) -> Result<Vec<u8>, ClientError> {
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Transport(format!(
                "{} answered with {status}",
                self.url
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }

    fn address(&self) -> String {
        self.url.clone()
    }
}

/// Calls a dispatcher in this process without a network hop.
pub struct LocalTransport {
    dispatcher: Arc<Dispatcher>,
    server: Arc<ServerMeta>,
}

impl LocalTransport {
    pub fn new(dispatcher: Arc<Dispatcher>, server: ServerMeta) -> Self {
        Self {
            dispatcher,
            server: Arc::new(server),
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, body: Vec<u8>) -> Result<Vec<u8>, ClientError> {
        let payload: Value = serde_json::from_slice(&body)
            .map_err(|err| ClientError::InvalidResponse(err.to_string()))?;
        let dispatcher = Arc::clone(&self.dispatcher);
        let server = Arc::clone(&self.server);
        let response =
            tokio::task::spawn_blocking(move || dispatcher.handle_payload(&server, payload))
                .await
                .map_err(|err| ClientError::Transport(err.to_string()))?;
        serde_json::to_vec(&response).map_err(|err| ClientError::InvalidResponse(err.to_string()))
    }

    fn address(&self) -> String {
        format!("local://{}{}", self.server.name, self.dispatcher.path())
    }
}

pub struct JsonProxy {
    transport: Arc<dyn Transport>,
    next_id: AtomicU64,
}

impl JsonProxy {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self {
            transport: Arc::new(transport),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn http(url: impl Into<String>) -> Result<Self, ClientError> {
        Ok(Self::new(HttpTransport::new(url, DEFAULT_TIMEOUT)?))
    }

    pub fn local(dispatcher: Arc<Dispatcher>, server: ServerMeta) -> Self {
        Self::new(LocalTransport::new(dispatcher, server))
    }

    pub fn address(&self) -> String {
        self.transport.address()
    }

    pub fn attr(&self, name: &str) -> JsonCall<'_> {
        JsonCall {
            proxy: self,
            path: name.to_string(),
        }
    }

    /// Calls `method` with `params`, which must be an array, an object or null.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        let params =
            Params::from_value(Some(params)).map_err(|_| ClientError::InvalidParamsShape)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest::new(method, params, json!(id));
        let body = serde_json::to_vec(&request.to_value())
            .map_err(|err| ClientError::InvalidResponse(err.to_string()))?;

        debug!(method, id, address = %self.transport.address(), "sending rpc request");
        let reply = self.transport.send(body).await?;

        let value: Value = serde_json::from_slice(&reply)
            .map_err(|err| ClientError::InvalidResponse(err.to_string()))?;
        let response = RpcResponse::from_value(value).ok_or_else(|| {
            ClientError::InvalidResponse("reply is not a JSON-RPC response".to_string())
        })?;
        if response.id != json!(id) {
            return Err(ClientError::InvalidResponse(format!(
                "reply id {} does not match request id {id}",
                response.id
            )));
        }

        match response.outcome {
            Outcome::Result(result) => Ok(result),
            Outcome::Error(error) => Err(ClientError::from_error_object(error.code, error.message)),
        }
    }
}

/// A dotted method path under construction.
pub struct JsonCall<'a> {
    proxy: &'a JsonProxy,
    path: String,
}

impl JsonCall<'_> {
    pub fn attr(mut self, name: &str) -> Self {
        self.path.push(SEPARATOR);
        self.path.push_str(name);
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn call(&self, params: Value) -> Result<Value, ClientError> {
        self.proxy.call(&self.path, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ConcurrencyMode, Mid};
    use crate::rpc::JSONRPC_VERSION;
    use crate::domain::calculator_app;

    fn proxy() -> JsonProxy {
        JsonProxy::local(
            Arc::new(calculator_app().expect("calculator app")),
            ServerMeta::new("client-test", Mid::generate(), ConcurrencyMode::Thread),
        )
    }

    #[tokio::test]
    async fn attribute_chaining_builds_dotted_paths() {
        let proxy = proxy();
        let call = proxy.attr("calc").attr("add");
        assert_eq!(call.path(), "calc.add");
        assert_eq!(call.call(json!([3, 7])).await.expect("add"), json!(10.0));
    }

    #[tokio::test]
    async fn errors_map_to_kinds() {
        let proxy = proxy();

        let err = proxy.call("foo", Value::Null).await.expect_err("unknown");
        assert_eq!(err.kind(), Some(ErrorKind::NoSuchFunction));

        let err = proxy
            .attr("calc")
            .attr("add")
            .call(json!([1, 2, 3]))
            .await
            .expect_err("too many args");
        assert_eq!(err.kind(), Some(ErrorKind::InvalidParams));

        let err = proxy
            .call("calc.divide", json!(["ciao", "bo"]))
            .await
            .expect_err("not numbers");
        assert_eq!(err.kind(), Some(ErrorKind::InternalError));
    }

    #[tokio::test]
    async fn scalar_params_are_rejected_locally() {
        let err = proxy().call("ping", json!(3)).await.expect_err("scalar");
        assert!(matches!(err, ClientError::InvalidParamsShape));
        assert_eq!(err.kind(), None);
    }

    struct Recording(Arc<std::sync::Mutex<Vec<Value>>>);

    #[async_trait]
    impl Transport for Recording {
        async fn send(&self, body: Vec<u8>) -> Result<Vec<u8>, ClientError> {
            let request: Value = serde_json::from_slice(&body).expect("request json");
            let reply = json!({"jsonrpc": "2.0", "id": request["id"], "result": true});
            self.0.lock().expect("recording lock").push(request);
            Ok(serde_json::to_vec(&reply).expect("reply json"))
        }

        fn address(&self) -> String {
            "recording".to_string()
        }
    }

    #[tokio::test]
    async fn requests_use_the_server_envelope() {
        let sent = Arc::new(std::sync::Mutex::new(Vec::new()));
        let proxy = JsonProxy::new(Recording(Arc::clone(&sent)));

        proxy.call("calc.add", json!([1, 2])).await.expect("positional");
        proxy.call("server_info", json!({"full": true})).await.expect("named");
        proxy.call("ping", Value::Null).await.expect("no params");

        let sent = sent.lock().expect("recording lock").clone();
        assert_eq!(sent.len(), 3);
        for body in &sent {
            let decoded = RpcRequest::from_value(body.clone()).expect("server can decode");
            assert_eq!(&decoded.to_value(), body);
            assert_eq!(body["jsonrpc"], JSONRPC_VERSION);
        }
        assert_eq!(sent[0]["params"], json!([1, 2]));
        assert_eq!(sent[1]["params"], json!({"full": true}));
        assert_ne!(sent[0]["id"], sent[1]["id"]);
    }

    #[test]
    fn unknown_codes_become_faults() {
        let err = ClientError::from_error_object(-32000, "boom".to_string());
        assert!(matches!(err, ClientError::Fault { code: -32000, .. }));
        assert_eq!(err.kind(), None);
    }

    #[test]
    fn local_address_names_the_server() {
        assert_eq!(proxy().address(), "local://client-test/");
    }
}
