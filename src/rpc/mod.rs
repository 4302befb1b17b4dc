//! JSON-RPC engine
//!
//! Provides the handler tree, argument validation, the wire envelope and the dispatcher
//! that ties them together.

pub mod context;
pub mod dispatch;
pub mod envelope;
pub mod finite;
pub mod registry;
pub mod validate;

pub use context::{RequestContext, ServerControl, ServerMeta};
pub use dispatch::Dispatcher;
pub use envelope::{Outcome, Params, RpcRequest, RpcResponse, JSONRPC_VERSION};
pub use registry::{
    CallableEntry, HandlerNode, Param, RegistryError, RpcMethod, Signature, DEFAULT_CONTENT_TYPE,
    SEPARATOR,
};
pub use validate::Args;
