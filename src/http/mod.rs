//! HTTP transport layer
//!
//! Routes JSON-RPC posts at the dispatcher's mount path to the dispatcher, next to
//! the health and discovery endpoints.

pub mod handlers;
