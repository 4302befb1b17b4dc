//! Methods served by the bundled application
//!
//! Provides the introspection commands every server exposes and the calculator
//! sub-tree, assembled into one dispatcher by [`calculator_app`].

pub mod calc;
pub mod commands;

use crate::rpc::{Dispatcher, HandlerNode, RegistryError, Signature};

/// Root commands plus the `calc` sub-handler.
pub fn calculator_tree() -> Result<HandlerNode, RegistryError> {
    commands::server_commands()?
        .with_child("calc", calc::calculator()?)?
        .with_method(
            "dodgy_method",
            Signature::new(),
            "Returns a value that cannot be encoded as JSON",
            calc::dodgy_method,
        )
}

pub fn calculator_app() -> Result<Dispatcher, RegistryError> {
    Ok(Dispatcher::new(calculator_tree()?))
}
