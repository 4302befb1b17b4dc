//! The calculator sub-handler
//!
//! Operands may be JSON numbers or numeric strings; anything else fails inside the
//! callable and is reported as an internal error.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::errors::MethodError;
use crate::rpc::{Args, HandlerNode, RegistryError, RequestContext, Signature};

pub fn calculator() -> Result<HandlerNode, RegistryError> {
    let operands = || Signature::new().required("a").required("b");

    HandlerNode::root()
        .with_method("add", operands(), "Add two numbers", |_, args| {
            binary(args, |a, b| Ok(a + b))
        })?
        .with_method("subtract", operands(), "Subtract b from a", |_, args| {
            binary(args, |a, b| Ok(a - b))
        })?
        .with_method("multiply", operands(), "Multiply two numbers", |_, args| {
            binary(args, |a, b| Ok(a * b))
        })?
        .with_method("divide", operands(), "Divide a by b", |_, args| {
            binary(args, |a, b| {
                if b == 0.0 {
                    Err(MethodError::failed("float division by zero"))
                } else {
                    Ok(a / b)
                }
            })
        })
}

fn binary<F>(args: &Args, op: F) -> Result<f64, MethodError>
where
    F: FnOnce(f64, f64) -> Result<f64, MethodError>,
{
    let a = to_float(args.require("a")?)?;
    let b = to_float(args.require("b")?)?;
    let result = op(a, b)?;
    if result.is_finite() {
        Ok(result)
    } else {
        Err(MethodError::failed(format!("result {result} is not a finite number")))
    }
}

pub fn to_float(value: &Value) -> Result<f64, MethodError> {
    match value {
        Value::Number(number) => number
            .as_f64()
            .ok_or_else(|| MethodError::failed(format!("{number} is not representable as a float"))),
        Value::String(text) => text
            .trim()
            .parse::<f64>()
            .map_err(|_| MethodError::failed(format!("could not convert string to float: '{text}'"))),
        other => Err(MethodError::failed(format!(
            "expected a number or a numeric string, got {other}"
        ))),
    }
}

/// Succeeds with a map keyed by pairs, which JSON cannot represent.
pub fn dodgy_method(
    _ctx: &RequestContext<'_>,
    _args: &Args,
) -> Result<BTreeMap<(u8, u8), &'static str>, MethodError> {
    Ok(BTreeMap::from([((0, 0), "origin"), ((1, 0), "east")]))
}
