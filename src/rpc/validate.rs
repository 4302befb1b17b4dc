//! Structural argument checks run before any callable is invoked

use serde_json::Value;

use crate::errors::{MethodError, RpcError};
use crate::rpc::envelope::Params;
use crate::rpc::registry::Signature;

/// Arguments merged from positional values, keyword values and defaults, in
/// declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    values: Vec<(String, Value)>,
}

impl Args {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(param, _)| param == name)
            .map(|(_, value)| value)
    }

    pub fn require(&self, name: &str) -> Result<&Value, MethodError> {
        self.get(name)
            .ok_or_else(|| MethodError::invalid_params(format!("missing argument '{name}'")))
    }

    pub fn get_bool(&self, name: &str) -> Result<bool, MethodError> {
        match self.get(name) {
            None | Some(Value::Null) => Ok(false),
            Some(Value::Bool(flag)) => Ok(*flag),
            Some(_) => Err(MethodError::invalid_params(format!(
                "argument '{name}' must be a boolean"
            ))),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }
}

/// Checks `params` against `signature` and merges them into [`Args`].
pub fn bind(signature: &Signature, params: &Params) -> Result<Args, RpcError> {
    let declared = signature.max_positional();
    let supplied = params.positional.len();
    if supplied > declared {
        return Err(RpcError::invalid_params(format!(
            "takes at most {declared} positional argument(s) but {supplied} were given"
        )));
    }

    for name in params.named.keys() {
        match signature.position(name) {
            None => {
                return Err(RpcError::invalid_params(format!(
                    "unexpected keyword argument '{name}'"
                )))
            }
            Some(index) if index < supplied => {
                return Err(RpcError::invalid_params(format!(
                    "got multiple values for argument '{name}'"
                )))
            }
            Some(_) => {}
        }
    }

    let mut values = Vec::with_capacity(declared);
    let mut missing = Vec::new();
    for (index, param) in signature.params().iter().enumerate() {
        let value = params
            .positional
            .get(index)
            .or_else(|| params.named.get(&param.name))
            .cloned()
            .or_else(|| param.default.clone());

        match value {
            Some(value) => values.push((param.name.clone(), value)),
            None => missing.push(format!("'{}'", param.name)),
        }
    }

    if !missing.is_empty() {
        return Err(RpcError::invalid_params(format!(
            "missing required argument(s): {}",
            missing.join(", ")
        )));
    }

    Ok(Args { values })
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};

    use super::*;
    use crate::errors::ErrorKind;

    fn signature() -> Signature {
        Signature::new()
            .required("a")
            .required("b")
            .optional("scale", json!(1))
    }

    fn named(pairs: &[(&str, Value)]) -> Params {
        let mut map = Map::new();
        for (key, value) in pairs {
            map.insert((*key).to_string(), value.clone());
        }
        Params::named(map)
    }

    #[test]
    fn positional_values_fill_in_order_with_defaults() {
        let args = bind(&signature(), &Params::positional(vec![json!(3), json!(7)]))
            .expect("valid args");
        assert_eq!(args.get("a"), Some(&json!(3)));
        assert_eq!(args.get("b"), Some(&json!(7)));
        assert_eq!(args.get("scale"), Some(&json!(1)));
        assert_eq!(args.len(), 3);
    }

    #[test]
    fn keyword_values_merge_with_positional() {
        let mut params = named(&[("b", json!(2)), ("scale", json!(10))]);
        params.positional.push(json!(1));
        let args = bind(&signature(), &params).expect("valid args");
        let collected: Vec<_> = args.iter().map(|(name, _)| name).collect();
        assert_eq!(collected, vec!["a", "b", "scale"]);
        assert_eq!(args.get("scale"), Some(&json!(10)));
    }

    #[test]
    fn too_many_positional_is_invalid_params() {
        let err = bind(
            &signature(),
            &Params::positional(vec![json!(1), json!(2), json!(3), json!(4)]),
        )
        .expect_err("four values for three params");
        assert_eq!(err.kind(), ErrorKind::InvalidParams);
    }

    #[test]
    fn unknown_keyword_is_invalid_params() {
        let err = bind(&signature(), &named(&[("a", json!(1)), ("c", json!(2))]))
            .expect_err("c is unknown");
        assert!(err.message().contains("'c'"));
    }

    #[test]
    fn duplicate_value_is_invalid_params() {
        let mut params = named(&[("a", json!(2))]);
        params.positional.push(json!(1));
        let err = bind(&signature(), &params).expect_err("a given twice");
        assert_eq!(err.kind(), ErrorKind::InvalidParams);
    }

    #[test]
    fn missing_required_is_invalid_params() {
        let err = bind(&signature(), &Params::positional(vec![json!(1)]))
            .expect_err("b is missing");
        assert_eq!(err.kind(), ErrorKind::InvalidParams);
        assert!(err.message().contains("'b'"));
    }

    #[test]
    fn get_bool_rejects_non_booleans() {
        let args = bind(
            &Signature::new().optional("full", json!(false)),
            &named(&[("full", json!("yes"))]),
        )
        .expect("bind");
        assert!(matches!(args.get_bool("full"), Err(MethodError::InvalidParams(_))));
    }
}
