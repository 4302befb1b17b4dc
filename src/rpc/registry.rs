//! Hierarchical method registry
//!
//! Callables live in a tree of [`HandlerNode`]s addressed by dotted paths such as
//! `calc.add`. The tree is owned top-down: lookups walk from the root, nodes never
//! point back at their parent.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::errors::MethodError;
use crate::rpc::context::RequestContext;
use crate::rpc::finite;
use crate::rpc::validate::Args;

pub const SEPARATOR: char = '.';
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("path `{path}` conflicts with an existing entry")]
    Conflict { path: String },
    #[error("could not find path `{path}`")]
    NotFound { path: String },
    #[error("invalid method path `{path}`")]
    InvalidPath { path: String },
}

/// A callable bound to a node of the tree.
pub trait RpcMethod: Send + Sync {
    fn call(&self, ctx: &RequestContext<'_>, args: &Args) -> Result<Value, MethodError>;
}

struct FnMethod<F, T> {
    func: F,
    _result: PhantomData<fn() -> T>,
}

impl<F, T> RpcMethod for FnMethod<F, T>
where
    F: Fn(&RequestContext<'_>, &Args) -> Result<T, MethodError> + Send + Sync + 'static,
    T: Serialize,
{
    fn call(&self, ctx: &RequestContext<'_>, args: &Args) -> Result<Value, MethodError> {
        let result = (self.func)(ctx, args)?;
        finite::ensure_finite(&result)?;
        Ok(serde_json::to_value(result)?)
    }
}

/// One declared parameter. Parameters without a default are required.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub default: Option<Value>,
}

impl Param {
    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Signature {
    params: Vec<Param>,
}

impl Signature {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: impl Into<String>) -> Self {
        self.params.push(Param {
            name: name.into(),
            default: None,
        });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, default: Value) -> Self {
        self.params.push(Param {
            name: name.into(),
            default: Some(default),
        });
        self
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn max_positional(&self) -> usize {
        self.params.len()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|param| param.name == name)
    }
}

#[derive(Clone)]
pub struct CallableEntry {
    name: String,
    doc: String,
    signature: Signature,
    method: Arc<dyn RpcMethod>,
}

impl CallableEntry {
    pub fn new<F, T>(name: impl Into<String>, signature: Signature, doc: impl Into<String>, func: F) -> Self
    where
        F: Fn(&RequestContext<'_>, &Args) -> Result<T, MethodError> + Send + Sync + 'static,
        T: Serialize + 'static,
    {
        Self {
            name: name.into(),
            doc: doc.into(),
            signature,
            method: Arc::new(FnMethod {
                func,
                _result: PhantomData,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn doc(&self) -> &str {
        &self.doc
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn invoke(&self, ctx: &RequestContext<'_>, args: &Args) -> Result<Value, MethodError> {
        self.method.call(ctx, args)
    }
}

impl fmt::Debug for CallableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallableEntry")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct HandlerNode {
    segment: String,
    content_type: String,
    raise_404: bool,
    methods: BTreeMap<String, CallableEntry>,
    children: BTreeMap<String, HandlerNode>,
}

impl Default for HandlerNode {
    fn default() -> Self {
        Self::root()
    }
}

impl HandlerNode {
    pub fn root() -> Self {
        Self {
            segment: String::new(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            raise_404: true,
            methods: BTreeMap::new(),
            children: BTreeMap::new(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_raise_404(mut self, raise_404: bool) -> Self {
        self.raise_404 = raise_404;
        self
    }

    /// Builder form of [`HandlerNode::register`].
    pub fn with_method<F, T>(
        mut self,
        path: &str,
        signature: Signature,
        doc: &str,
        func: F,
    ) -> Result<Self, RegistryError>
    where
        F: Fn(&RequestContext<'_>, &Args) -> Result<T, MethodError> + Send + Sync + 'static,
        T: Serialize + 'static,
    {
        self.register(path, signature, doc, func)?;
        Ok(self)
    }

    /// Builder form of [`HandlerNode::put_child`].
    pub fn with_child(mut self, segment: &str, child: HandlerNode) -> Result<Self, RegistryError> {
        self.put_child(segment, child)?;
        Ok(self)
    }

    pub fn register<F, T>(
        &mut self,
        path: &str,
        signature: Signature,
        doc: &str,
        func: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(&RequestContext<'_>, &Args) -> Result<T, MethodError> + Send + Sync + 'static,
        T: Serialize + 'static,
    {
        let segments = split_path(path)?;
        let Some((name, prefixes)) = segments.split_last() else {
            return Err(RegistryError::InvalidPath {
                path: path.to_string(),
            });
        };

        let content_type = self.content_type.clone();
        let raise_404 = self.raise_404;
        let mut node = self;
        for (depth, segment) in prefixes.iter().enumerate() {
            if node.methods.contains_key(*segment) {
                return Err(RegistryError::Conflict {
                    path: segments[..=depth].join("."),
                });
            }
            node = node
                .children
                .entry((*segment).to_string())
                .or_insert_with(|| HandlerNode {
                    segment: (*segment).to_string(),
                    content_type: content_type.clone(),
                    raise_404,
                    methods: BTreeMap::new(),
                    children: BTreeMap::new(),
                });
        }

        if node.methods.contains_key(*name) || node.children.contains_key(*name) {
            return Err(RegistryError::Conflict {
                path: path.to_string(),
            });
        }

        node.methods.insert(
            (*name).to_string(),
            CallableEntry::new(*name, signature, doc, func),
        );
        Ok(())
    }

    /// Attaches `child` as the sub-handler reached through `segment`.
    pub fn put_child(&mut self, segment: &str, mut child: HandlerNode) -> Result<(), RegistryError> {
        if segment.is_empty() || segment.contains(SEPARATOR) {
            return Err(RegistryError::InvalidPath {
                path: segment.to_string(),
            });
        }
        if self.methods.contains_key(segment) || self.children.contains_key(segment) {
            return Err(RegistryError::Conflict {
                path: segment.to_string(),
            });
        }

        child.segment = segment.to_string();
        self.children.insert(segment.to_string(), child);
        Ok(())
    }

    pub fn resolve(&self, path: &str) -> Result<&CallableEntry, RegistryError> {
        let not_found = || RegistryError::NotFound {
            path: path.to_string(),
        };
        let segments = split_path(path).map_err(|_| not_found())?;
        let Some((name, prefixes)) = segments.split_last() else {
            return Err(not_found());
        };

        let mut node = self;
        for segment in prefixes {
            node = node.children.get(*segment).ok_or_else(not_found)?;
        }
        node.methods.get(*name).ok_or_else(not_found)
    }

    pub fn is_root(&self) -> bool {
        self.segment.is_empty()
    }

    pub fn segment(&self) -> &str {
        &self.segment
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn raise_404(&self) -> bool {
        self.raise_404
    }

    pub fn child(&self, segment: &str) -> Option<&HandlerNode> {
        self.children.get(segment)
    }

    pub fn children(&self) -> &BTreeMap<String, HandlerNode> {
        &self.children
    }

    pub fn methods(&self) -> &BTreeMap<String, CallableEntry> {
        &self.methods
    }

    /// Every registered function as `(dotted path, doc)`, methods of a node
    /// before its children, each group sorted by name.
    pub fn list_functions(&self) -> Vec<(String, String)> {
        let mut functions = Vec::new();
        self.collect_functions("", &mut functions);
        functions
    }

    pub fn function_paths(&self) -> Vec<String> {
        self.list_functions()
            .into_iter()
            .map(|(path, _)| path)
            .collect()
    }

    /// reStructuredText listing of every function.
    pub fn documentation(&self) -> String {
        self.list_functions()
            .into_iter()
            .map(|(name, doc)| {
                let doc = if doc.is_empty() { "No docs".to_string() } else { doc };
                let underline = "-".repeat(name.len() + 2);
                format!(".. _functions-{name}:\n\n{name}\n{underline}\n\n{doc}\n\n")
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn collect_functions(&self, prefix: &str, out: &mut Vec<(String, String)>) {
        for (name, entry) in &self.methods {
            out.push((format!("{prefix}{name}"), entry.doc().to_string()));
        }
        for (name, child) in &self.children {
            child.collect_functions(&format!("{prefix}{name}{SEPARATOR}"), out);
        }
    }
}

fn split_path(path: &str) -> Result<Vec<&str>, RegistryError> {
    let segments: Vec<&str> = path.split(SEPARATOR).collect();
    if segments.iter().any(|segment| segment.trim().is_empty()) {
        return Err(RegistryError::InvalidPath {
            path: path.to_string(),
        });
    }
    Ok(segments)
}
