//! Per-event processing context
//!
//! A `Context` travels alongside every event through the depths of a
//! pipeline. It carries free-form attributes and, when an event crosses into
//! another pipeline, a link to the context it had upstream.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

/// Context shared by the stages that handle one event.
#[derive(Debug, Clone, Default)]
pub struct Context {
    values: HashMap<String, Value>,
    ancestor: Option<Arc<Context>>,
}

impl Context {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty context whose ancestor is `ancestor`.
    ///
    /// Used when an event is handed over to another pipeline.
    pub fn with_ancestor(ancestor: Context) -> Self {
        Self {
            values: HashMap::new(),
            ancestor: Some(Arc::new(ancestor)),
        }
    }

    /// Builder-style attribute insertion.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.values.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Look up `key` here first, then walk the ancestor chain.
    pub fn lookup(&self, key: &str) -> Option<&Value> {
        self.values
            .get(key)
            .or_else(|| self.ancestor.as_deref().and_then(|a| a.lookup(key)))
    }

    pub fn ancestor(&self) -> Option<&Context> {
        self.ancestor.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.ancestor.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_walks_ancestors() {
        let upstream = Context::new().with("tenant", "acme");
        let ctx = Context::with_ancestor(upstream).with("stage", 2);

        assert_eq!(ctx.get("tenant"), None);
        assert_eq!(ctx.lookup("tenant"), Some(&Value::from("acme")));
        assert_eq!(ctx.lookup("stage"), Some(&Value::from(2)));
        assert!(ctx.ancestor().is_some());
        assert!(Context::new().is_empty());
    }
}
