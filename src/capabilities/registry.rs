use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

use crate::identity::Identity;

use super::{Capability, CapabilityDescriptor};

/// Registration failures. Only raised at startup, never during execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("capability '{0}' is already registered")]
    Duplicate(String),
    #[error("invalid capability name '{0}': expected dotted identifiers like 'task.create'")]
    InvalidName(String),
}

/// Boxed async closure usable as a capability (see [`CapabilityRegistry::register_fn`]).
pub type CapabilityFn =
    dyn Fn(Value, Identity) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync;

/// The fixed set of named operations scripts may call.
///
/// Built mutably at process start, then frozen by moving it into an
/// `Arc` and handing it to the execution engine. Nothing can register
/// through a shared `Arc`, so the set is immutable once executions run.
#[derive(Default)]
pub struct CapabilityRegistry {
    entries: HashMap<String, CapabilityDescriptor>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a capability under its own name and role requirement.
    pub fn register(&mut self, capability: Arc<dyn Capability>) -> Result<(), RegistryError> {
        let name = capability.name().to_string();
        let role = capability.required_role().map(str::to_string);
        self.insert(name, role, capability)
    }

    /// Registers a capability under an explicit name, overriding its role
    /// requirement with `required_role`.
    pub fn register_as(
        &mut self,
        name: &str,
        capability: Arc<dyn Capability>,
        required_role: Option<String>,
    ) -> Result<(), RegistryError> {
        self.insert(name.to_string(), required_role, capability)
    }

    /// Registers an async closure as a capability.
    pub fn register_fn<F>(
        &mut self,
        name: &str,
        required_role: Option<&str>,
        f: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(Value, Identity) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync + 'static,
    {
        let capability = Arc::new(FnCapability {
            name: name.to_string(),
            f: Box::new(f),
        });
        self.insert(
            name.to_string(),
            required_role.map(str::to_string),
            capability,
        )
    }

    fn insert(
        &mut self,
        name: String,
        required_role: Option<String>,
        handler: Arc<dyn Capability>,
    ) -> Result<(), RegistryError> {
        if !is_valid_name(&name) {
            return Err(RegistryError::InvalidName(name));
        }
        if self.entries.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        let descriptor = CapabilityDescriptor::new(name.clone(), required_role, handler);
        self.entries.insert(name, descriptor);
        Ok(())
    }

    /// Looks up a capability by exact name.
    pub fn resolve(&self, name: &str) -> Option<&CapabilityDescriptor> {
        self.entries.get(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Descriptors sorted by name.
    pub fn descriptors(&self) -> Vec<&CapabilityDescriptor> {
        let mut descriptors: Vec<&CapabilityDescriptor> = self.entries.values().collect();
        descriptors.sort_by(|a, b| a.name().cmp(b.name()));
        descriptors
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `task.create`, `log.info`, `unknownThing` are valid; `task.`, `.x`,
/// `a b` and `1st` are not.
fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
                }
                _ => false,
            }
        })
}

struct FnCapability {
    name: String,
    f: Box<CapabilityFn>,
}

#[async_trait]
impl Capability for FnCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "closure capability"
    }

    async fn invoke(&self, params: Value, identity: &Identity) -> anyhow::Result<Value> {
        (self.f)(params, identity.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::json;

    fn echo_registry() -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();
        registry
            .register_fn("echo", None, |params, _| async move { Ok(params) }.boxed())
            .unwrap();
        registry
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = echo_registry();
        let descriptor = registry.resolve("echo").unwrap();
        assert_eq!(descriptor.name(), "echo");
        assert_eq!(descriptor.required_role(), None);
        assert!(registry.resolve("missing").is_none());
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = echo_registry();
        let err = registry
            .register_fn("echo", None, |_, _| async { Ok(Value::Null) }.boxed())
            .unwrap_err();
        assert_eq!(err, RegistryError::Duplicate("echo".to_string()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_invalid_names_rejected() {
        let mut registry = CapabilityRegistry::new();
        for bad in ["", "task.", ".task", "a b", "1st", "task..create", "task-create"] {
            let err = registry
                .register_fn(bad, None, |_, _| async { Ok(Value::Null) }.boxed())
                .unwrap_err();
            assert_eq!(err, RegistryError::InvalidName(bad.to_string()));
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_valid_names() {
        assert!(is_valid_name("task.create"));
        assert!(is_valid_name("goal.updateProgress"));
        assert!(is_valid_name("_private.x1"));
        assert!(is_valid_name("unknownThing"));
    }

    #[test]
    fn test_names_are_sorted() {
        let mut registry = CapabilityRegistry::new();
        for name in ["task.create", "knowledge.save", "log.info"] {
            registry
                .register_fn(name, None, |_, _| async { Ok(Value::Null) }.boxed())
                .unwrap();
        }
        assert_eq!(registry.names(), vec!["knowledge.save", "log.info", "task.create"]);
        let described: Vec<&str> = registry.descriptors().iter().map(|d| d.name()).collect();
        assert_eq!(described, registry.names());
    }

    #[test]
    fn test_register_as_overrides_role() {
        let mut source = CapabilityRegistry::new();
        source
            .register_fn("admin.only", Some("admin"), |_, _| async { Ok(Value::Null) }.boxed())
            .unwrap();
        let handler = source.resolve("admin.only").unwrap().handler.clone();

        let mut registry = CapabilityRegistry::new();
        registry
            .register_as("ops.open", handler, Some("ops".to_string()))
            .unwrap();
        let descriptor = registry.resolve("ops.open").unwrap();
        assert_eq!(descriptor.required_role(), Some("ops"));
        assert!(descriptor.permits(&Identity::new("x").with_role("ops")));
        assert!(!descriptor.permits(&Identity::new("x").with_role("admin")));
    }

    #[tokio::test]
    async fn test_fn_capability_receives_identity() {
        let mut registry = CapabilityRegistry::new();
        registry
            .register_fn("whoami", None, |_, identity| {
                async move { Ok(json!(identity.id)) }.boxed()
            })
            .unwrap();
        let value = registry
            .resolve("whoami")
            .unwrap()
            .invoke(Value::Null, &Identity::new("carol"))
            .await
            .unwrap();
        assert_eq!(value, json!("carol"));
    }
}
