//! Builtin capabilities: the host operations Ability scripts can reach.
//!
//! Each one is a thin adapter that validates its typed parameters and
//! forwards to a collaborator from [`crate::backend`], passing the calling
//! identity along untouched.

pub mod goal;
pub mod knowledge;
pub mod log;
pub mod notification;
pub mod rune;
pub mod task;

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::debug;

use crate::backend::Backends;
use crate::capabilities::{Capability, CapabilityRegistry, RegistryError};

pub use goal::GoalProgressCapability;
pub use knowledge::{KnowledgeSaveCapability, KnowledgeSearchCapability};
pub use log::{LogCapability, LogLevel};
pub use notification::NotificationSendCapability;
pub use rune::RuneInvokeCapability;
pub use task::{FlowCreateCapability, TaskCreateCapability};

/// All builtin capabilities wired to `backends`.
pub fn builtin_capabilities(backends: &Backends) -> Vec<Arc<dyn Capability>> {
    vec![
        Arc::new(KnowledgeSaveCapability::new(backends.knowledge.clone())),
        Arc::new(KnowledgeSearchCapability::new(backends.knowledge.clone())),
        Arc::new(TaskCreateCapability::new(backends.tasks.clone())),
        Arc::new(FlowCreateCapability::new(backends.tasks.clone())),
        Arc::new(NotificationSendCapability::new(backends.notifications.clone())),
        Arc::new(GoalProgressCapability::new(backends.goals.clone())),
        Arc::new(RuneInvokeCapability::new(backends.runes.clone())),
        Arc::new(LogCapability::new(LogLevel::Info)),
        Arc::new(LogCapability::new(LogLevel::Warn)),
        Arc::new(LogCapability::new(LogLevel::Error)),
    ]
}

/// Registers every builtin. A role in `roles` (keyed by capability name)
/// replaces the capability's own requirement.
pub fn register_builtins(
    registry: &mut CapabilityRegistry,
    backends: &Backends,
    roles: &HashMap<String, String>,
) -> Result<(), RegistryError> {
    for capability in builtin_capabilities(backends) {
        let name = capability.name().to_string();
        let role = roles
            .get(&name)
            .cloned()
            .or_else(|| capability.required_role().map(str::to_string));
        debug!("Registering builtin capability: {name}");
        registry.register_as(&name, capability, role)?;
    }
    Ok(())
}

/// Accepts a list, or an empty object for it. Lua has a single table type,
/// so a script's `{}` reaches us as an empty JSON object.
pub(crate) fn lenient_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ListOrMap<T> {
        List(Vec<T>),
        Map(serde_json::Map<String, Value>),
    }

    match ListOrMap::deserialize(deserializer)? {
        ListOrMap::List(items) => Ok(items),
        ListOrMap::Map(map) if map.is_empty() => Ok(Vec::new()),
        ListOrMap::Map(_) => Err(D::Error::custom("expected a list")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalStore;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Steps {
        #[serde(default, deserialize_with = "lenient_list")]
        steps: Vec<String>,
    }

    #[test]
    fn test_lenient_list() {
        let s: Steps = serde_json::from_value(json!({"steps": ["a", "b"]})).unwrap();
        assert_eq!(s.steps, vec!["a", "b"]);
        let s: Steps = serde_json::from_value(json!({"steps": {}})).unwrap();
        assert!(s.steps.is_empty());
        let s: Steps = serde_json::from_value(json!({})).unwrap();
        assert!(s.steps.is_empty());
        assert!(serde_json::from_value::<Steps>(json!({"steps": {"k": 1}})).is_err());
    }

    #[test]
    fn test_register_builtins_with_role_override() {
        let dir = tempfile::tempdir().unwrap();
        let backends = Backends::local(Arc::new(LocalStore::open(dir.path()).unwrap()));
        let mut registry = CapabilityRegistry::new();
        let roles = HashMap::from([("rune.invoke".to_string(), "admin".to_string())]);

        register_builtins(&mut registry, &backends, &roles).unwrap();

        assert_eq!(
            registry.names(),
            vec![
                "flow.create",
                "goal.updateProgress",
                "knowledge.save",
                "knowledge.search",
                "log.error",
                "log.info",
                "log.warn",
                "notification.send",
                "rune.invoke",
                "task.create",
            ]
        );
        assert_eq!(registry.resolve("rune.invoke").unwrap().required_role(), Some("admin"));
        assert_eq!(registry.resolve("task.create").unwrap().required_role(), None);
    }

    #[test]
    fn test_register_builtins_twice_is_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let backends = Backends::local(Arc::new(LocalStore::open(dir.path()).unwrap()));
        let mut registry = CapabilityRegistry::new();
        register_builtins(&mut registry, &backends, &HashMap::new()).unwrap();
        let err = register_builtins(&mut registry, &backends, &HashMap::new()).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(_)));
    }
}
