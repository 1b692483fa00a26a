use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::backend::RuneBackend;
use crate::capabilities::{parse_params, Capability};
use crate::identity::Identity;

#[derive(Debug, Deserialize)]
struct InvokeParams {
    #[serde(alias = "runeId")]
    rune_id: String,
    action: String,
    #[serde(default)]
    params: Value,
}

/// `rune.invoke(rune_id, action, params)` → whatever the rune returns.
///
/// Runes are third-party adapters (GitHub, Boost.Space, …); this capability
/// only forwards the call with the executing identity attached.
pub struct RuneInvokeCapability {
    backend: Arc<dyn RuneBackend>,
}

impl RuneInvokeCapability {
    pub fn new(backend: Arc<dyn RuneBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Capability for RuneInvokeCapability {
    fn name(&self) -> &str {
        "rune.invoke"
    }

    fn description(&self) -> &str {
        "Invoke an action on an installed rune (third-party adapter)."
    }

    fn parameters(&self) -> &[&'static str] {
        &["rune_id", "action", "params"]
    }

    async fn invoke(&self, params: Value, identity: &Identity) -> anyhow::Result<Value> {
        let p: InvokeParams = parse_params(self.name(), params)?;
        if p.rune_id.is_empty() || p.action.is_empty() {
            anyhow::bail!("rune id and action are required");
        }
        self.backend
            .invoke(identity, &p.rune_id, &p.action, p.params)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRunes {
        calls: Mutex<Vec<(String, String, String, Value)>>,
    }

    #[async_trait]
    impl RuneBackend for RecordingRunes {
        async fn invoke(
            &self,
            identity: &Identity,
            rune_id: &str,
            action: &str,
            params: Value,
        ) -> anyhow::Result<Value> {
            self.calls.lock().unwrap().push((
                identity.id.clone(),
                rune_id.to_string(),
                action.to_string(),
                params,
            ));
            Ok(json!({"ok": true}))
        }
    }

    #[tokio::test]
    async fn test_forwards_with_identity() {
        let runes = Arc::new(RecordingRunes::default());
        let cap = RuneInvokeCapability::new(runes.clone());

        let result = cap
            .invoke(
                json!({"runeId": "github", "action": "list_repos", "params": {"page": 2}}),
                &Identity::new("alice"),
            )
            .await
            .unwrap();
        assert_eq!(result, json!({"ok": true}));

        let calls = runes.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "alice");
        assert_eq!(calls[0].1, "github");
        assert_eq!(calls[0].2, "list_repos");
        assert_eq!(calls[0].3, json!({"page": 2}));
    }

    #[tokio::test]
    async fn test_empty_action_rejected() {
        let runes = Arc::new(RecordingRunes::default());
        let cap = RuneInvokeCapability::new(runes.clone());
        let result = cap
            .invoke(json!({"rune_id": "github", "action": ""}), &Identity::new("alice"))
            .await;
        assert!(result.is_err());
        assert!(runes.calls.lock().unwrap().is_empty());
    }
}
