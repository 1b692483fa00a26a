use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::backend::GoalBackend;
use crate::capabilities::{parse_params, Capability};
use crate::identity::Identity;

#[derive(Debug, Deserialize)]
struct ProgressParams {
    #[serde(alias = "keyResultId")]
    key_result_id: String,
    value: f64,
}

/// `goal.updateProgress(key_result_id, value)` → null.
pub struct GoalProgressCapability {
    backend: Arc<dyn GoalBackend>,
}

impl GoalProgressCapability {
    pub fn new(backend: Arc<dyn GoalBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Capability for GoalProgressCapability {
    fn name(&self) -> &str {
        "goal.updateProgress"
    }

    fn description(&self) -> &str {
        "Set the current value of one of the caller's key results."
    }

    fn parameters(&self) -> &[&'static str] {
        &["key_result_id", "value"]
    }

    async fn invoke(&self, params: Value, identity: &Identity) -> anyhow::Result<Value> {
        let p: ProgressParams = parse_params(self.name(), params)?;
        self.backend
            .update_progress(identity, &p.key_result_id, p.value)
            .await?;
        Ok(Value::Null)
    }
}
