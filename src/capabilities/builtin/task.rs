use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::lenient_list;
use crate::backend::{NewFlow, NewTask, TaskBackend};
use crate::capabilities::{parse_params, Capability};
use crate::identity::Identity;

#[derive(Debug, Deserialize)]
struct TaskParams {
    description: String,
    #[serde(default, deserialize_with = "lenient_list")]
    steps: Vec<String>,
    #[serde(default, alias = "linkedGoalId")]
    linked_goal_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FlowParams {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, deserialize_with = "lenient_list")]
    steps: Vec<Value>,
}

/// `task.create(description, steps, linked_goal_id)` → task id.
pub struct TaskCreateCapability {
    backend: Arc<dyn TaskBackend>,
}

impl TaskCreateCapability {
    pub fn new(backend: Arc<dyn TaskBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Capability for TaskCreateCapability {
    fn name(&self) -> &str {
        "task.create"
    }

    fn description(&self) -> &str {
        "Create a task with optional ordered steps, optionally linked to a goal."
    }

    fn parameters(&self) -> &[&'static str] {
        &["description", "steps", "linked_goal_id"]
    }

    async fn invoke(&self, params: Value, identity: &Identity) -> anyhow::Result<Value> {
        let p: TaskParams = parse_params(self.name(), params)?;
        if p.description.trim().is_empty() {
            anyhow::bail!("task description must not be empty");
        }
        let id = self
            .backend
            .create_task(
                identity,
                NewTask {
                    description: p.description,
                    steps: p.steps,
                    linked_goal_id: p.linked_goal_id,
                },
            )
            .await?;
        Ok(json!(id))
    }
}

/// `flow.create(name, description, steps)` → flow id.
pub struct FlowCreateCapability {
    backend: Arc<dyn TaskBackend>,
}

impl FlowCreateCapability {
    pub fn new(backend: Arc<dyn TaskBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Capability for FlowCreateCapability {
    fn name(&self) -> &str {
        "flow.create"
    }

    fn description(&self) -> &str {
        "Create an agentic flow (a named, multi-step automation)."
    }

    fn parameters(&self) -> &[&'static str] {
        &["name", "description", "steps"]
    }

    async fn invoke(&self, params: Value, identity: &Identity) -> anyhow::Result<Value> {
        let p: FlowParams = parse_params(self.name(), params)?;
        let id = self
            .backend
            .create_flow(
                identity,
                NewFlow {
                    name: p.name,
                    description: p.description,
                    steps: p.steps,
                },
            )
            .await?;
        Ok(json!(id))
    }
}
