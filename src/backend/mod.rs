//! External collaborators reached by the builtin capabilities.
//!
//! Each trait is one narrow service. Every method receives the identity of
//! the executing script so the collaborator can enforce its own ownership
//! rules; the sandbox never calls them with elevated credentials.

pub mod local;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::Identity;

pub use local::LocalStore;

/// A stored question/answer pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeRecord {
    pub id: String,
    pub question: String,
    pub answer: String,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchOptions {
    /// Maximum number of records returned.
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub description: String,
    #[serde(default)]
    pub steps: Vec<String>,
    pub linked_goal_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFlow {
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub steps: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNotification {
    pub message: String,
    /// Severity or category, e.g. `"info"`, `"warning"`, `"reminder"`.
    pub kind: String,
    /// Delivery channel, e.g. `"ui"`, `"email"`.
    pub channel: String,
}

#[async_trait]
pub trait KnowledgeBackend: Send + Sync {
    async fn save(
        &self,
        identity: &Identity,
        question: &str,
        answer: &str,
        metadata: Value,
    ) -> Result<String>;

    async fn search(
        &self,
        identity: &Identity,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<KnowledgeRecord>>;
}

#[async_trait]
pub trait TaskBackend: Send + Sync {
    async fn create_task(&self, identity: &Identity, task: NewTask) -> Result<String>;

    async fn create_flow(&self, identity: &Identity, flow: NewFlow) -> Result<String>;
}

#[async_trait]
pub trait NotificationBackend: Send + Sync {
    async fn send(&self, identity: &Identity, notification: NewNotification) -> Result<String>;
}

#[async_trait]
pub trait GoalBackend: Send + Sync {
    async fn update_progress(&self, identity: &Identity, key_result_id: &str, value: f64)
        -> Result<()>;
}

#[async_trait]
pub trait RuneBackend: Send + Sync {
    async fn invoke(
        &self,
        identity: &Identity,
        rune_id: &str,
        action: &str,
        params: Value,
    ) -> Result<Value>;
}

/// The set of collaborators the builtin capabilities are wired to.
#[derive(Clone)]
pub struct Backends {
    pub knowledge: Arc<dyn KnowledgeBackend>,
    pub tasks: Arc<dyn TaskBackend>,
    pub notifications: Arc<dyn NotificationBackend>,
    pub goals: Arc<dyn GoalBackend>,
    pub runes: Arc<dyn RuneBackend>,
}

impl Backends {
    /// Wires every collaborator to one file-backed store.
    pub fn local(store: Arc<LocalStore>) -> Self {
        Self {
            knowledge: store.clone(),
            tasks: store.clone(),
            notifications: store.clone(),
            goals: store.clone(),
            runes: store,
        }
    }
}
