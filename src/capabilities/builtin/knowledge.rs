use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::backend::{KnowledgeBackend, SearchOptions};
use crate::capabilities::{parse_params, Capability};
use crate::identity::Identity;

#[derive(Debug, Deserialize)]
struct SaveParams {
    question: String,
    answer: String,
    #[serde(default)]
    metadata: Value,
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    #[serde(default)]
    query: String,
    #[serde(default)]
    options: Option<SearchOptions>,
}

/// `knowledge.save(question, answer, metadata)` → record id.
pub struct KnowledgeSaveCapability {
    backend: Arc<dyn KnowledgeBackend>,
}

impl KnowledgeSaveCapability {
    pub fn new(backend: Arc<dyn KnowledgeBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Capability for KnowledgeSaveCapability {
    fn name(&self) -> &str {
        "knowledge.save"
    }

    fn description(&self) -> &str {
        "Save a question/answer pair to the caller's knowledge base. Returns the record id."
    }

    fn parameters(&self) -> &[&'static str] {
        &["question", "answer", "metadata"]
    }

    async fn invoke(&self, params: Value, identity: &Identity) -> anyhow::Result<Value> {
        let p: SaveParams = parse_params(self.name(), params)?;
        let id = self
            .backend
            .save(identity, &p.question, &p.answer, p.metadata)
            .await?;
        Ok(json!(id))
    }
}

/// `knowledge.search(query, options)` → array of records.
pub struct KnowledgeSearchCapability {
    backend: Arc<dyn KnowledgeBackend>,
}

impl KnowledgeSearchCapability {
    pub fn new(backend: Arc<dyn KnowledgeBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Capability for KnowledgeSearchCapability {
    fn name(&self) -> &str {
        "knowledge.search"
    }

    fn description(&self) -> &str {
        "Search the caller's knowledge base by keyword. An empty query lists recent records."
    }

    fn parameters(&self) -> &[&'static str] {
        &["query", "options"]
    }

    async fn invoke(&self, params: Value, identity: &Identity) -> anyhow::Result<Value> {
        let p: SearchParams = parse_params(self.name(), params)?;
        let options = p.options.unwrap_or_default();
        let records = self.backend.search(identity, &p.query, &options).await?;
        Ok(serde_json::to_value(records)?)
    }
}
