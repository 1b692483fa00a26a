use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::identity::Identity;

use super::{
    GoalBackend, KnowledgeBackend, KnowledgeRecord, NewFlow, NewNotification, NewTask,
    NotificationBackend, RuneBackend, SearchOptions, TaskBackend,
};

/// Default number of records returned by a knowledge search.
const DEFAULT_SEARCH_LIMIT: usize = 10;

/// File-backed implementation of every collaborator, for local use and tests.
///
/// Layout:
///   {base_path}/{identity}/knowledge.jsonl      saved question/answer records
///   {base_path}/{identity}/tasks.jsonl          created tasks
///   {base_path}/{identity}/flows.jsonl          created agentic flows
///   {base_path}/{identity}/notifications.jsonl  sent notifications
///   {base_path}/{identity}/key_results.json     key result progress by id
///   {base_path}/{identity}/rune_outbox.jsonl    queued rune invocations
///
/// Data never crosses identity directories. Writes are serialized through
/// one lock, so concurrent calls for the same identity cannot interleave a
/// read-modify-write.
pub struct LocalStore {
    base_path: PathBuf,
    write_lock: Mutex<()>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TaskEntry {
    id: String,
    #[serde(flatten)]
    task: NewTask,
    status: String,
    created_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct FlowEntry {
    id: String,
    #[serde(flatten)]
    flow: NewFlow,
    created_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct NotificationEntry {
    id: String,
    #[serde(flatten)]
    notification: NewNotification,
    read: bool,
    created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct KeyResultProgress {
    current_value: f64,
    updated_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct RuneInvocation {
    id: String,
    rune_id: String,
    action: String,
    params: Value,
    queued_at: String,
}

impl LocalStore {
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        info!("Local store opened at {}", path.display());
        Ok(Self {
            base_path: path.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Returns the per-identity directory, creating it if needed.
    async fn identity_dir(&self, identity: &Identity) -> Result<PathBuf> {
        let id = identity.id.as_str();
        if !is_safe_component(id) {
            bail!("identity id '{id}' cannot be used as a storage key");
        }
        let dir = self.base_path.join(id);
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    async fn append<T: Serialize>(&self, identity: &Identity, file: &str, entry: &T) -> Result<()> {
        let path = self.identity_dir(identity).await?.join(file);
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        f.write_all(line.as_bytes()).await?;
        f.flush().await?;
        Ok(())
    }

    /// Loads every entry of a JSONL file. Missing files read as empty;
    /// malformed lines are skipped.
    async fn load<T: DeserializeOwned>(&self, identity: &Identity, file: &str) -> Result<Vec<T>> {
        let path = self.identity_dir(identity).await?.join(file);
        if !fs::try_exists(&path).await? {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path).await?;
        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    /// Number of tasks stored for `identity`.
    pub async fn task_count(&self, identity: &Identity) -> Result<usize> {
        Ok(self.load::<TaskEntry>(identity, "tasks.jsonl").await?.len())
    }

    /// Number of notifications stored for `identity`.
    pub async fn notification_count(&self, identity: &Identity) -> Result<usize> {
        Ok(self
            .load::<NotificationEntry>(identity, "notifications.jsonl")
            .await?
            .len())
    }

    /// Current progress value of a key result, if it was ever updated.
    pub async fn key_result_value(&self, identity: &Identity, key_result_id: &str) -> Result<Option<f64>> {
        let progress = self.load_key_results(identity).await?;
        Ok(progress.get(key_result_id).map(|p| p.current_value))
    }

    async fn load_key_results(&self, identity: &Identity) -> Result<BTreeMap<String, KeyResultProgress>> {
        let path = self.identity_dir(identity).await?.join("key_results.json");
        if !fs::try_exists(&path).await? {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&path).await?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Identity ids become directory names: reject anything that could escape
/// the base path or collide with hidden files.
fn is_safe_component(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '_' | '-'))
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

// ── Knowledge ────────────────────────────────────────────

#[async_trait]
impl KnowledgeBackend for LocalStore {
    async fn save(
        &self,
        identity: &Identity,
        question: &str,
        answer: &str,
        metadata: Value,
    ) -> Result<String> {
        let record = KnowledgeRecord {
            id: new_id(),
            question: question.to_string(),
            answer: answer.to_string(),
            metadata,
            created_at: now(),
        };
        self.append(identity, "knowledge.jsonl", &record).await?;
        debug!("Knowledge record {} saved for {}", record.id, identity.id);
        Ok(record.id)
    }

    /// Keyword/substring match across question and answer. An empty query
    /// returns the most recent records.
    async fn search(
        &self,
        identity: &Identity,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<KnowledgeRecord>> {
        let records: Vec<KnowledgeRecord> = self.load(identity, "knowledge.jsonl").await?;
        let limit = options.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
        let query_lower = query.to_lowercase();

        Ok(records
            .into_iter()
            .rev()
            .filter(|r| {
                query.is_empty()
                    || r.question.to_lowercase().contains(&query_lower)
                    || r.answer.to_lowercase().contains(&query_lower)
            })
            .take(limit)
            .collect())
    }
}

// ── Tasks & flows ────────────────────────────────────────

#[async_trait]
impl TaskBackend for LocalStore {
    async fn create_task(&self, identity: &Identity, task: NewTask) -> Result<String> {
        let entry = TaskEntry {
            id: new_id(),
            task,
            status: "pending".to_string(),
            created_at: now(),
        };
        self.append(identity, "tasks.jsonl", &entry).await?;
        Ok(entry.id)
    }

    async fn create_flow(&self, identity: &Identity, flow: NewFlow) -> Result<String> {
        let entry = FlowEntry {
            id: new_id(),
            flow,
            created_at: now(),
        };
        self.append(identity, "flows.jsonl", &entry).await?;
        Ok(entry.id)
    }
}

// ── Notifications ────────────────────────────────────────

#[async_trait]
impl NotificationBackend for LocalStore {
    async fn send(&self, identity: &Identity, notification: NewNotification) -> Result<String> {
        let entry = NotificationEntry {
            id: new_id(),
            notification,
            read: false,
            created_at: now(),
        };
        self.append(identity, "notifications.jsonl", &entry).await?;
        Ok(entry.id)
    }
}

// ── Goals ────────────────────────────────────────────────

#[async_trait]
impl GoalBackend for LocalStore {
    /// Upserts the key result's current value.
    async fn update_progress(&self, identity: &Identity, key_result_id: &str, value: f64) -> Result<()> {
        if !value.is_finite() {
            bail!("progress value must be a finite number");
        }
        let path = self.identity_dir(identity).await?.join("key_results.json");

        let _guard = self.write_lock.lock().await;
        let mut progress = self.load_key_results(identity).await?;
        progress.insert(
            key_result_id.to_string(),
            KeyResultProgress {
                current_value: value,
                updated_at: now(),
            },
        );
        fs::write(&path, serde_json::to_string_pretty(&progress)?).await?;
        Ok(())
    }
}

// ── Runes ────────────────────────────────────────────────

#[async_trait]
impl RuneBackend for LocalStore {
    /// Rune adapters run out of process: the invocation is queued in the
    /// identity's outbox and picked up by the adapter worker.
    async fn invoke(
        &self,
        identity: &Identity,
        rune_id: &str,
        action: &str,
        params: Value,
    ) -> Result<Value> {
        let invocation = RuneInvocation {
            id: new_id(),
            rune_id: rune_id.to_string(),
            action: action.to_string(),
            params,
            queued_at: now(),
        };
        self.append(identity, "rune_outbox.jsonl", &invocation).await?;
        info!("Queued rune invocation {rune_id}.{action} for {}", identity.id);
        Ok(json!({ "queued": true, "invocation_id": invocation.id }))
    }
}
