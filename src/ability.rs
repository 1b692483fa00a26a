//! Abilities: named, stored scripts that users run through the sandbox.
//!
//! An ability is either owned by one user or public. Running it always uses
//! the identity of the caller, never the owner's, so a public ability can
//! only do what the caller is allowed to do.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use crate::identity::Identity;
use crate::sandbox::{ExecutionEngine, ExecutionFailure, ExecutionRequest, ExecutionResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AbilityTrigger {
    #[default]
    Manual,
    Keyword { value: String },
    Schedule { cron: String },
    Event { event_type: String },
    Webhook { endpoint: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ability {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub script: String,
    #[serde(default)]
    pub trigger: AbilityTrigger,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default = "default_enabled")]
    pub is_enabled: bool,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Ability {
    pub fn new(id: impl Into<String>, name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            script: script.into(),
            trigger: AbilityTrigger::Manual,
            owner_id: None,
            is_public: false,
            is_enabled: true,
            version: default_version(),
            last_used: None,
        }
    }

    pub fn owned_by(mut self, owner: impl Into<String>) -> Self {
        self.owner_id = Some(owner.into());
        self
    }

    pub fn public(mut self) -> Self {
        self.is_public = true;
        self
    }

    pub fn with_trigger(mut self, trigger: AbilityTrigger) -> Self {
        self.trigger = trigger;
        self
    }

    /// Public abilities are visible to everyone, private ones to their owner.
    pub fn is_accessible_by(&self, identity: &Identity) -> bool {
        self.is_public || self.owner_id.as_deref() == Some(identity.id.as_str())
    }

    /// True if this is a keyword ability whose keyword occurs in `text`
    /// (case-insensitive).
    pub fn matches_keyword(&self, text: &str) -> bool {
        match &self.trigger {
            AbilityTrigger::Keyword { value } if !value.trim().is_empty() => {
                text.to_lowercase().contains(&value.trim().to_lowercase())
            }
            _ => false,
        }
    }

    pub fn matches_event(&self, event_type: &str) -> bool {
        matches!(&self.trigger, AbilityTrigger::Event { event_type: t } if t == event_type)
    }
}

// ── Store ────────────────────────────────────────────────

/// Where abilities live. Every lookup is scoped to the caller.
#[async_trait]
pub trait AbilityStore: Send + Sync {
    /// Returns the ability if it exists and `identity` may see it.
    async fn get(&self, id: &str, identity: &Identity) -> anyhow::Result<Option<Ability>>;

    /// All abilities visible to `identity`, sorted by id.
    async fn list(&self, identity: &Identity) -> anyhow::Result<Vec<Ability>>;

    /// Records that `identity` just ran the ability.
    async fn mark_used(&self, id: &str, identity: &Identity) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct InMemoryAbilityStore {
    abilities: RwLock<HashMap<String, Ability>>,
}

impl InMemoryAbilityStore {
    pub fn new(abilities: impl IntoIterator<Item = Ability>) -> Self {
        Self {
            abilities: RwLock::new(
                abilities
                    .into_iter()
                    .map(|ability| (ability.id.clone(), ability))
                    .collect(),
            ),
        }
    }

    /// Adds or replaces an ability.
    pub async fn insert(&self, ability: Ability) {
        self.abilities.write().await.insert(ability.id.clone(), ability);
    }

    pub async fn len(&self) -> usize {
        self.abilities.read().await.len()
    }
}

#[async_trait]
impl AbilityStore for InMemoryAbilityStore {
    async fn get(&self, id: &str, identity: &Identity) -> anyhow::Result<Option<Ability>> {
        let abilities = self.abilities.read().await;
        Ok(abilities
            .get(id)
            .filter(|a| a.is_accessible_by(identity))
            .cloned())
    }

    async fn list(&self, identity: &Identity) -> anyhow::Result<Vec<Ability>> {
        let abilities = self.abilities.read().await;
        let mut visible: Vec<Ability> = abilities
            .values()
            .filter(|a| a.is_accessible_by(identity))
            .cloned()
            .collect();
        visible.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(visible)
    }

    async fn mark_used(&self, id: &str, identity: &Identity) -> anyhow::Result<()> {
        let mut abilities = self.abilities.write().await;
        match abilities.get_mut(id) {
            Some(ability) if ability.is_accessible_by(identity) => {
                ability.last_used = Some(Utc::now());
                Ok(())
            }
            _ => anyhow::bail!("ability {id} not found"),
        }
    }
}

// ── Runner ───────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AbilityError {
    #[error("ability not found: {0}")]
    NotFound(String),

    #[error("ability is disabled: {0}")]
    Disabled(String),

    #[error("ability store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

/// Published after every ability run that reached the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum AbilityEvent {
    Executed {
        ability_id: String,
        identity: String,
        value: Value,
    },
    ExecutionFailed {
        ability_id: String,
        identity: String,
        failure: ExecutionFailure,
    },
}

const EVENT_CAPACITY: usize = 64;

/// Looks up abilities and runs them through the engine.
pub struct AbilityRunner {
    engine: Arc<ExecutionEngine>,
    store: Arc<dyn AbilityStore>,
    events: broadcast::Sender<AbilityEvent>,
    timeout: Duration,
}

impl AbilityRunner {
    pub fn new(engine: Arc<ExecutionEngine>, store: Arc<dyn AbilityStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            engine,
            store,
            events,
            timeout: Duration::ZERO,
        }
    }

    /// Timeout for ability runs; zero uses the engine default.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AbilityEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &Arc<dyn AbilityStore> {
        &self.store
    }

    /// Runs ability `id` as `identity`.
    ///
    /// Lookup problems are an `AbilityError`; everything from the run itself
    /// (including script and capability failures) is in the returned
    /// `ExecutionResult`.
    pub async fn execute_ability(
        &self,
        id: &str,
        params: Value,
        identity: &Identity,
    ) -> Result<ExecutionResult, AbilityError> {
        if !identity.is_valid() {
            return Ok(ExecutionResult::missing_identity());
        }
        let ability = self
            .store
            .get(id, identity)
            .await?
            .ok_or_else(|| AbilityError::NotFound(id.to_string()))?;
        if !ability.is_enabled {
            return Err(AbilityError::Disabled(id.to_string()));
        }

        info!(ability = %id, identity = %identity.id, version = %ability.version, "Running ability");
        let request = ExecutionRequest::new(ability.script, identity.clone())
            .with_params(params)
            .with_timeout(self.timeout);
        let result = self.engine.execute(request).await;

        let event = match &result {
            ExecutionResult::Success { value } => {
                if let Err(e) = self.store.mark_used(id, identity).await {
                    warn!(ability = %id, "Failed to record ability use: {e:#}");
                }
                AbilityEvent::Executed {
                    ability_id: id.to_string(),
                    identity: identity.id.clone(),
                    value: value.clone(),
                }
            }
            ExecutionResult::Failure(failure) => AbilityEvent::ExecutionFailed {
                ability_id: id.to_string(),
                identity: identity.id.clone(),
                failure: failure.clone(),
            },
        };
        if self.events.send(event).is_err() {
            debug!(ability = %id, "No ability event subscribers");
        }
        Ok(result)
    }

    /// Enabled abilities visible to `identity` whose keyword occurs in `text`.
    pub async fn find_by_keyword(
        &self,
        text: &str,
        identity: &Identity,
    ) -> Result<Vec<Ability>, AbilityError> {
        Ok(self
            .store
            .list(identity)
            .await?
            .into_iter()
            .filter(|a| a.is_enabled && a.matches_keyword(text))
            .collect())
    }

    /// Enabled abilities visible to `identity` triggered by `event_type`.
    pub async fn find_by_event(
        &self,
        event_type: &str,
        identity: &Identity,
    ) -> Result<Vec<Ability>, AbilityError> {
        Ok(self
            .store
            .list(identity)
            .await?
            .into_iter()
            .filter(|a| a.is_enabled && a.matches_event(event_type))
            .collect())
    }
}
