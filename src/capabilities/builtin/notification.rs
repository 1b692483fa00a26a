use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::backend::{NewNotification, NotificationBackend};
use crate::capabilities::{parse_params, Capability};
use crate::identity::Identity;

#[derive(Debug, Deserialize)]
struct SendParams {
    message: String,
    #[serde(default = "default_type", rename = "type")]
    kind: String,
    #[serde(default = "default_channel")]
    channel: String,
}

fn default_type() -> String {
    "info".to_string()
}

fn default_channel() -> String {
    "ui".to_string()
}

/// `notification.send(message, type, channel)` → notification id.
///
/// The recipient is always the executing identity; a script cannot address
/// another user.
pub struct NotificationSendCapability {
    backend: Arc<dyn NotificationBackend>,
}

impl NotificationSendCapability {
    pub fn new(backend: Arc<dyn NotificationBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Capability for NotificationSendCapability {
    fn name(&self) -> &str {
        "notification.send"
    }

    fn description(&self) -> &str {
        "Send a notification to the executing user. Type defaults to 'info', channel to 'ui'."
    }

    fn parameters(&self) -> &[&'static str] {
        &["message", "type", "channel"]
    }

    async fn invoke(&self, params: Value, identity: &Identity) -> anyhow::Result<Value> {
        let p: SendParams = parse_params(self.name(), params)?;
        let id = self
            .backend
            .send(
                identity,
                NewNotification {
                    message: p.message,
                    kind: p.kind,
                    channel: p.channel,
                },
            )
            .await?;
        Ok(json!(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalStore;

    #[tokio::test]
    async fn test_send_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cap = NotificationSendCapability::new(Arc::new(LocalStore::open(dir.path()).unwrap()));
        cap.invoke(json!({"message": "hi"}), &Identity::new("alice"))
            .await
            .unwrap();
        let raw = std::fs::read_to_string(dir.path().join("alice/notifications.jsonl")).unwrap();
        assert!(raw.contains("\"kind\":\"info\""));
        assert!(raw.contains("\"channel\":\"ui\""));
        assert!(raw.contains("\"read\":false"));
    }

    #[tokio::test]
    async fn test_send_reads_type_field() {
        let dir = tempfile::tempdir().unwrap();
        let cap = NotificationSendCapability::new(Arc::new(LocalStore::open(dir.path()).unwrap()));
        cap.invoke(
            json!({"message": "careful", "type": "warning", "channel": "email"}),
            &Identity::new("alice"),
        )
        .await
        .unwrap();
        let raw = std::fs::read_to_string(dir.path().join("alice/notifications.jsonl")).unwrap();
        assert!(raw.contains("\"kind\":\"warning\""));
        assert!(raw.contains("\"channel\":\"email\""));
    }
}
