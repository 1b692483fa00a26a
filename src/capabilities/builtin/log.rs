use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::capabilities::{parse_params, Capability};
use crate::identity::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Deserialize)]
struct LogParams {
    message: String,
    #[serde(default)]
    details: Value,
}

/// `log.info` / `log.warn` / `log.error(message, details)`: script logging.
///
/// Lines go to the host's tracing output tagged with the executing
/// identity. This is the only output channel a script has besides its
/// return value.
pub struct LogCapability {
    level: LogLevel,
}

impl LogCapability {
    pub fn new(level: LogLevel) -> Self {
        Self { level }
    }
}

#[async_trait]
impl Capability for LogCapability {
    fn name(&self) -> &str {
        match self.level {
            LogLevel::Info => "log.info",
            LogLevel::Warn => "log.warn",
            LogLevel::Error => "log.error",
        }
    }

    fn description(&self) -> &str {
        "Write a line to the execution log, with optional structured details."
    }

    fn parameters(&self) -> &[&'static str] {
        &["message", "details"]
    }

    async fn invoke(&self, params: Value, identity: &Identity) -> anyhow::Result<Value> {
        let p: LogParams = parse_params(self.name(), params)?;
        let details = if p.details.is_null() {
            String::new()
        } else {
            p.details.to_string()
        };
        match self.level {
            LogLevel::Info => info!(identity = %identity.id, %details, "Script: {}", p.message),
            LogLevel::Warn => warn!(identity = %identity.id, %details, "Script: {}", p.message),
            LogLevel::Error => error!(identity = %identity.id, %details, "Script: {}", p.message),
        }
        Ok(Value::Null)
    }
}
