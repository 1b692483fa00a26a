//! Capabilities: the only way a script can affect anything outside its VM.
//!
//! Every host operation a script may call (create a task, search knowledge,
//! send a notification…) implements [`Capability`]. Capabilities are
//! registered once at startup in a [`CapabilityRegistry`] and reached from
//! scripts exclusively by name, through the [`CapabilityGateway`].

pub mod builtin;
pub mod gateway;
pub mod registry;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::identity::Identity;

pub use gateway::CapabilityGateway;
pub use registry::{CapabilityRegistry, RegistryError};

/// A narrow, host-implemented operation exposed to scripts.
///
/// Implementations receive already-authorized calls: role checks happen in
/// the gateway before `invoke` is reached. They must validate their own
/// parameters and must never hand raw host objects back to the script.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Default registration name, dotted by namespace (e.g. `"task.create"`).
    fn name(&self) -> &str;

    /// Human-readable description, shown by `junai-sandbox capabilities`.
    fn description(&self) -> &str;

    /// Names used to bind positional script arguments into a parameter
    /// object, in order. Capabilities taking only an object may leave this empty.
    fn parameters(&self) -> &[&'static str] {
        &[]
    }

    /// Role an identity must hold to call this capability.
    fn required_role(&self) -> Option<&str> {
        None
    }

    /// Performs the operation on behalf of `identity`.
    async fn invoke(&self, params: Value, identity: &Identity) -> anyhow::Result<Value>;
}

/// A registered capability: its name, its role requirement and the handler.
///
/// Built by the registry at registration time and immutable afterwards.
#[derive(Clone)]
pub struct CapabilityDescriptor {
    name: String,
    required_role: Option<String>,
    handler: Arc<dyn Capability>,
}

impl CapabilityDescriptor {
    pub(crate) fn new(
        name: String,
        required_role: Option<String>,
        handler: Arc<dyn Capability>,
    ) -> Self {
        Self {
            name,
            required_role,
            handler,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        self.handler.description()
    }

    pub fn parameters(&self) -> &[&'static str] {
        self.handler.parameters()
    }

    pub fn required_role(&self) -> Option<&str> {
        self.required_role.as_deref()
    }

    /// Returns true if `identity` satisfies the role requirement.
    pub fn permits(&self, identity: &Identity) -> bool {
        match &self.required_role {
            Some(role) => identity.has_role(role),
            None => true,
        }
    }

    pub(crate) async fn invoke(&self, params: Value, identity: &Identity) -> anyhow::Result<Value> {
        self.handler.invoke(params, identity).await
    }
}

impl fmt::Debug for CapabilityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityDescriptor")
            .field("name", &self.name)
            .field("required_role", &self.required_role)
            .finish_non_exhaustive()
    }
}

// ── Errors ───────────────────────────────────────────────

/// Why a capability call failed, without the details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityErrorKind {
    UnknownCapability,
    Unauthorized,
    InvalidParams,
    HostFailure,
    Cancelled,
}

/// Uniform failure shape of a capability call.
///
/// Host-side errors and panics are always converted into this type by the
/// gateway; scripts never observe a raw host error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("unknown capability: {capability}")]
    Unknown { capability: String },

    #[error("capability {capability} requires role '{required_role}'")]
    Unauthorized {
        capability: String,
        required_role: String,
    },

    #[error("invalid parameters for {capability}: {message}")]
    InvalidParams { capability: String, message: String },

    #[error("capability {capability} failed: {cause}")]
    Failed { capability: String, cause: String },

    #[error("capability {capability} called after the execution was cancelled")]
    Cancelled { capability: String },
}

impl CapabilityError {
    /// Name of the capability the failing call targeted.
    pub fn capability(&self) -> &str {
        match self {
            Self::Unknown { capability }
            | Self::Unauthorized { capability, .. }
            | Self::InvalidParams { capability, .. }
            | Self::Failed { capability, .. }
            | Self::Cancelled { capability } => capability,
        }
    }

    pub fn kind(&self) -> CapabilityErrorKind {
        match self {
            Self::Unknown { .. } => CapabilityErrorKind::UnknownCapability,
            Self::Unauthorized { .. } => CapabilityErrorKind::Unauthorized,
            Self::InvalidParams { .. } => CapabilityErrorKind::InvalidParams,
            Self::Failed { .. } => CapabilityErrorKind::HostFailure,
            Self::Cancelled { .. } => CapabilityErrorKind::Cancelled,
        }
    }

    /// Re-attributes the error to `capability`. The gateway uses this so the
    /// reported name is always the one the script called, even when a
    /// handler is registered under a different name.
    pub(crate) fn attributed_to(self, capability: &str) -> Self {
        let capability = capability.to_string();
        match self {
            Self::Unknown { .. } => Self::Unknown { capability },
            Self::Unauthorized { required_role, .. } => Self::Unauthorized {
                capability,
                required_role,
            },
            Self::InvalidParams { message, .. } => Self::InvalidParams {
                capability,
                message,
            },
            Self::Failed { cause, .. } => Self::Failed { capability, cause },
            Self::Cancelled { .. } => Self::Cancelled { capability },
        }
    }
}

/// Deserializes a capability's parameter object into its typed form.
///
/// Failures are reported as [`CapabilityError::InvalidParams`] so the
/// gateway can tell them apart from backend failures.
pub fn parse_params<T: DeserializeOwned>(capability: &str, params: Value) -> anyhow::Result<T> {
    serde_json::from_value(params).map_err(|e| {
        anyhow::Error::new(CapabilityError::InvalidParams {
            capability: capability.to_string(),
            message: e.to_string(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Point {
        x: i64,
        #[allow(dead_code)]
        y: i64,
    }

    #[test]
    fn test_parse_params_ok() {
        let p: Point = parse_params("geo.point", json!({"x": 1, "y": 2})).unwrap();
        assert_eq!(p.x, 1);
    }

    #[test]
    fn test_parse_params_reports_invalid_params() {
        let err = parse_params::<Point>("geo.point", json!({"x": "one"})).unwrap_err();
        let cap_err = err.downcast_ref::<CapabilityError>().unwrap();
        assert_eq!(cap_err.kind(), CapabilityErrorKind::InvalidParams);
        assert_eq!(cap_err.capability(), "geo.point");
    }

    #[test]
    fn test_attributed_to_keeps_details() {
        let err = CapabilityError::Failed {
            capability: "inner".into(),
            cause: "disk full".into(),
        }
        .attributed_to("outer.name");
        assert_eq!(
            err,
            CapabilityError::Failed {
                capability: "outer.name".into(),
                cause: "disk full".into(),
            }
        );
    }

    #[test]
    fn test_error_kinds_serialize_snake_case() {
        assert_eq!(
            serde_json::to_value(CapabilityErrorKind::UnknownCapability).unwrap(),
            json!("unknown_capability")
        );
    }
}
