use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::identity::Identity;

use super::{CapabilityDescriptor, CapabilityError, CapabilityRegistry};

/// Mediates every capability call made by a running script.
///
/// Resolution, authorization and error normalization all happen here, so
/// individual capabilities never implement their own access checks.
/// The gateway holds no mutable state and is cheap to clone.
#[derive(Clone)]
pub struct CapabilityGateway {
    registry: Arc<CapabilityRegistry>,
}

impl CapabilityGateway {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Calls capability `name` on behalf of `identity`.
    ///
    /// The role check runs before the handler is touched: an `Unauthorized`
    /// result guarantees the host function was not invoked. The handler
    /// runs at most once; there is no retry.
    pub async fn call(
        &self,
        name: &str,
        params: Value,
        identity: &Identity,
    ) -> Result<Value, CapabilityError> {
        let Some(descriptor) = self.registry.resolve(name) else {
            warn!(capability = name, identity = %identity.id, "Unknown capability requested");
            return Err(CapabilityError::Unknown {
                capability: name.to_string(),
            });
        };

        if !descriptor.permits(identity) {
            let required_role = descriptor.required_role().unwrap_or_default().to_string();
            warn!(
                capability = name,
                identity = %identity.id,
                required_role = %required_role,
                "Capability call rejected: missing role"
            );
            return Err(CapabilityError::Unauthorized {
                capability: name.to_string(),
                required_role,
            });
        }

        let params = bind_params(descriptor, params)?;

        debug!(capability = name, identity = %identity.id, "Dispatching capability call");

        let outcome = AssertUnwindSafe(descriptor.invoke(params, identity))
            .catch_unwind()
            .await;

        let error = match outcome {
            Ok(Ok(value)) => {
                debug!(capability = name, identity = %identity.id, "Capability call succeeded");
                return Ok(value);
            }
            Ok(Err(e)) => match e.downcast::<CapabilityError>() {
                Ok(cap_err) => cap_err.attributed_to(name),
                Err(e) => CapabilityError::Failed {
                    capability: name.to_string(),
                    cause: format!("{e:#}"),
                },
            },
            Err(panic) => CapabilityError::Failed {
                capability: name.to_string(),
                cause: format!("capability panicked: {}", panic_message(panic.as_ref())),
            },
        };

        warn!(capability = name, identity = %identity.id, "Capability call failed: {error}");
        Err(error)
    }
}

/// Turns the script's arguments into the handler's parameter object.
///
/// Objects pass through untouched. Positional arguments (a JSON array) are
/// zipped with the declared parameter names; `null` positions are dropped
/// so optional parameters fall back to their defaults.
fn bind_params(descriptor: &CapabilityDescriptor, params: Value) -> Result<Value, CapabilityError> {
    let names = descriptor.parameters();
    let Value::Array(args) = params else {
        return Ok(params);
    };
    if names.is_empty() {
        return Ok(Value::Array(args));
    }
    if args.len() > names.len() {
        return Err(CapabilityError::InvalidParams {
            capability: descriptor.name().to_string(),
            message: format!(
                "expected at most {} arguments ({}), got {}",
                names.len(),
                names.join(", "),
                args.len()
            ),
        });
    }

    let mut object = Map::new();
    for (name, arg) in names.iter().zip(args) {
        if !arg.is_null() {
            object.insert((*name).to_string(), arg);
        }
    }
    Ok(Value::Object(object))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
