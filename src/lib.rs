//! Capability-scoped execution of user-authored Ability scripts.
//!
//! Scripts run in a fresh, closed Lua VM and reach the host only through
//! named capabilities, each call attributed to the identity the execution
//! was started with.

pub mod ability;
pub mod backend;
pub mod capabilities;
pub mod config;
pub mod identity;
pub mod sandbox;

pub use ability::{Ability, AbilityError, AbilityEvent, AbilityRunner, AbilityStore, AbilityTrigger};
pub use capabilities::{Capability, CapabilityError, CapabilityGateway, CapabilityRegistry};
pub use identity::Identity;
pub use sandbox::{ExecutionEngine, ExecutionRequest, ExecutionResult, FailureKind, SandboxLimits};
