//! Execution engine: identity check → compile → run under a deadline.
//!
//! Each execution walks a small state machine:
//!
//! ```text
//! Pending ──► Compiling ──► Running ──► Completed
//!    │            │            ├──────► Failed
//!    └────────────┴──────────► │
//!                 Failed       └──────► TimedOut
//! ```
//!
//! Terminal states are final. Exactly one [`ExecutionResult`] is produced
//! per execution; whatever the VM or an in-flight capability does after a
//! timeout is discarded.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::compiler::{ScriptCompiler, ScriptFailure};
use super::proxy::CapabilityProxy;
use super::result::{ExecutionResult, FailureKind};
use super::{ExecutionGuard, SandboxLimits};
use crate::capabilities::{CapabilityGateway, CapabilityRegistry};
use crate::identity::Identity;

/// A request to run one script.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub script_source: String,
    pub params: Value,
    /// `None` is rejected with `MissingIdentity` before anything runs.
    pub identity: Option<Identity>,
    /// `Duration::ZERO` selects the engine's default timeout.
    pub timeout: Duration,
}

impl ExecutionRequest {
    pub fn new(script_source: impl Into<String>, identity: Identity) -> Self {
        Self {
            script_source: script_source.into(),
            params: Value::Null,
            identity: Some(identity),
            timeout: Duration::ZERO,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Pending,
    Compiling,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }

    fn can_advance_to(self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, next),
            (Pending, Compiling)
                | (Pending, Failed)
                | (Compiling, Running)
                | (Compiling, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, TimedOut)
        )
    }
}

/// Tracks the state of one execution for logging.
struct Execution {
    id: Uuid,
    state: ExecutionState,
}

impl Execution {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: ExecutionState::Pending,
        }
    }

    fn advance(&mut self, next: ExecutionState) {
        if !self.state.can_advance_to(next) {
            warn!(execution = %self.id, from = ?self.state, to = ?next, "Ignoring invalid state transition");
            return;
        }
        debug!(execution = %self.id, from = ?self.state, to = ?next, "Execution state");
        self.state = next;
    }

    /// Moves to the terminal state matching `result` and hands it back.
    fn finish(&mut self, result: ExecutionResult) -> ExecutionResult {
        let next = match result.failure_kind() {
            None => ExecutionState::Completed,
            Some(FailureKind::Timeout) => ExecutionState::TimedOut,
            Some(_) => ExecutionState::Failed,
        };
        self.advance(next);
        result
    }
}

/// Runs scripts against a frozen capability registry.
///
/// Cheap to share: hold it in an `Arc` and call [`ExecutionEngine::execute`]
/// from as many tasks as needed.
pub struct ExecutionEngine {
    gateway: CapabilityGateway,
    compiler: ScriptCompiler,
    limits: SandboxLimits,
}

impl ExecutionEngine {
    pub fn new(registry: Arc<CapabilityRegistry>, limits: SandboxLimits) -> Self {
        Self {
            gateway: CapabilityGateway::new(registry),
            compiler: ScriptCompiler::new(limits.clone()),
            limits,
        }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        self.gateway.registry()
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Shorthand for [`ExecutionEngine::execute`].
    pub async fn run(
        &self,
        script_source: &str,
        params: Value,
        identity: Identity,
        timeout: Duration,
    ) -> ExecutionResult {
        self.execute(
            ExecutionRequest::new(script_source, identity)
                .with_params(params)
                .with_timeout(timeout),
        )
        .await
    }

    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let mut execution = Execution::new();

        let Some(identity) = request.identity.filter(Identity::is_valid) else {
            warn!(execution = %execution.id, "Rejected execution without identity");
            return execution.finish(ExecutionResult::missing_identity());
        };
        let timeout = self.effective_timeout(request.timeout);
        info!(
            execution = %execution.id,
            identity = %identity.id,
            timeout_ms = timeout.as_millis() as u64,
            "Executing script"
        );

        execution.advance(ExecutionState::Compiling);
        let compiled = match self.compiler.compile(&request.script_source) {
            Ok(compiled) => compiled,
            Err(e) => {
                info!(execution = %execution.id, "Compile failed: {}", e.message);
                return execution.finish(ExecutionResult::failure(
                    FailureKind::CompileFailed,
                    e.message,
                ));
            }
        };

        execution.advance(ExecutionState::Running);
        let guard = ExecutionGuard::new(timeout);
        let proxy = CapabilityProxy::new(self.gateway.clone(), identity, guard.clone());
        let params = request.params;
        let run_guard = guard.clone();
        let handle = tokio::runtime::Handle::current();
        // The VM runs on a blocking thread so a script that never yields
        // cannot hold up the runtime, and the timeout below still fires.
        let task = tokio::task::spawn_blocking(move || {
            handle.block_on(compiled.run(params, proxy, run_guard))
        });

        let result = match tokio::time::timeout(timeout, task).await {
            Err(_) => {
                guard.cancel();
                ExecutionResult::timeout(timeout)
            }
            Ok(Err(join_err)) => {
                warn!(execution = %execution.id, "Script task failed: {join_err}");
                ExecutionResult::failure(
                    FailureKind::ScriptRuntimeError,
                    "script execution aborted unexpectedly",
                )
            }
            Ok(Ok(outcome)) => match outcome {
                Ok(value) => ExecutionResult::success(value),
                Err(ScriptFailure::Aborted) => ExecutionResult::timeout(timeout),
                Err(ScriptFailure::Capability(e)) => ExecutionResult::capability_failed(&e),
                Err(ScriptFailure::Runtime(message)) => {
                    ExecutionResult::failure(FailureKind::ScriptRuntimeError, message)
                }
            },
        };

        match result.error() {
            None => info!(execution = %execution.id, "Execution completed"),
            Some(failure) => info!(
                execution = %execution.id,
                kind = ?failure.kind,
                "Execution failed: {}",
                failure.message
            ),
        }
        execution.finish(result)
    }

    fn effective_timeout(&self, requested: Duration) -> Duration {
        let timeout = if requested.is_zero() {
            self.limits.default_timeout
        } else {
            requested
        };
        timeout.min(self.limits.max_timeout)
    }
}
