//! Execution sandbox for Ability scripts.
//!
//! The security model is layered:
//!
//! 1. Fresh Lua VM per execution: no state survives between runs
//! 2. Closed environment: a script sees `params`, `capabilities` and a fixed
//!    list of pure builtins, nothing else (no `io`, `os`, `require`, `load`)
//! 3. Capability gateway: every host interaction is resolved by name,
//!    role-checked, and attributed to the execution identity
//! 4. Resource limits: VM memory ceiling, and a deadline enforced both by an
//!    instruction-count hook and by the engine's timeout race
//! 5. Thread isolation: the VM runs on a blocking thread, so a runaway
//!    script never stalls the async runtime

pub mod compiler;
pub mod engine;
pub mod proxy;
pub mod result;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::SandboxConfig;

pub use compiler::{CompileError, CompiledScript, ScriptCompiler, SAFE_GLOBALS};
pub use engine::{ExecutionEngine, ExecutionRequest, ExecutionState};
pub use proxy::CapabilityProxy;
pub use result::{ExecutionFailure, ExecutionResult, FailureKind};

/// Resource limits applied to every execution.
#[derive(Debug, Clone)]
pub struct SandboxLimits {
    /// Used when a request does not specify a timeout.
    pub default_timeout: Duration,
    /// Upper bound; longer requested timeouts are clamped.
    pub max_timeout: Duration,
    /// VM allocation ceiling in bytes; 0 disables the limit.
    pub memory_limit: usize,
    /// The deadline hook runs every this many VM instructions.
    pub instruction_check_interval: u32,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self::from(&SandboxConfig::default())
    }
}

impl From<&SandboxConfig> for SandboxLimits {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            default_timeout: Duration::from_millis(config.default_timeout_ms),
            max_timeout: Duration::from_millis(config.max_timeout_ms),
            memory_limit: config.memory_limit_bytes,
            instruction_check_interval: config.instruction_check_interval.max(1),
        }
    }
}

/// Per-execution cancellation state shared by the engine, the VM hook and
/// the capability proxy.
///
/// Once cancelled it stays cancelled: the proxy refuses new capability
/// calls and discards completions of calls that were already in flight.
#[derive(Debug, Clone)]
pub struct ExecutionGuard {
    inner: Arc<GuardState>,
}

#[derive(Debug)]
struct GuardState {
    deadline: Instant,
    cancelled: AtomicBool,
    deadline_hit: AtomicBool,
}

impl ExecutionGuard {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(GuardState {
                deadline: Instant::now() + timeout,
                cancelled: AtomicBool::new(false),
                deadline_hit: AtomicBool::new(false),
            }),
        }
    }

    /// Marks the execution as timed out and cancelled.
    pub fn cancel(&self) {
        self.inner.deadline_hit.store(true, Ordering::SeqCst);
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// True once the deadline has been observed as exceeded.
    pub fn timed_out(&self) -> bool {
        self.inner.deadline_hit.load(Ordering::SeqCst)
    }

    /// Returns false (and cancels) if the execution must stop now.
    pub fn check(&self) -> bool {
        if self.is_cancelled() {
            return false;
        }
        if Instant::now() >= self.inner.deadline {
            self.cancel();
            return false;
        }
        true
    }
}
