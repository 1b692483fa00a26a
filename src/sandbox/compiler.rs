//! Script compiler: turns untrusted source into an isolated, runnable unit.
//!
//! Every compile builds a brand-new Lua VM with only the pure standard
//! libraries loaded, then parses the script into a function whose
//! environment is a fresh table. Nothing runs at compile time.

use mlua::{ChunkMode, Function, Lua, LuaOptions, LuaSerdeExt, StdLib, Table, Value as LuaValue};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::proxy::{has_non_finite, CapabilityProxy};
use super::{ExecutionGuard, SandboxLimits};
use crate::capabilities::CapabilityError;

/// Globals copied from the VM into each script environment.
///
/// Everything else (`io`, `os`, `require`, `load`, `dofile`, `print`,
/// `_G`, `getmetatable`, `setmetatable`, `coroutine`, `debug`, `collectgarbage`)
/// is absent. `pcall` and `xpcall` are swapped for deadline-aware wrappers
/// when the script runs.
///
/// The instruction hook cannot interrupt a single C call, so a pathological
/// `string.find`/`string.gsub` pattern over a large subject runs to
/// completion before the deadline is noticed. The memory limit bounds the
/// subject size; the engine's timeout still returns on time.
pub const SAFE_GLOBALS: &[&str] = &[
    "assert", "error", "ipairs", "next", "pairs", "pcall", "rawequal", "rawget", "rawlen",
    "select", "tonumber", "tostring", "type", "xpcall", "string", "table", "math", "utf8",
];

const CHUNK_NAME: &str = "=ability";

/// Builds `pcall`/`xpcall` wrappers over the raw ones. Runs with the VM's
/// global table, which scripts never see.
const GUARDED_PCALL: &str = r#"
local raw_pcall, raw_xpcall, must_stop = ...
local function settle(ok, ...)
  if not ok and must_stop() then
    error((...), 0)
  end
  return ok, ...
end
return function(f, ...)
  return settle(raw_pcall(f, ...))
end, function(f, handler, ...)
  return settle(raw_xpcall(f, handler, ...))
end
"#;

/// The script could not be parsed. Nothing was executed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CompileError {
    pub message: String,
}

impl CompileError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// How a compiled script ended when it did not return a value.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptFailure {
    /// Uncaught script error, or a value that could not cross the boundary.
    Runtime(String),
    /// A capability call failed and the script did not catch it.
    Capability(CapabilityError),
    /// The deadline hook stopped the VM.
    Aborted,
}

pub struct ScriptCompiler {
    limits: SandboxLimits,
}

impl ScriptCompiler {
    pub fn new(limits: SandboxLimits) -> Self {
        Self { limits }
    }

    pub fn compile(&self, source: &str) -> Result<CompiledScript, CompileError> {
        let lua = Lua::new_with(
            StdLib::STRING | StdLib::TABLE | StdLib::MATH | StdLib::UTF8,
            LuaOptions::default(),
        )
        .map_err(|e| CompileError::new(format!("cannot create script VM: {e}")))?;

        if self.limits.memory_limit > 0 {
            lua.set_memory_limit(self.limits.memory_limit)
                .map_err(|e| CompileError::new(format!("cannot set memory limit: {e}")))?;
        }

        let env = build_environment(&lua)
            .map_err(|e| CompileError::new(format!("cannot build script environment: {e}")))?;

        // Text mode only: precompiled bytecode can corrupt the VM.
        let entry = lua
            .load(source)
            .set_name(CHUNK_NAME)
            .set_mode(ChunkMode::Text)
            .set_environment(env.clone())
            .into_function()
            .map_err(|e| match e {
                mlua::Error::SyntaxError { message, .. } => CompileError::new(message),
                other => CompileError::new(other.to_string()),
            })?;

        debug!(bytes = source.len(), "Compiled script");
        Ok(CompiledScript {
            lua,
            env,
            entry,
            check_interval: self.limits.instruction_check_interval.max(1),
        })
    }
}

fn build_environment(lua: &Lua) -> mlua::Result<Table> {
    let globals = lua.globals();
    let env = lua.create_table()?;
    for name in SAFE_GLOBALS {
        let value: LuaValue = globals.raw_get(*name)?;
        env.raw_set(*name, value)?;
    }
    Ok(env)
}

/// A parsed script bound to its own VM. Consumed by [`CompiledScript::run`].
pub struct CompiledScript {
    lua: Lua,
    env: Table,
    entry: Function,
    check_interval: u32,
}

impl std::fmt::Debug for CompiledScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledScript")
            .field("check_interval", &self.check_interval)
            .finish_non_exhaustive()
    }
}

impl CompiledScript {
    /// Binds `params` and `capabilities`, then runs the script to completion.
    ///
    /// Returns the script's first return value as JSON (`nil` → `null`).
    pub async fn run(
        self,
        params: Value,
        capabilities: CapabilityProxy,
        guard: ExecutionGuard,
    ) -> Result<Value, ScriptFailure> {
        let lua = self.lua;

        let lua_params = lua
            .to_value_with(&params, super::proxy::serialize_options())
            .map_err(|e| ScriptFailure::Runtime(format!("cannot pass params to script: {e}")))?;
        let lua_capabilities = capabilities
            .install(&lua)
            .map_err(|e| ScriptFailure::Runtime(format!("cannot install capabilities: {e}")))?;
        self.env
            .raw_set("params", lua_params)
            .and_then(|_| self.env.raw_set("capabilities", lua_capabilities))
            .map_err(|e| ScriptFailure::Runtime(format!("cannot bind script globals: {e}")))?;

        install_guarded_pcall(&lua, &self.env, &guard)
            .map_err(|e| ScriptFailure::Runtime(format!("cannot install pcall guard: {e}")))?;

        // The hook is per coroutine: it must be set on the thread that runs
        // the chunk, not on the main state.
        let thread = lua
            .create_thread(self.entry.clone())
            .map_err(|e| ScriptFailure::Runtime(format!("cannot start script thread: {e}")))?;
        let hook_guard = guard.clone();
        thread.set_hook(
            mlua::HookTriggers::new().every_nth_instruction(self.check_interval),
            move |_lua, _debug| {
                if hook_guard.check() {
                    Ok(mlua::VmState::Continue)
                } else {
                    Err(mlua::Error::runtime("execution deadline exceeded"))
                }
            },
        );

        let outcome = thread.into_async::<LuaValue>(()).await;

        let value = match outcome {
            Ok(value) => value,
            Err(e) => return Err(classify(&e, &guard)),
        };
        if guard.timed_out() {
            return Err(ScriptFailure::Aborted);
        }
        if has_non_finite(&value) {
            return Err(ScriptFailure::Runtime(
                "unsupported return value: non-finite number".to_string(),
            ));
        }
        lua.from_value::<Value>(value)
            .map_err(|e| ScriptFailure::Runtime(format!("unsupported return value: {e}")))
    }
}

/// Replaces `pcall`/`xpcall` in `env` with versions that re-raise once the
/// execution must stop, so a script cannot swallow the deadline error.
fn install_guarded_pcall(lua: &Lua, env: &Table, guard: &ExecutionGuard) -> mlua::Result<()> {
    let globals = lua.globals();
    let raw_pcall: Function = globals.raw_get("pcall")?;
    let raw_xpcall: Function = globals.raw_get("xpcall")?;
    let stop_guard = guard.clone();
    let must_stop = lua.create_function(move |_, ()| Ok(!stop_guard.check()))?;
    let (pcall, xpcall): (Function, Function) = lua
        .load(GUARDED_PCALL)
        .set_name("=guard")
        .call((raw_pcall, raw_xpcall, must_stop))?;
    env.raw_set("pcall", pcall)?;
    env.raw_set("xpcall", xpcall)?;
    Ok(())
}

fn classify(err: &mlua::Error, guard: &ExecutionGuard) -> ScriptFailure {
    if guard.timed_out() {
        return ScriptFailure::Aborted;
    }
    if let Some(cap_err) = find_capability_error(err) {
        return ScriptFailure::Capability(cap_err.clone());
    }
    ScriptFailure::Runtime(describe(err))
}

fn find_capability_error(err: &mlua::Error) -> Option<&CapabilityError> {
    match err {
        mlua::Error::ExternalError(inner) => inner.downcast_ref::<CapabilityError>(),
        mlua::Error::CallbackError { cause, .. } => find_capability_error(cause),
        mlua::Error::WithContext { cause, .. } => find_capability_error(cause),
        _ => None,
    }
}

fn describe(err: &mlua::Error) -> String {
    match err {
        mlua::Error::RuntimeError(message) => message.clone(),
        mlua::Error::CallbackError { cause, .. } => describe(cause),
        mlua::Error::WithContext { cause, .. } => describe(cause),
        mlua::Error::MemoryError(message) => format!("memory limit exceeded: {message}"),
        other => other.to_string(),
    }
}
