//! The `capabilities` object a script sees.
//!
//! Scripts write `capabilities.task.create("x")`. Any dotted path resolves
//! to a callable; the name is only checked when it is called, by the
//! gateway. The proxy holds the execution identity, so scripts cannot
//! choose who a call is attributed to.

use mlua::{Lua, LuaSerdeExt, SerializeOptions, Table, Variadic, Value as LuaValue};
use serde_json::Value;
use tracing::debug;

use super::ExecutionGuard;
use crate::capabilities::{CapabilityError, CapabilityGateway};
use crate::identity::Identity;

/// Builds the read-only path proxy around a single dispatch function.
///
/// Runs with the VM's global table, which scripts never see.
const PRELUDE: &str = r#"
local dispatch = ...
local function readonly()
  error("capabilities are read-only", 2)
end
local function path(name)
  return setmetatable({}, {
    __index = function(_, key)
      return path(name .. "." .. tostring(key))
    end,
    __call = function(_, ...)
      return dispatch(name, ...)
    end,
    __newindex = readonly,
    __metatable = false,
  })
end
return setmetatable({}, {
  __index = function(_, key)
    return path(tostring(key))
  end,
  __newindex = readonly,
  __metatable = false,
})
"#;

/// JSON `null` becomes `nil` so that `params.missing == nil` holds.
pub(crate) fn serialize_options() -> SerializeOptions {
    SerializeOptions::new()
        .serialize_none_to_null(false)
        .serialize_unit_to_null(false)
}

const MAX_SCAN_DEPTH: usize = 64;

/// True if `value` is, or contains, an infinite or NaN number. JSON cannot
/// represent those and serde would silently turn them into `null`.
pub(crate) fn has_non_finite(value: &LuaValue) -> bool {
    has_non_finite_at(value, 0)
}

fn has_non_finite_at(value: &LuaValue, depth: usize) -> bool {
    match value {
        LuaValue::Number(n) => !n.is_finite(),
        // Deeper (or cyclic) tables are rejected by the serde conversion.
        LuaValue::Table(table) if depth < MAX_SCAN_DEPTH => table
            .clone()
            .pairs::<LuaValue, LuaValue>()
            .flatten()
            .any(|(k, v)| has_non_finite_at(&k, depth + 1) || has_non_finite_at(&v, depth + 1)),
        _ => false,
    }
}

#[derive(Clone)]
pub struct CapabilityProxy {
    gateway: CapabilityGateway,
    identity: Identity,
    guard: ExecutionGuard,
}

impl CapabilityProxy {
    pub fn new(gateway: CapabilityGateway, identity: Identity, guard: ExecutionGuard) -> Self {
        Self {
            gateway,
            identity,
            guard,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Calls a capability on behalf of the script.
    ///
    /// Fails with `Cancelled` once the execution has been cancelled, both
    /// before dispatch and after a call that was in flight completes.
    pub async fn call(&self, name: &str, params: Value) -> Result<Value, CapabilityError> {
        if self.guard.is_cancelled() {
            return Err(CapabilityError::Cancelled {
                capability: name.to_string(),
            });
        }
        let result = self.gateway.call(name, params, &self.identity).await;
        if self.guard.is_cancelled() {
            debug!(capability = %name, "Discarding capability result after cancellation");
            return Err(CapabilityError::Cancelled {
                capability: name.to_string(),
            });
        }
        result
    }

    /// Creates the `capabilities` table inside `lua`.
    pub fn install(&self, lua: &Lua) -> mlua::Result<Table> {
        let proxy = self.clone();
        let dispatch = lua.create_async_function(
            move |lua, (name, args): (String, Variadic<LuaValue>)| {
                let proxy = proxy.clone();
                async move {
                    let params = encode_args(&lua, &args)?;
                    match proxy.call(&name, params).await {
                        Ok(value) => lua.to_value_with(&value, serialize_options()),
                        Err(e) => Err(mlua::Error::external(e)),
                    }
                }
            },
        )?;
        lua.load(PRELUDE)
            .set_name("=capabilities")
            .call::<Table>(dispatch)
    }
}

/// Script arguments → capability params.
///
/// A single table argument is passed through as a JSON object, so
/// `create({description = "x"})` works. Anything else becomes a positional
/// array that the gateway binds to the capability's parameter names.
fn encode_args(lua: &Lua, args: &[LuaValue]) -> mlua::Result<Value> {
    let mut values = Vec::with_capacity(args.len());
    for arg in args {
        if has_non_finite(arg) {
            return Err(mlua::Error::runtime(
                "capability arguments must not contain non-finite numbers",
            ));
        }
        values.push(lua.from_value::<Value>(arg.clone())?);
    }
    if values.len() == 1 && values[0].is_object() {
        return Ok(values.swap_remove(0));
    }
    Ok(Value::Array(values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::CapabilityRegistry;
    use futures::FutureExt;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn echo_gateway() -> CapabilityGateway {
        let mut registry = CapabilityRegistry::new();
        registry
            .register_fn("echo", None, |params, identity| {
                async move { Ok(json!({"params": params, "caller": identity.id})) }.boxed()
            })
            .unwrap();
        CapabilityGateway::new(Arc::new(registry))
    }

    #[tokio::test]
    async fn test_call_attributes_identity() {
        let guard = ExecutionGuard::new(Duration::from_secs(5));
        let proxy = CapabilityProxy::new(echo_gateway(), Identity::new("alice"), guard);
        let value = proxy.call("echo", json!(["x"])).await.unwrap();
        assert_eq!(value["caller"], "alice");
        assert_eq!(value["params"], json!(["x"]));
    }

    #[tokio::test]
    async fn test_call_after_cancel_is_refused() {
        let guard = ExecutionGuard::new(Duration::from_secs(5));
        let proxy = CapabilityProxy::new(echo_gateway(), Identity::new("alice"), guard.clone());
        guard.cancel();
        let err = proxy.call("echo", Value::Null).await.unwrap_err();
        assert_eq!(
            err,
            CapabilityError::Cancelled {
                capability: "echo".into()
            }
        );
    }

    #[test]
    fn test_encode_single_table_as_object() {
        let lua = Lua::new();
        let table = lua.create_table().unwrap();
        table.set("description", "x").unwrap();
        let encoded = encode_args(&lua, &[LuaValue::Table(table)]).unwrap();
        assert_eq!(encoded, json!({"description": "x"}));
    }

    #[test]
    fn test_encode_positional_args() {
        let lua = Lua::new();
        let s = lua.create_string("x").unwrap();
        let encoded =
            encode_args(&lua, &[LuaValue::String(s), LuaValue::Integer(3), LuaValue::Nil]).unwrap();
        assert_eq!(encoded, json!(["x", 3, null]));
    }

    #[test]
    fn test_encode_rejects_non_finite() {
        let lua = Lua::new();
        assert!(encode_args(&lua, &[LuaValue::Number(f64::NAN)]).is_err());
        let table = lua.create_table().unwrap();
        table.set("x", f64::INFINITY).unwrap();
        assert!(encode_args(&lua, &[LuaValue::Table(table)]).is_err());
    }

    #[test]
    fn test_has_non_finite_nested() {
        let lua = Lua::new();
        let nested: LuaValue = lua.load("return { a = { b = { 1, 2, 1/0 } } }").eval().unwrap();
        assert!(has_non_finite(&nested));
        let clean: LuaValue = lua.load("return { a = { 1.5, 2 } }").eval().unwrap();
        assert!(!has_non_finite(&clean));
        assert!(!has_non_finite(&LuaValue::Integer(3)));
    }

    #[test]
    fn test_encode_no_args() {
        let lua = Lua::new();
        assert_eq!(encode_args(&lua, &[]).unwrap(), json!([]));
    }

    #[test]
    fn test_install_builds_read_only_proxy() {
        let lua = Lua::new();
        let guard = ExecutionGuard::new(Duration::from_secs(5));
        let proxy = CapabilityProxy::new(echo_gateway(), Identity::new("alice"), guard);
        let capabilities = proxy.install(&lua).unwrap();
        lua.globals().set("capabilities", capabilities).unwrap();

        let is_callable: bool = lua
            .load("return type(capabilities.task.create) == 'table'")
            .eval()
            .unwrap();
        assert!(is_callable);

        let assign = lua.load("capabilities.echo = 1").exec();
        assert!(assign.is_err());

        let locked: bool = lua
            .load("return getmetatable(capabilities) == false")
            .eval()
            .unwrap();
        assert!(locked);
    }
}
