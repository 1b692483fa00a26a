use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

use junai_sandbox::ability::{AbilityRunner, InMemoryAbilityStore};
use junai_sandbox::backend::{Backends, LocalStore};
use junai_sandbox::capabilities::builtin::register_builtins;
use junai_sandbox::config::Config;
use junai_sandbox::{CapabilityRegistry, ExecutionEngine, ExecutionRequest, Identity, SandboxLimits};

const DEFAULT_CONFIG_PATH: &str = "config/sandbox.toml";

fn print_help() {
    println!(
        "\
junai-sandbox v{}

Runs Ability scripts in a capability-scoped sandbox.

USAGE:
    junai-sandbox [OPTIONS] <COMMAND>

COMMANDS:
    run <SCRIPT_FILE>       Execute a Lua script file
    ability <ABILITY_ID>    Execute an ability from the config file
    capabilities            List registered capabilities

RUN / ABILITY OPTIONS:
    --user <ID>             Identity to execute as (required)
    --role <ROLE>           Grant a role to the identity (repeatable)
    --params <JSON>         Script parameters [default: null]
    --timeout-ms <N>        Execution timeout [default: from config]

OPTIONS:
    -c, --config <PATH>     Path to TOML configuration file
                            [default: {DEFAULT_CONFIG_PATH}, missing file means defaults]
    -h, --help              Print this help message and exit
    -V, --version           Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG                Log level filter for tracing
                            (e.g. debug, junai_sandbox=debug,warn)

EXAMPLES:
    junai-sandbox run hello.lua --user alice --params '{{\"x\": 41}}'
    junai-sandbox ability daily-digest --user alice --role admin
    RUST_LOG=debug junai-sandbox capabilities",
        env!("CARGO_PKG_VERSION"),
    );
}

#[derive(Debug, PartialEq)]
enum Command {
    Run { script: PathBuf, invocation: Invocation },
    Ability { id: String, invocation: Invocation },
    Capabilities,
}

#[derive(Debug, PartialEq, Default)]
struct Invocation {
    user: Option<String>,
    roles: Vec<String>,
    params: Value,
    timeout: Duration,
}

impl Invocation {
    /// `None` when no `--user` was given; the engine reports that as a
    /// missing identity.
    fn identity(&self) -> Option<Identity> {
        let user = self.user.as_ref()?;
        Some(
            self.roles
                .iter()
                .fold(Identity::new(user.clone()), |id, role| id.with_role(role.clone())),
        )
    }
}

#[derive(Debug, PartialEq)]
struct Cli {
    config_path: String,
    command: Command,
}

fn parse_args(args: &[String]) -> Result<Cli> {
    let mut config_path = DEFAULT_CONFIG_PATH.to_string();
    let mut positional = Vec::new();
    let mut invocation = Invocation::default();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| {
            iter.next()
                .cloned()
                .ok_or_else(|| anyhow!("{flag} requires a value"))
        };
        match arg.as_str() {
            "-c" | "--config" => config_path = value(arg)?,
            "--user" => invocation.user = Some(value(arg)?),
            "--role" => invocation.roles.push(value(arg)?),
            "--params" => {
                let raw = value(arg)?;
                invocation.params =
                    serde_json::from_str(&raw).context("--params must be valid JSON")?;
            }
            "--timeout-ms" => {
                let raw = value(arg)?;
                let ms: u64 = raw
                    .parse()
                    .with_context(|| format!("invalid --timeout-ms: {raw}"))?;
                invocation.timeout = Duration::from_millis(ms);
            }
            flag if flag.starts_with('-') => bail!("unknown option: {flag}"),
            _ => positional.push(arg.clone()),
        }
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        Some("run") => {
            let script = positional
                .next()
                .ok_or_else(|| anyhow!("run requires a SCRIPT_FILE"))?;
            Command::Run {
                script: PathBuf::from(script),
                invocation,
            }
        }
        Some("ability") => {
            let id = positional
                .next()
                .ok_or_else(|| anyhow!("ability requires an ABILITY_ID"))?;
            Command::Ability { id, invocation }
        }
        Some("capabilities") => Command::Capabilities,
        Some(other) => bail!("unknown command: {other} (see --help)"),
        None => bail!("missing command (see --help)"),
    };
    if let Some(extra) = positional.next() {
        bail!("unexpected argument: {extra}");
    }

    Ok(Cli {
        config_path,
        command,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("junai-sandbox v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Logs go to stderr; stdout carries the JSON result
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("junai_sandbox=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_args(&args)?;

    info!("Loading configuration from {}", cli.config_path);
    let config = Config::load_or_default(&cli.config_path)?;

    let store = Arc::new(LocalStore::open(&config.store.path)?);
    let backends = Backends::local(store);
    let mut registry = CapabilityRegistry::new();
    register_builtins(&mut registry, &backends, &config.capabilities.roles)?;
    info!("Capabilities: {} registered", registry.len());

    let engine = Arc::new(ExecutionEngine::new(
        Arc::new(registry),
        SandboxLimits::from(&config.sandbox),
    ));

    let result = match cli.command {
        Command::Capabilities => {
            for descriptor in engine.registry().descriptors() {
                println!(
                    "{:<22} {:<10} {}",
                    descriptor.name(),
                    descriptor.required_role().unwrap_or("-"),
                    descriptor.description()
                );
            }
            return Ok(());
        }
        Command::Run { script, invocation } => {
            let source = std::fs::read_to_string(&script)
                .with_context(|| format!("cannot read {}", script.display()))?;
            let request = ExecutionRequest {
                script_source: source,
                params: invocation.params.clone(),
                identity: invocation.identity(),
                timeout: invocation.timeout,
            };
            engine.execute(request).await
        }
        Command::Ability { id, invocation } => {
            let base_dir = Path::new(&cli.config_path)
                .parent()
                .unwrap_or_else(|| Path::new("."));
            let abilities = config.abilities(base_dir)?;
            info!("Abilities: {} loaded", abilities.len());
            let runner = AbilityRunner::new(engine.clone(), Arc::new(InMemoryAbilityStore::new(abilities)))
                .with_timeout(invocation.timeout);
            let identity = invocation
                .identity()
                .unwrap_or_else(|| Identity::new(""));
            runner
                .execute_ability(&id, invocation.params.clone(), &identity)
                .await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_run() {
        let cli = parse_args(&args(&[
            "run", "hello.lua", "--user", "alice", "--role", "admin", "--params", r#"{"x": 41}"#,
            "--timeout-ms", "250",
        ]))
        .unwrap();
        assert_eq!(cli.config_path, DEFAULT_CONFIG_PATH);
        match cli.command {
            Command::Run { script, invocation } => {
                assert_eq!(script, PathBuf::from("hello.lua"));
                assert_eq!(invocation.params, json!({"x": 41}));
                assert_eq!(invocation.timeout, Duration::from_millis(250));
                let identity = invocation.identity().unwrap();
                assert_eq!(identity.id, "alice");
                assert!(identity.has_role("admin"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_ability_with_config() {
        let cli = parse_args(&args(&["-c", "/etc/junai.toml", "ability", "digest"])).unwrap();
        assert_eq!(cli.config_path, "/etc/junai.toml");
        match cli.command {
            Command::Ability { id, invocation } => {
                assert_eq!(id, "digest");
                assert!(invocation.identity().is_none());
                assert_eq!(invocation.params, Value::Null);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_capabilities() {
        let cli = parse_args(&args(&["capabilities"])).unwrap();
        assert_eq!(cli.command, Command::Capabilities);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_args(&args(&[])).is_err());
        assert!(parse_args(&args(&["run"])).is_err());
        assert!(parse_args(&args(&["run", "x.lua", "--user"])).is_err());
        assert!(parse_args(&args(&["run", "x.lua", "--params", "{nope"])).is_err());
        assert!(parse_args(&args(&["run", "x.lua", "--timeout-ms", "soon"])).is_err());
        assert!(parse_args(&args(&["launch"])).is_err());
        assert!(parse_args(&args(&["run", "x.lua", "--bogus"])).is_err());
        assert!(parse_args(&args(&["capabilities", "extra"])).is_err());
    }
}
