use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::ability::{Ability, AbilityTrigger};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub capabilities: CapabilitiesConfig,
    #[serde(default)]
    pub abilities: Vec<AbilityConfig>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SandboxConfig {
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
    /// 0 disables the limit
    #[serde(default = "default_memory_limit")]
    pub memory_limit_bytes: usize,
    #[serde(default = "default_check_interval")]
    pub instruction_check_interval: u32,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            max_timeout_ms: default_max_timeout_ms(),
            memory_limit_bytes: default_memory_limit(),
            instruction_check_interval: default_check_interval(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_max_timeout_ms() -> u64 {
    60_000
}

fn default_memory_limit() -> usize {
    16 * 1024 * 1024
}

fn default_check_interval() -> u32 {
    1_000
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct StoreConfig {
    /// Supports ${ENV_VAR} substitution
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./data/store")
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct CapabilitiesConfig {
    /// Capability name → role required to call it
    #[serde(default)]
    pub roles: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct AbilityConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub owner_id: Option<String>,
    /// Inline source; exclusive with `script_path`
    #[serde(default)]
    pub script: Option<String>,
    /// Relative paths resolve against the config file's directory
    #[serde(default)]
    pub script_path: Option<PathBuf>,
    #[serde(default)]
    pub trigger: AbilityTrigger,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default = "default_enabled")]
    pub is_enabled: bool,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_enabled() -> bool {
    true
}

fn default_version() -> String {
    "1.0".to_string()
}

impl AbilityConfig {
    /// Builds the ability, reading `script_path` relative to `base_dir`.
    pub fn to_ability(&self, base_dir: &Path) -> anyhow::Result<Ability> {
        let script = match (&self.script, &self.script_path) {
            (Some(script), None) => script.clone(),
            (None, Some(path)) => {
                let path = base_dir.join(path);
                std::fs::read_to_string(&path).with_context(|| {
                    format!("ability {}: cannot read {}", self.id, path.display())
                })?
            }
            (Some(_), Some(_)) => {
                anyhow::bail!("ability {}: set either script or script_path, not both", self.id)
            }
            (None, None) => anyhow::bail!("ability {}: missing script or script_path", self.id),
        };
        Ok(Ability {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            script,
            trigger: self.trigger.clone(),
            owner_id: self.owner_id.clone(),
            is_public: self.is_public,
            is_enabled: self.is_enabled,
            version: self.version.clone(),
            last_used: None,
        })
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &str) -> anyhow::Result<Self> {
        if !Path::new(path).exists() {
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        // Expand environment variables like ${JUNAI_DATA_DIR}
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.sandbox.default_timeout_ms == 0 {
            anyhow::bail!("sandbox.default_timeout_ms must be greater than 0");
        }
        if self.sandbox.max_timeout_ms < self.sandbox.default_timeout_ms {
            anyhow::bail!("sandbox.max_timeout_ms must not be below default_timeout_ms");
        }
        let mut seen = std::collections::HashSet::new();
        for ability in &self.abilities {
            if !seen.insert(ability.id.as_str()) {
                anyhow::bail!("duplicate ability id: {}", ability.id);
            }
        }
        Ok(())
    }

    /// Materializes all configured abilities.
    pub fn abilities(&self, base_dir: &Path) -> anyhow::Result<Vec<Ability>> {
        self.abilities
            .iter()
            .map(|a| a.to_ability(base_dir))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── parse tests ─────────────────────────────────────

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.sandbox, SandboxConfig::default());
        assert_eq!(config.sandbox.default_timeout_ms, 5_000);
        assert_eq!(config.sandbox.max_timeout_ms, 60_000);
        assert_eq!(config.sandbox.memory_limit_bytes, 16 * 1024 * 1024);
        assert_eq!(config.store.path, PathBuf::from("./data/store"));
        assert!(config.capabilities.roles.is_empty());
        assert!(config.abilities.is_empty());
    }

    #[test]
    fn test_full_config() {
        let config = Config::parse(
            r#"
            [sandbox]
            default_timeout_ms = 1000
            max_timeout_ms = 2000
            memory_limit_bytes = 0
            instruction_check_interval = 500

            [store]
            path = "/tmp/junai"

            [capabilities.roles]
            "rune.invoke" = "admin"

            [[abilities]]
            id = "digest"
            name = "Daily digest"
            owner_id = "alice"
            script = "return 1"
            trigger = { type = "schedule", cron = "0 8 * * *" }
            "#,
        )
        .unwrap();
        assert_eq!(config.sandbox.default_timeout_ms, 1000);
        assert_eq!(config.sandbox.memory_limit_bytes, 0);
        assert_eq!(config.sandbox.instruction_check_interval, 500);
        assert_eq!(config.store.path, PathBuf::from("/tmp/junai"));
        assert_eq!(
            config.capabilities.roles.get("rune.invoke").map(String::as_str),
            Some("admin")
        );
        assert_eq!(config.abilities.len(), 1);
        assert_eq!(
            config.abilities[0].trigger,
            AbilityTrigger::Schedule {
                cron: "0 8 * * *".into()
            }
        );
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("JUNAI_TEST_STORE_DIR", "/var/lib/junai-test");
        let config = Config::parse(
            r#"
            [store]
            path = "${JUNAI_TEST_STORE_DIR}/store"
            "#,
        )
        .unwrap();
        assert_eq!(config.store.path, PathBuf::from("/var/lib/junai-test/store"));
    }

    #[test]
    fn test_rejects_max_below_default() {
        let err = Config::parse(
            r#"
            [sandbox]
            default_timeout_ms = 5000
            max_timeout_ms = 100
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_timeout_ms"));
    }

    #[test]
    fn test_rejects_duplicate_ability_ids() {
        let err = Config::parse(
            r#"
            [[abilities]]
            id = "a"
            name = "A"
            script = "return 1"

            [[abilities]]
            id = "a"
            name = "A again"
            script = "return 2"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate ability id"));
    }

    // ── load tests ──────────────────────────────────────

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.toml");
        let config = Config::load_or_default(path.to_str().unwrap()).unwrap();
        assert!(config.abilities.is_empty());
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandbox.toml");
        std::fs::write(&path, "[sandbox]\ndefault_timeout_ms = 42\n").unwrap();
        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.sandbox.default_timeout_ms, 42);
    }

    #[test]
    fn test_example_config_parses() {
        if std::env::var_os("HOME").is_none() {
            std::env::set_var("HOME", "/tmp");
        }
        let config = Config::parse(include_str!("../config/sandbox.example.toml")).unwrap();
        let config_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("config");
        let abilities = config.abilities(&config_dir).unwrap();
        assert_eq!(abilities.len(), 2);
        assert!(abilities[0].script.contains("task.create"));
        assert!(abilities[1].is_public);
    }

    // ── ability tests ───────────────────────────────────

    #[test]
    fn test_ability_from_script_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("abilities")).unwrap();
        std::fs::write(dir.path().join("abilities/digest.lua"), "return 'digest'").unwrap();
        let config = Config::parse(
            r#"
            [[abilities]]
            id = "digest"
            name = "Digest"
            script_path = "abilities/digest.lua"
            is_public = true
            "#,
        )
        .unwrap();
        let abilities = config.abilities(dir.path()).unwrap();
        assert_eq!(abilities[0].script, "return 'digest'");
        assert!(abilities[0].is_public);
        assert!(abilities[0].is_enabled);
        assert_eq!(abilities[0].trigger, AbilityTrigger::Manual);
    }

    #[test]
    fn test_ability_needs_exactly_one_script_source() {
        let neither = AbilityConfig {
            id: "x".into(),
            name: "X".into(),
            description: None,
            owner_id: None,
            script: None,
            script_path: None,
            trigger: AbilityTrigger::Manual,
            is_public: false,
            is_enabled: true,
            version: "1.0".into(),
        };
        assert!(neither.to_ability(Path::new(".")).is_err());

        let both = AbilityConfig {
            script: Some("return 1".into()),
            script_path: Some(PathBuf::from("x.lua")),
            ..neither
        };
        assert!(both.to_ability(Path::new(".")).is_err());
    }
}
