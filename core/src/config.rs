//! Configuration loaded from the profile directory and merged with
//! programmatic overrides.
//!
//! `ConfigToml` mirrors `config.toml` on disk with every field optional;
//! [`Config`] is the fully-resolved form the rest of the core consumes.
//! Named profiles overlay the base table, then `ConfigOverrides` (supplied
//! by the embedding app) wins over both.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use webpilot_protocol::Mode;

use crate::error::CoreErr;
use crate::error::Result;
use crate::policy::UserOverrides;

const CONFIG_TOML_FILE: &str = "config.toml";

/// Resolve the base data directory: `$WEBPILOT_HOME` or `~/.webpilot`.
pub fn webpilot_home() -> std::io::Result<PathBuf> {
    if let Some(home) = std::env::var_os("WEBPILOT_HOME") {
        if !home.is_empty() {
            return Ok(PathBuf::from(home));
        }
    }
    let mut dir = dirs::home_dir().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "could not find home directory")
    })?;
    dir.push(".webpilot");
    Ok(dir)
}

/// Fully-resolved configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Initial autonomy for new runs.
    pub mode: Mode,
    /// Capability token expiry.
    pub token_ttl: Duration,
    /// Per-step retry bound on idempotent, retryable tool errors.
    pub step_max_retries: u32,
    pub planner_deadline: Duration,
    pub tool_deadline: Duration,
    pub observe_deadline: Duration,
    /// Context pack upper bound, approximate tokens.
    pub context_budget_tokens: u32,
    /// Write a checkpoint every N events.
    pub checkpoint_every_events: u64,
    /// Allow egress to a cloud planner (packs are re-screened first).
    pub cloud_enabled: bool,
    /// Decision-matrix version pin. `None` accepts the built-in matrix.
    pub policy_matrix_version: Option<String>,
    /// Hard ceiling on tool steps per run.
    pub max_steps_per_run: u32,
    /// Curated wildcard patterns for origins treated as sensitive.
    pub curated_sensitive_origins: Vec<String>,
    /// Durable per-site labels and field overrides.
    pub overrides: UserOverrides,
    pub profile_id: String,
    /// Directory holding this profile's database.
    pub profile_dir: PathBuf,
}

/// Overrides supplied programmatically by the embedding app. Every field
/// beats both the base table and the selected profile.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub mode: Option<Mode>,
    pub profile: Option<String>,
    pub profile_dir: Option<PathBuf>,
    pub cloud_enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TokenToml {
    ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct StepToml {
    max_retries: Option<u32>,
    max_steps_per_run: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct DeadlineToml {
    deadline_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ContextToml {
    budget_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CompactionToml {
    checkpoint_every_events: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CloudToml {
    enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PolicyToml {
    matrix_version: Option<String>,
    #[serde(default)]
    curated_sensitive_origins: Vec<String>,
}

/// One named profile: the subset of the base table a profile may override.
#[derive(Debug, Clone, Default, Deserialize)]
struct ProfileToml {
    mode: Option<Mode>,
    #[serde(default)]
    token: TokenToml,
    #[serde(default)]
    step: StepToml,
    #[serde(default)]
    cloud: CloudToml,
}

/// On-disk shape of `config.toml`. All fields optional.
#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigToml {
    mode: Option<Mode>,
    #[serde(default)]
    token: TokenToml,
    #[serde(default)]
    step: StepToml,
    #[serde(default)]
    planner: DeadlineToml,
    #[serde(default)]
    tool: DeadlineToml,
    #[serde(default)]
    observe: DeadlineToml,
    #[serde(default)]
    context: ContextToml,
    #[serde(default)]
    compaction: CompactionToml,
    #[serde(default)]
    cloud: CloudToml,
    #[serde(default)]
    policy: PolicyToml,
    #[serde(default)]
    overrides: UserOverrides,
    #[serde(default)]
    profiles: HashMap<String, ProfileToml>,
}

impl Config {
    /// Load `config.toml` from `home` (missing file means all defaults) and
    /// resolve it against `overrides`.
    pub fn load(home: &Path, overrides: ConfigOverrides) -> Result<Config> {
        let path = home.join(CONFIG_TOML_FILE);
        let toml: ConfigToml = match std::fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents)
                .map_err(|e| CoreErr::SchemaViolation(format!("config.toml: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ConfigToml::default(),
            Err(e) => return Err(e.into()),
        };
        Self::resolve(home, toml, overrides)
    }

    fn resolve(home: &Path, toml: ConfigToml, overrides: ConfigOverrides) -> Result<Config> {
        let profile_id = overrides.profile.unwrap_or_else(|| "default".to_string());
        let profile = toml.profiles.get(&profile_id).cloned().unwrap_or_default();

        let mode = overrides
            .mode
            .or(profile.mode)
            .or(toml.mode)
            .unwrap_or(Mode::ReadOnly);
        let token_ttl_ms = profile
            .token
            .ttl_ms
            .or(toml.token.ttl_ms)
            .unwrap_or(30_000);
        let step_max_retries = profile
            .step
            .max_retries
            .or(toml.step.max_retries)
            .unwrap_or(2);
        let max_steps_per_run = profile
            .step
            .max_steps_per_run
            .or(toml.step.max_steps_per_run)
            .unwrap_or(40);
        let cloud_enabled = overrides
            .cloud_enabled
            .or(profile.cloud.enabled)
            .or(toml.cloud.enabled)
            .unwrap_or(false);

        let profile_dir = overrides
            .profile_dir
            .unwrap_or_else(|| home.join("profiles").join(&profile_id));

        Ok(Config {
            mode,
            token_ttl: Duration::from_millis(token_ttl_ms),
            step_max_retries,
            planner_deadline: Duration::from_millis(toml.planner.deadline_ms.unwrap_or(20_000)),
            tool_deadline: Duration::from_millis(toml.tool.deadline_ms.unwrap_or(8_000)),
            observe_deadline: Duration::from_millis(toml.observe.deadline_ms.unwrap_or(5_000)),
            context_budget_tokens: toml.context.budget_tokens.unwrap_or(8_000),
            checkpoint_every_events: toml.compaction.checkpoint_every_events.unwrap_or(40),
            cloud_enabled,
            policy_matrix_version: toml.policy.matrix_version,
            max_steps_per_run,
            curated_sensitive_origins: toml.policy.curated_sensitive_origins,
            overrides: toml.overrides,
            profile_id,
            profile_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn defaults_apply_without_a_config_file() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(dir.path(), ConfigOverrides::default()).unwrap();
        assert_eq!(config.mode, Mode::ReadOnly);
        assert_eq!(config.token_ttl, Duration::from_millis(30_000));
        assert_eq!(config.step_max_retries, 2);
        assert!(!config.cloud_enabled);
        assert_eq!(config.profile_id, "default");
    }

    #[test]
    fn file_profile_and_overrides_stack_in_order() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_TOML_FILE),
            r#"
mode = "assist"

[token]
ttl_ms = 10000

[context]
budget_tokens = 2000

[profiles.work]
mode = "autopilot"

[profiles.work.token]
ttl_ms = 5000
"#,
        )
        .unwrap();

        let base = Config::load(dir.path(), ConfigOverrides::default()).unwrap();
        assert_eq!(base.mode, Mode::Assist);
        assert_eq!(base.token_ttl, Duration::from_millis(10_000));
        assert_eq!(base.context_budget_tokens, 2_000);

        let work = Config::load(
            dir.path(),
            ConfigOverrides {
                profile: Some("work".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(work.mode, Mode::Autopilot);
        assert_eq!(work.token_ttl, Duration::from_millis(5_000));

        let forced = Config::load(
            dir.path(),
            ConfigOverrides {
                profile: Some("work".to_string()),
                mode: Some(Mode::ReadOnly),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(forced.mode, Mode::ReadOnly);
    }

    #[test]
    fn malformed_config_is_a_loud_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_TOML_FILE), "mode = 17").unwrap();
        assert!(Config::load(dir.path(), ConfigOverrides::default()).is_err());
    }
}
