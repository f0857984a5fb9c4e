use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use tracing::debug;
use upkeep_engine::{
    Capabilities, CommandProbe, Ed25519Signature, EngineConfig, FileLock, NoLock,
    ProcessedArtifacts, StateLayout, Timeouts, VersionGate, WatchOptions, DEFAULT_LOCK_ID,
    DEFAULT_TIMEOUT, DEFAULT_WATCH_INTERVAL,
};

use crate::approval::PromptApprover;

pub(crate) const CONFIG_FILE_NAME: &str = "upkeep.toml";

/// Contents of `upkeep.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct UpkeepConfig {
    #[serde(default)]
    pub watch_dir: Option<PathBuf>,
    #[serde(default = "default_extension")]
    pub extension: String,
    #[serde(default)]
    pub install_dir: Option<PathBuf>,
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
    #[serde(default = "default_lock_id")]
    pub lock_id: String,
    #[serde(default)]
    pub lock: LockKind,
    #[serde(default)]
    pub approval: ApprovalMode,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub signature: Option<SignatureConfig>,
    #[serde(default)]
    pub manifest: ManifestConfig,
    #[serde(default)]
    pub health: Option<HealthConfig>,
    #[serde(default)]
    pub watch: WatchConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum LockKind {
    #[default]
    File,
    None,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ApprovalMode {
    #[default]
    Auto,
    Prompt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct TimeoutConfig {
    #[serde(default = "default_timeout_secs")]
    pub approval_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub signature_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub manifest_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub lock_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub health_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub hook_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SignatureConfig {
    pub public_key_hex: String,
    #[serde(default)]
    pub signatures_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ManifestConfig {
    #[serde(default)]
    pub expected_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct HealthConfig {
    pub command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct WatchConfig {
    #[serde(default = "default_watch_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub auto_cleanup: bool,
    #[serde(default)]
    pub move_processed_dir: Option<PathBuf>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_watch_interval_secs(),
            auto_cleanup: false,
            move_processed_dir: None,
        }
    }
}

/// `upkeep watch` flags; each one set wins over `[watch]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct WatchFlags {
    pub interval_secs: Option<u64>,
    pub cycles: Option<u64>,
    pub cleanup: bool,
    pub move_to: Option<PathBuf>,
}

/// Directory values given on the command line; they win over the file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ConfigOverrides {
    pub watch_dir: Option<PathBuf>,
    pub install_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
}

fn default_extension() -> String {
    "zip".to_string()
}

fn default_lock_id() -> String {
    DEFAULT_LOCK_ID.to_string()
}

fn default_watch_interval_secs() -> u64 {
    DEFAULT_WATCH_INTERVAL.as_secs()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT.as_secs()
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        let secs = default_timeout_secs();
        Self {
            approval_secs: secs,
            signature_secs: secs,
            manifest_secs: secs,
            lock_secs: secs,
            health_secs: secs,
            hook_secs: secs,
        }
    }
}

impl TimeoutConfig {
    pub fn to_timeouts(self) -> Timeouts {
        Timeouts {
            approval: Duration::from_secs(self.approval_secs),
            signature: Duration::from_secs(self.signature_secs),
            manifest: Duration::from_secs(self.manifest_secs),
            lock: Duration::from_secs(self.lock_secs),
            health: Duration::from_secs(self.health_secs),
            hook: Duration::from_secs(self.hook_secs),
        }
    }
}

impl Default for UpkeepConfig {
    fn default() -> Self {
        Self {
            watch_dir: None,
            extension: default_extension(),
            install_dir: None,
            state_dir: None,
            ignore_patterns: Vec::new(),
            lock_id: default_lock_id(),
            lock: LockKind::default(),
            approval: ApprovalMode::default(),
            timeouts: TimeoutConfig::default(),
            signature: None,
            manifest: ManifestConfig::default(),
            health: None,
            watch: WatchConfig::default(),
        }
    }
}

impl UpkeepConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input).context("failed to parse upkeep config")
    }

    /// Loads `explicit` when given (it must exist), otherwise the default
    /// config file when present, otherwise built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => default_config_path()?,
        };
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound && explicit.is_none() => {
                debug!(path = %path.display(), "no config file; using defaults");
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read config {}", path.display()));
            }
        };
        let config = Self::from_toml_str(&raw)
            .with_context(|| format!("invalid config {}", path.display()))?;
        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(dir) = &overrides.watch_dir {
            self.watch_dir = Some(dir.clone());
        }
        if let Some(dir) = &overrides.install_dir {
            self.install_dir = Some(dir.clone());
        }
        if let Some(dir) = &overrides.state_dir {
            self.state_dir = Some(dir.clone());
        }
    }

    pub fn engine_config(&self) -> Result<EngineConfig> {
        let watch_dir = self
            .watch_dir
            .clone()
            .ok_or_else(|| anyhow!("watch_dir is not configured"))?;
        let install_dir = self
            .install_dir
            .clone()
            .ok_or_else(|| anyhow!("install_dir is not configured"))?;
        let state_dir = match &self.state_dir {
            Some(dir) => dir.clone(),
            None => default_upkeep_home()?.join("state"),
        };

        let mut config = EngineConfig::new(watch_dir, install_dir, state_dir);
        config.extension = self.extension.clone();
        config.ignore_patterns = self.ignore_patterns.clone();
        config.lock_id = self.lock_id.clone();
        config.timeouts = self.timeouts.to_timeouts();
        Ok(config)
    }

    pub fn watch_options(&self, flags: &WatchFlags) -> Result<WatchOptions> {
        let interval_secs = flags.interval_secs.unwrap_or(self.watch.interval_secs);
        if interval_secs == 0 {
            return Err(anyhow!("watch interval must be at least one second"));
        }
        let processed = if flags.cleanup {
            ProcessedArtifacts::Delete
        } else if let Some(dir) = &flags.move_to {
            ProcessedArtifacts::MoveTo(dir.clone())
        } else {
            match (self.watch.auto_cleanup, &self.watch.move_processed_dir) {
                (true, Some(_)) => {
                    return Err(anyhow!(
                        "[watch] auto_cleanup and move_processed_dir cannot both be set"
                    ));
                }
                (true, None) => ProcessedArtifacts::Delete,
                (false, Some(dir)) => ProcessedArtifacts::MoveTo(dir.clone()),
                (false, None) => ProcessedArtifacts::Keep,
            }
        };
        Ok(WatchOptions {
            interval: Duration::from_secs(interval_secs),
            processed,
            max_cycles: flags.cycles,
        })
    }

    /// Wires the configured gates, lock and probe for `engine`.
    pub fn capabilities(&self, engine: &EngineConfig) -> Result<Capabilities> {
        let mut capabilities = Capabilities::default();

        capabilities = match self.lock {
            LockKind::File => {
                let locks_dir = StateLayout::new(&engine.state_dir).locks_dir();
                capabilities.with_locker(FileLock::new(locks_dir))
            }
            LockKind::None => capabilities.with_locker(NoLock),
        };
        if self.approval == ApprovalMode::Prompt {
            capabilities = capabilities.with_approver(PromptApprover);
        }
        if let Some(signature) = &self.signature {
            capabilities = capabilities.with_signature(Ed25519Signature::new(
                signature.public_key_hex.clone(),
                signature.signatures_dir.clone(),
            ));
        }
        let gate =
            VersionGate::from_install_dir(&engine.install_dir, self.manifest.expected_name.clone())?;
        capabilities = capabilities.with_manifest(gate);
        if let Some(health) = &self.health {
            capabilities = capabilities.with_health(
                CommandProbe::from_argv(&health.command).context("invalid [health] command")?,
            );
        }
        Ok(capabilities)
    }
}

pub(crate) fn default_upkeep_home() -> Result<PathBuf> {
    if cfg!(windows) {
        let app_data = std::env::var("LOCALAPPDATA")
            .context("LOCALAPPDATA is not set; cannot resolve upkeep home")?;
        return Ok(PathBuf::from(app_data).join("Upkeep"));
    }

    let home = std::env::var("HOME").context("HOME is not set; cannot resolve upkeep home")?;
    Ok(PathBuf::from(home).join(".upkeep"))
}

pub(crate) fn default_config_path() -> Result<PathBuf> {
    Ok(default_upkeep_home()?.join(CONFIG_FILE_NAME))
}
