//! Worker configuration stored in `taskd.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::atomic::write_atomic;

pub const DEFAULT_CONFIG_PATH: &str = "taskd.toml";

/// Worker configuration (TOML).
///
/// Edited by operators; missing fields fall back to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Directory holding one `user_<id>` directory per user.
    pub users_root: PathBuf,

    /// Worker-owned data: notification outbox and `current_task.json`.
    pub data_dir: PathBuf,

    /// Instruction files shared by every user. Missing directory means none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub core_instructions_dir: Option<PathBuf>,

    /// Sleep between scheduler ticks.
    pub tick_interval_secs: u64,

    /// Upper bound on rendered prompt size; low-priority context is dropped first.
    pub prompt_budget_bytes: usize,

    /// Backoff after a failed planning call. 0 retries on the next tick.
    pub planning_retry_secs: u64,

    /// Backoff after an empty finalization reply.
    pub finalize_retry_secs: u64,

    /// Empty finalization replies tolerated before an answer is synthesized.
    pub max_finalize_attempts: u32,

    pub engine: EngineConfig,

    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-variant wall-clock limit in seconds.
    pub timeout_secs: u64,

    /// Truncate engine stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Wait used when a quota error carries no parseable retry hint.
    pub quota_fallback_wait_secs: u64,

    /// Ordered fallback list; the first variant is preferred.
    pub variants: Vec<EngineVariant>,
}

/// One engine invocation shape (binary plus arguments). The prompt goes to stdin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineVariant {
    pub name: String,
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    pub enabled: bool,

    /// External publisher command; `user_id` and the description are appended.
    /// Empty means commit the user directory with git.
    pub command: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            users_root: PathBuf::from("users"),
            data_dir: PathBuf::from("data"),
            core_instructions_dir: None,
            tick_interval_secs: 2,
            prompt_budget_bytes: 200_000,
            planning_retry_secs: 0,
            finalize_retry_secs: 60,
            max_finalize_attempts: 3,
            engine: EngineConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            output_limit_bytes: 1_000_000,
            quota_fallback_wait_secs: 600,
            variants: vec![
                EngineVariant {
                    name: "pro".to_string(),
                    command: vec!["gemini".to_string(), "-y".to_string()],
                },
                EngineVariant {
                    name: "flash".to_string(),
                    command: vec![
                        "gemini".to_string(),
                        "-y".to_string(),
                        "-m".to_string(),
                        "gemini-2.5-flash".to_string(),
                    ],
                },
            ],
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn quota_fallback_wait(&self) -> Duration {
        Duration::from_secs(self.quota_fallback_wait_secs)
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.users_root.as_os_str().is_empty() {
            return Err(anyhow!("users_root must be set"));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(anyhow!("data_dir must be set"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        if self.max_finalize_attempts == 0 {
            return Err(anyhow!("max_finalize_attempts must be > 0"));
        }
        if self.engine.timeout_secs == 0 {
            return Err(anyhow!("engine.timeout_secs must be > 0"));
        }
        if self.engine.output_limit_bytes == 0 {
            return Err(anyhow!("engine.output_limit_bytes must be > 0"));
        }
        if self.engine.quota_fallback_wait_secs == 0 {
            return Err(anyhow!("engine.quota_fallback_wait_secs must be > 0"));
        }
        if self.engine.variants.is_empty() {
            return Err(anyhow!("engine.variants must list at least one variant"));
        }
        for variant in &self.engine.variants {
            if variant.command.is_empty() || variant.command[0].trim().is_empty() {
                return Err(anyhow!(
                    "engine variant '{}' must have a non-empty command",
                    variant.name
                ));
            }
        }
        if !self.sync.command.is_empty() && self.sync.command[0].trim().is_empty() {
            return Err(anyhow!("sync.command must start with a program"));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn outbox_dir(&self) -> PathBuf {
        self.data_dir.join("outbox")
    }

    pub fn current_task_path(&self) -> PathBuf {
        self.data_dir.join("current_task.json")
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `WorkerConfig::default()`.
pub fn load_config(path: &Path) -> Result<WorkerConfig> {
    if !path.exists() {
        let cfg = WorkerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: WorkerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk.
pub fn write_config(path: &Path, cfg: &WorkerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}
