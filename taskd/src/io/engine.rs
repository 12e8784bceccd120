//! Reasoning engine client.
//!
//! The [`Engine`] trait is the only way the worker talks to the engine. The
//! production [`FallbackEngine`] walks an ordered list of CLI variants; tests use
//! scripted engines that return predetermined outcomes without spawning processes.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::reply::{classify_variant, fold_verdicts};
use crate::core::types::{EngineOutcome, RawReply, VariantVerdict};
use crate::io::config::{EngineConfig, EngineVariant};
use crate::io::process::run_command_with_timeout;

/// Per-user execution environment. The engine runs with `HOME` set to `home`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserEnv {
    pub user_id: String,
    pub home: PathBuf,
}

/// Parameters for an engine invocation.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub prompt: String,
    pub env: UserEnv,
    /// Wall-clock limit for each variant attempt.
    pub timeout: Duration,
}

/// Abstraction over reasoning engine backends.
pub trait Engine {
    /// Never fails: every failure mode is folded into the outcome.
    fn invoke(&self, request: &EngineRequest) -> EngineOutcome;
}

/// Runs one variant and captures its raw output.
pub trait VariantRunner {
    fn run(&self, variant: &EngineVariant, request: &EngineRequest) -> Result<RawReply>;
}

/// Runs a variant as a child process: prompt on stdin, `HOME` and working
/// directory set to the user's directory.
#[derive(Debug, Clone)]
pub struct CliRunner {
    pub output_limit_bytes: usize,
}

impl VariantRunner for CliRunner {
    #[instrument(skip_all, fields(variant = %variant.name, user = %request.env.user_id))]
    fn run(&self, variant: &EngineVariant, request: &EngineRequest) -> Result<RawReply> {
        let (program, args) = variant
            .command
            .split_first()
            .ok_or_else(|| anyhow!("variant '{}' has an empty command", variant.name))?;
        let mut cmd = Command::new(program);
        cmd.args(args).env("HOME", &request.env.home);
        if request.env.home.is_dir() {
            cmd.current_dir(&request.env.home);
        }

        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.clone().into_bytes()),
            request.timeout,
            self.output_limit_bytes,
        )
        .with_context(|| format!("run engine variant {}", variant.name))?;

        debug!(exit_code = ?output.status.code(), timed_out = output.timed_out, "engine variant finished");
        Ok(RawReply {
            stdout: output.stdout_text(),
            stderr: output.stderr_text(),
            timed_out: output.timed_out,
        })
    }
}

/// Tries variants in order until one succeeds.
pub struct FallbackEngine<R> {
    variants: Vec<EngineVariant>,
    runner: R,
    quota_fallback_wait: Duration,
}

impl<R: VariantRunner> FallbackEngine<R> {
    pub fn new(variants: Vec<EngineVariant>, runner: R, quota_fallback_wait: Duration) -> Self {
        Self {
            variants,
            runner,
            quota_fallback_wait,
        }
    }
}

impl FallbackEngine<CliRunner> {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self::new(
            cfg.variants.clone(),
            CliRunner {
                output_limit_bytes: cfg.output_limit_bytes,
            },
            cfg.quota_fallback_wait(),
        )
    }
}

impl<R: VariantRunner> Engine for FallbackEngine<R> {
    #[instrument(skip_all, fields(user = %request.env.user_id, prompt_bytes = request.prompt.len()))]
    fn invoke(&self, request: &EngineRequest) -> EngineOutcome {
        let mut verdicts = Vec::with_capacity(self.variants.len());
        for variant in &self.variants {
            let verdict = match self.runner.run(variant, request) {
                Ok(raw) => classify_variant(&raw, self.quota_fallback_wait),
                Err(err) => {
                    warn!(variant = %variant.name, err = %format!("{err:#}"), "engine variant failed to launch");
                    VariantVerdict::Empty
                }
            };
            match &verdict {
                VariantVerdict::Success(text) => {
                    info!(variant = %variant.name, reply_bytes = text.len(), "engine replied");
                }
                VariantVerdict::QuotaExhausted(wait) => {
                    warn!(variant = %variant.name, wait_secs = wait.as_secs(), "engine quota exhausted");
                }
                VariantVerdict::Timeout => {
                    warn!(variant = %variant.name, timeout_secs = request.timeout.as_secs(), "engine timed out");
                }
                VariantVerdict::Empty => {
                    warn!(variant = %variant.name, "engine returned no output");
                }
            }
            let done = matches!(verdict, VariantVerdict::Success(_));
            verdicts.push(verdict);
            if done {
                break;
            }
        }
        fold_verdicts(&verdicts)
    }
}
