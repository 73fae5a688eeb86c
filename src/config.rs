use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::db::ConnectionConfig;
use crate::rules::CheckDefinition;
use crate::scheduler::Intervals;

pub const STORE_PASSWORD_ENV: &str = "PLANWATCH_STORE_PASSWORD";
pub const CAPTURE_PASSWORD_ENV: &str = "PLANWATCH_CAPTURE_PASSWORD";
pub const PG_PASSWORD_ENV: &str = "PGPASSWORD";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub store: ConnectionConfig,
    #[serde(default)]
    pub capture: Option<CaptureConfig>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub checks: Vec<CheckDefinition>,
}

/// Where plans come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CaptureConfig {
    Postgres(ConnectionConfig),
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub idle_interval_secs: u64,
    pub drain_interval_ms: u64,
    pub explain_batch_size: usize,
    pub check_batch_size: usize,
    pub index_batch_size: usize,
    /// Move stale statements straight back to pending-explain.
    pub explain_stale_now: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_interval_secs: 60,
            drain_interval_ms: 100,
            explain_batch_size: 100,
            check_batch_size: 100,
            index_batch_size: 30,
            explain_stale_now: false,
        }
    }
}

impl SchedulerConfig {
    pub fn intervals(&self) -> Intervals {
        Intervals {
            idle: Duration::from_secs(self.idle_interval_secs),
            drain: Duration::from_millis(self.drain_interval_ms),
        }
    }
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("planwatch")
        .join("config.toml")
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.store.validate("store")?;
        match &self.capture {
            Some(CaptureConfig::Postgres(target)) => target.validate("capture")?,
            Some(CaptureConfig::Command { program, .. }) if program.trim().is_empty() => {
                bail!("[capture] program must not be empty");
            }
            _ => {}
        }

        let scheduler = &self.scheduler;
        if scheduler.explain_batch_size == 0
            || scheduler.check_batch_size == 0
            || scheduler.index_batch_size == 0
        {
            bail!("[scheduler] batch sizes must be at least 1");
        }
        if scheduler.idle_interval_secs == 0 {
            bail!("[scheduler] idle_interval_secs must be at least 1");
        }

        for check in &self.checks {
            check.to_check()?;
        }
        Ok(())
    }

    /// The capture settings, required by subcommands that explain statements.
    pub fn require_capture(&self) -> Result<&CaptureConfig> {
        self.capture
            .as_ref()
            .context("No [capture] section configured")
    }

    /// Fill in missing passwords from the environment, then from a prompt when
    /// `interactive` is set.
    pub fn resolve_passwords(
        &mut self,
        env: impl Fn(&str) -> Option<String>,
        interactive: bool,
    ) -> Result<()> {
        resolve_password(&mut self.store, STORE_PASSWORD_ENV, &env, interactive)?;
        if let Some(CaptureConfig::Postgres(target)) = &mut self.capture {
            resolve_password(target, CAPTURE_PASSWORD_ENV, &env, interactive)?;
        }
        Ok(())
    }
}

fn resolve_password(
    config: &mut ConnectionConfig,
    variable: &str,
    env: &impl Fn(&str) -> Option<String>,
    interactive: bool,
) -> Result<()> {
    if !config.password.is_empty() {
        return Ok(());
    }
    if let Some(password) = env(variable).or_else(|| env(PG_PASSWORD_ENV)) {
        config.password = password;
    } else if interactive {
        let prompt = format!("Password for {}: ", config.display_string());
        config.password = rpassword::read_password_from_tty(Some(&prompt))?;
    }
    Ok(())
}
