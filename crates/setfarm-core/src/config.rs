//! Engine configuration.
//!
//! Matches the `KEY=value` format of the `config` file in the state dir.
//! Precedence: explicit `--config` file > `<state_dir>/config` > defaults.
//! The state directory itself defaults to a user-scoped data dir and is
//! overridden by the `SETFARM_STATE_DIR` environment variable.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable overriding the state directory.
pub const STATE_DIR_ENV: &str = "SETFARM_STATE_DIR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Engine and medic configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of persistent state: database, workflows dir, run archive.
    pub state_dir: PathBuf,

    // Cron gateway
    /// External scheduler CLI the command gateway shells out to.
    pub cron_bin: PathBuf,
    /// Default wake cadence for agent jobs.
    pub cron_interval_ms: u64,
    /// Anchor stagger between parallel shards of one role.
    pub cron_stagger_ms: u64,
    /// Hard timeout for any single gateway call.
    pub cron_timeout_sec: u64,

    // Step and story retry accounting
    pub retry_budget: u32,

    // Role liveness
    /// Default per-role execution timeout.
    pub role_timeout_sec: u64,
    /// Per-role overrides, keyed by role id.
    pub role_timeouts: BTreeMap<String, u64>,

    // Medic thresholds
    /// Grace added on top of the role timeout before a running step is stuck.
    pub stuck_grace_sec: u64,
    /// Faster reset path for claimed-but-dead steps.
    pub claimed_stuck_after_sec: u64,
    /// Running story age before it counts as orphaned.
    pub orphan_story_after_sec: u64,
    /// Silence window (no claims, pending stories) before crons count as stalled.
    pub stalled_claim_after_sec: u64,
    /// Cooldown between cron delete+recreate remediations per workflow.
    pub cron_recreate_cooldown_sec: u64,
    /// Cooldown between medic resumes of one run.
    pub resume_cooldown_sec: u64,
    /// Medic resumes allowed per run.
    pub max_resumes: u32,
    /// Medic resets of one unit before it is failed/skipped.
    pub max_abandons: u32,
    /// Medic check rows retained.
    pub medic_retention: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            cron_bin: PathBuf::from("agent-cron"),
            cron_interval_ms: 5 * 60 * 1000,
            cron_stagger_ms: 40 * 1000,
            cron_timeout_sec: 15,
            retry_budget: 3,
            role_timeout_sec: 30 * 60,
            role_timeouts: BTreeMap::new(),
            stuck_grace_sec: 5 * 60,
            claimed_stuck_after_sec: 10 * 60,
            orphan_story_after_sec: 30 * 60,
            stalled_claim_after_sec: 12 * 60,
            cron_recreate_cooldown_sec: 15 * 60,
            resume_cooldown_sec: 10 * 60,
            max_resumes: 3,
            max_abandons: 5,
            medic_retention: 500,
        }
    }
}

/// User-scoped default state dir (`~/.local/share/setfarm` on Linux),
/// overridden by `SETFARM_STATE_DIR`.
fn default_state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("setfarm")
}

impl Config {
    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("setfarm.db")
    }

    pub fn workflows_dir(&self) -> PathBuf {
        self.state_dir.join("workflows")
    }

    /// Write-only JSON archive of terminal runs.
    pub fn runs_dir(&self) -> PathBuf {
        self.state_dir.join("runs")
    }

    /// Effective timeout for one role.
    pub fn role_timeout(&self, role: &str) -> u64 {
        self.role_timeouts
            .get(role)
            .copied()
            .unwrap_or(self.role_timeout_sec)
    }

    /// The largest configured role timeout; medic staleness baselines use this.
    pub fn max_role_timeout(&self) -> u64 {
        self.role_timeouts
            .values()
            .copied()
            .max()
            .map_or(self.role_timeout_sec, |m| m.max(self.role_timeout_sec))
    }

    /// Load configuration, layering `<state_dir>/config` (or an explicit
    /// file) over the defaults.
    pub fn resolve(config_path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();
        let path = match config_path {
            Some(p) => p.to_path_buf(),
            None => config.state_dir.join("config"),
        };
        if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            config.apply_file(&text)?;
        }
        Ok(config)
    }

    /// Apply `KEY=value` lines. `#` starts a comment; blank lines are skipped.
    pub fn apply_file(&mut self, text: &str) -> Result<()> {
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| ConfigError::InvalidLine(line.to_string()))?;
            self.apply_key(key.trim(), value.trim())?;
        }
        Ok(())
    }

    fn apply_key(&mut self, key: &str, value: &str) -> Result<()> {
        // Per-role timeout overrides: role_timeout.<role>=seconds
        if let Some(role) = key.strip_prefix("role_timeout.") {
            let secs = parse_int(key, value)?;
            self.role_timeouts.insert(role.to_string(), secs);
            return Ok(());
        }

        match key {
            "state_dir" => self.state_dir = PathBuf::from(value),
            "cron_bin" => self.cron_bin = PathBuf::from(value),
            "cron_interval_ms" => self.cron_interval_ms = parse_int(key, value)?,
            "cron_stagger_ms" => self.cron_stagger_ms = parse_int(key, value)?,
            "cron_timeout_sec" => self.cron_timeout_sec = parse_int(key, value)?,
            "retry_budget" => self.retry_budget = parse_int(key, value)? as u32,
            "role_timeout_sec" => self.role_timeout_sec = parse_int(key, value)?,
            "stuck_grace_sec" => self.stuck_grace_sec = parse_int(key, value)?,
            "claimed_stuck_after_sec" => self.claimed_stuck_after_sec = parse_int(key, value)?,
            "orphan_story_after_sec" => self.orphan_story_after_sec = parse_int(key, value)?,
            "stalled_claim_after_sec" => self.stalled_claim_after_sec = parse_int(key, value)?,
            "cron_recreate_cooldown_sec" => {
                self.cron_recreate_cooldown_sec = parse_int(key, value)?;
            }
            "resume_cooldown_sec" => self.resume_cooldown_sec = parse_int(key, value)?,
            "max_resumes" => self.max_resumes = parse_int(key, value)? as u32,
            "max_abandons" => self.max_abandons = parse_int(key, value)? as u32,
            "medic_retention" => self.medic_retention = parse_int(key, value)? as u32,
            other => return Err(ConfigError::UnknownKey(other.to_string())),
        }
        Ok(())
    }
}

fn parse_int(key: &str, value: &str) -> Result<u64> {
    value.parse().map_err(|_| ConfigError::InvalidInt {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_policy() {
        let config = Config::default();
        assert_eq!(config.retry_budget, 3);
        assert_eq!(config.cron_interval_ms, 300_000);
        assert_eq!(config.cron_stagger_ms, 40_000);
        assert_eq!(config.max_resumes, 3);
        assert_eq!(config.max_abandons, 5);
        assert_eq!(config.medic_retention, 500);
    }

    #[test]
    fn apply_file_overrides_and_role_timeouts() {
        let mut config = Config::default();
        config
            .apply_file(
                "# comment\n\nretry_budget=5\nrole_timeout.workflow/developer=900\ncron_interval_ms=60000\n",
            )
            .unwrap();
        assert_eq!(config.retry_budget, 5);
        assert_eq!(config.cron_interval_ms, 60_000);
        assert_eq!(config.role_timeout("workflow/developer"), 900);
        assert_eq!(config.role_timeout("workflow/planner"), config.role_timeout_sec);
    }

    #[test]
    fn max_role_timeout_covers_overrides() {
        let mut config = Config::default();
        assert_eq!(config.max_role_timeout(), config.role_timeout_sec);
        config
            .role_timeouts
            .insert("workflow/slow".to_string(), 7200);
        assert_eq!(config.max_role_timeout(), 7200);
    }

    #[test]
    fn invalid_lines_are_rejected() {
        let mut config = Config::default();
        assert!(matches!(
            config.apply_file("not a pair"),
            Err(ConfigError::InvalidLine(_))
        ));
        assert!(matches!(
            config.apply_file("retry_budget=abc"),
            Err(ConfigError::InvalidInt { .. })
        ));
        assert!(matches!(
            config.apply_file("mystery=1"),
            Err(ConfigError::UnknownKey(_))
        ));
    }

    #[test]
    fn state_paths_derive_from_state_dir() {
        let mut config = Config::default();
        config.state_dir = PathBuf::from("/tmp/farm");
        assert_eq!(config.db_path(), PathBuf::from("/tmp/farm/setfarm.db"));
        assert_eq!(config.workflows_dir(), PathBuf::from("/tmp/farm/workflows"));
        assert_eq!(config.runs_dir(), PathBuf::from("/tmp/farm/runs"));
    }
}
