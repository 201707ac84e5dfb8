//! Driver configuration
//!
//! Layered as defaults, then an optional TOML file, then `ROUND_DRIVER_*`
//! environment variables, then command-line flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use coordination::{ChatMode, Participant, RoundConfig};
use serde::{Deserialize, Serialize};

/// Command-line arguments
#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Number of rounds to run (overrides ROUND_DRIVER_ROUNDS)
    #[arg(long)]
    pub rounds: Option<u32>,

    /// Number of participants (overrides ROUND_DRIVER_PARTICIPANTS)
    #[arg(long)]
    pub participants: Option<usize>,

    /// Conversation mode: analyzing, brainstorming, debating, solving
    #[arg(long)]
    pub mode: Option<ChatMode>,

    /// Run a pre-search before each round
    #[arg(long, default_value_t = false)]
    pub web_search: bool,

    /// Participant indices whose turns fail mid-stream
    #[arg(long, value_delimiter = ',')]
    pub fail_participants: Vec<usize>,

    /// Make every pre-search fail
    #[arg(long, default_value_t = false)]
    pub fail_search: bool,

    /// Make every moderator summary fail
    #[arg(long, default_value_t = false)]
    pub fail_moderator: bool,

    /// Directory for `<stream_id>.json` snapshots
    #[arg(long)]
    pub snapshot_dir: Option<PathBuf>,

    /// Resume this stream from the snapshot directory before running
    #[arg(long)]
    pub resume: Option<String>,

    /// Print the session report as JSON on stdout
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

/// Everything the driver needs to run a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub rounds: u32,
    pub participants: usize,
    pub mode: ChatMode,
    pub web_search: bool,
    pub fail_participants: Vec<usize>,
    pub fail_search: bool,
    pub fail_moderator: bool,
    pub snapshot_dir: Option<PathBuf>,
    pub resume: Option<String>,
    /// Pause between streamed chunks
    pub chunk_delay_ms: u64,
    /// Simulated animation length per participant turn
    pub animation_ms: u64,
    /// Core orchestration tunables (`[round]` table)
    pub round: RoundConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            rounds: 2,
            participants: 3,
            mode: ChatMode::default(),
            web_search: false,
            fail_participants: Vec::new(),
            fail_search: false,
            fail_moderator: false,
            snapshot_dir: None,
            resume: None,
            chunk_delay_ms: 5,
            animation_ms: 20,
            round: RoundConfig::default(),
        }
    }
}

impl DriverConfig {
    /// Load from a TOML file; missing keys keep their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read driver config {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("Invalid driver config {}", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("Failed to parse driver config TOML")?;
        Ok(config)
    }

    /// Apply `ROUND_DRIVER_*` variables and the core's `ROUNDTABLE_*` ones
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_parse("ROUND_DRIVER_ROUNDS") {
            self.rounds = v;
        }
        if let Some(v) = env_parse("ROUND_DRIVER_PARTICIPANTS") {
            self.participants = v;
        }
        if let Some(v) = env_parse("ROUND_DRIVER_MODE") {
            self.mode = v;
        }
        if let Some(v) = env_parse("ROUND_DRIVER_WEB_SEARCH") {
            self.web_search = v;
        }
        if let Ok(dir) = std::env::var("ROUND_DRIVER_SNAPSHOT_DIR") {
            self.snapshot_dir = Some(PathBuf::from(dir));
        }
        if let Some(v) = env_parse("ROUND_DRIVER_CHUNK_DELAY_MS") {
            self.chunk_delay_ms = v;
        }
        if let Some(v) = env_parse("ROUND_DRIVER_ANIMATION_MS") {
            self.animation_ms = v;
        }
        self.round = self.round.with_env_overrides();
        self
    }

    /// Apply command-line flags on top
    pub fn apply_cli(mut self, cli: &Cli) -> Self {
        if let Some(rounds) = cli.rounds {
            self.rounds = rounds;
        }
        if let Some(participants) = cli.participants {
            self.participants = participants;
        }
        if let Some(mode) = cli.mode {
            self.mode = mode;
        }
        self.web_search |= cli.web_search;
        if !cli.fail_participants.is_empty() {
            self.fail_participants = cli.fail_participants.clone();
        }
        self.fail_search |= cli.fail_search;
        self.fail_moderator |= cli.fail_moderator;
        if cli.snapshot_dir.is_some() {
            self.snapshot_dir = cli.snapshot_dir.clone();
        }
        if cli.resume.is_some() {
            self.resume = cli.resume.clone();
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.participants == 0 {
            bail!("participants must be at least 1");
        }
        if self.resume.is_some() && self.snapshot_dir.is_none() {
            bail!("--resume needs a snapshot directory");
        }
        if let Some(index) = self.fail_participants.iter().find(|i| **i >= self.participants) {
            bail!(
                "fail_participants index {} out of range for {} participants",
                index,
                self.participants
            );
        }
        self.round
            .validate()
            .context("Invalid [round] configuration")?;
        Ok(())
    }

    /// Participant roster in priority order
    pub fn roster(&self) -> Vec<Participant> {
        const MODELS: [&str; 4] = ["model-alpha", "model-bravo", "model-charlie", "model-delta"];
        (0..self.participants)
            .map(|i| {
                Participant::new(format!("participant-{i}"), MODELS[i % MODELS.len()], i as u32)
                    .with_role(format!("voice {}", i + 1))
            })
            .collect()
    }

    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }

    pub fn animation(&self) -> Duration {
        Duration::from_millis(self.animation_ms)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
