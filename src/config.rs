//! Operational parameters.
//!
//! Every delay and threshold the services use lives here. Defaults are the
//! values observed in production; all of them can be overridden from JSON.

use std::path::Path;
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::state::game::{DiceRules, DEFAULT_DIE_FACES, DEFAULT_SNAKE_EYES_BONUS};

/// Errors loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// A playable game mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameMode {
    pub name: String,
    pub target_score: u32,
    #[serde(default = "default_die_faces")]
    pub die_faces: u8,
    #[serde(default = "default_snake_eyes_bonus")]
    pub snake_eyes_bonus: u32,
}

fn default_die_faces() -> u8 {
    DEFAULT_DIE_FACES
}

fn default_snake_eyes_bonus() -> u32 {
    DEFAULT_SNAKE_EYES_BONUS
}

impl GameMode {
    pub fn new(name: &str, target_score: u32) -> Self {
        Self {
            name: name.to_string(),
            target_score,
            die_faces: DEFAULT_DIE_FACES,
            snake_eyes_bonus: DEFAULT_SNAKE_EYES_BONUS,
        }
    }

    pub fn rules(&self) -> DiceRules {
        DiceRules {
            target_score: self.target_score,
            die_faces: self.die_faces,
            snake_eyes_bonus: self.snake_eyes_bonus,
        }
    }
}

/// Reaper thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReaperConfig {
    pub interval_secs: u64,
    /// Heartbeat silence after which a player counts as disconnected
    pub disconnect_secs: i64,
    /// Age after which a waiting/matched session with no live participant is orphaned
    pub orphan_secs: i64,
    /// Inactivity after which an in-gameplay match with no live participant is orphaned
    pub active_inactivity_secs: i64,
    /// Age after which an unfilled room is deleted
    pub room_stale_secs: i64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3 * 60,
            disconnect_secs: 5 * 60,
            orphan_secs: 10 * 60,
            active_inactivity_secs: 30 * 60,
            room_stale_secs: 10 * 60,
        }
    }
}

impl ReaperConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "reaper.intervalSecs must be positive".to_string(),
            ));
        }
        let thresholds = [
            ("disconnectSecs", self.disconnect_secs),
            ("orphanSecs", self.orphan_secs),
            ("activeInactivitySecs", self.active_inactivity_secs),
            ("roomStaleSecs", self.room_stale_secs),
        ];
        for (name, value) in thresholds {
            if value < 0 {
                return Err(ConfigError::Invalid(format!(
                    "reaper.{} must not be negative",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn disconnect_after(&self) -> TimeDelta {
        TimeDelta::seconds(self.disconnect_secs)
    }

    pub fn orphan_after(&self) -> TimeDelta {
        TimeDelta::seconds(self.orphan_secs)
    }

    pub fn active_inactivity(&self) -> TimeDelta {
        TimeDelta::seconds(self.active_inactivity_secs)
    }

    pub fn room_stale_after(&self) -> TimeDelta {
        TimeDelta::seconds(self.room_stale_secs)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MatchmakingConfig {
    /// Delay between pairing and promotion so both clients can show the match
    pub promotion_grace_ms: u64,
    /// Wait before an unfilled room gets a bot opponent
    pub bot_fallback_secs: u64,
    pub bot_delay_min_ms: u64,
    pub bot_delay_max_ms: u64,
    /// Pause between staged dice reveals
    pub roll_stage_ms: u64,
    /// Pause between the odd/even call and the decider result
    pub decider_reveal_ms: u64,
    pub transaction_retries: u32,
    /// Age after which a non-idle player state is reset
    pub stale_state_minutes: i64,
    pub reaper: ReaperConfig,
    pub modes: Vec<GameMode>,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self {
            promotion_grace_ms: 5_000,
            bot_fallback_secs: 120,
            bot_delay_min_ms: 1_500,
            bot_delay_max_ms: 5_000,
            roll_stage_ms: 600,
            decider_reveal_ms: 1_500,
            transaction_retries: 8,
            stale_state_minutes: 30,
            reaper: ReaperConfig::default(),
            modes: vec![
                GameMode::new("classic", 100),
                GameMode::new("blitz", 50),
                GameMode::new("marathon", 250),
            ],
        }
    }
}

impl MatchmakingConfig {
    /// Parse from a JSON string. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bot_delay_min_ms > self.bot_delay_max_ms {
            return Err(ConfigError::Invalid(
                "botDelayMinMs exceeds botDelayMaxMs".to_string(),
            ));
        }
        if self.stale_state_minutes < 0 {
            return Err(ConfigError::Invalid(
                "staleStateMinutes must not be negative".to_string(),
            ));
        }
        self.reaper.validate()?;
        if self.modes.is_empty() {
            return Err(ConfigError::Invalid("no game modes configured".to_string()));
        }
        for mode in &self.modes {
            if mode.die_faces < 2 || mode.target_score == 0 {
                return Err(ConfigError::Invalid(format!(
                    "game mode {} needs at least two faces and a positive target",
                    mode.name
                )));
            }
        }
        Ok(())
    }

    /// Look up a game mode by name.
    pub fn mode(&self, name: &str) -> Option<&GameMode> {
        self.modes.iter().find(|m| m.name == name)
    }

    pub fn promotion_grace(&self) -> Duration {
        Duration::from_millis(self.promotion_grace_ms)
    }

    pub fn bot_fallback(&self) -> Duration {
        Duration::from_secs(self.bot_fallback_secs)
    }

    pub fn roll_stage(&self) -> Duration {
        Duration::from_millis(self.roll_stage_ms)
    }

    pub fn decider_reveal(&self) -> Duration {
        Duration::from_millis(self.decider_reveal_ms)
    }

    pub fn stale_state_after(&self) -> TimeDelta {
        TimeDelta::minutes(self.stale_state_minutes)
    }

    /// Config with every delay zeroed, for driving services synchronously.
    pub fn instant() -> Self {
        Self {
            promotion_grace_ms: 0,
            bot_delay_min_ms: 0,
            bot_delay_max_ms: 0,
            roll_stage_ms: 0,
            decider_reveal_ms: 0,
            ..Self::default()
        }
    }
}
