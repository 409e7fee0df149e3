//! Player state machine.
//!
//! Tracks where a player is in the matchmaking lifecycle and validates
//! transitions. One record per player lives in the player-state collection.
//!
//! # State Diagram
//!
//! ```text
//! ┌──────┐  search   ┌───────────┐  enter(waiting)  ┌─────────┐
//! │ Idle │──────────▶│ Searching │─────────────────▶│ Waiting │
//! └──────┘           └─────┬─────┘                  └────┬────┘
//!    ▲                     │ enter(matched)              │ opponent found
//!    │                     ▼                             │
//!    │               ┌───────────┐◀──────────────────────┘
//!    │               │  Matched  │
//!    │               └─────┬─────┘
//!    │                     │ start_playing
//!    │                     ▼
//!    │               ┌───────────┐
//!    │               │  Playing  │
//!    │               └─────┬─────┘
//!    │ release             │
//!    └─────────────────────┘  (release is accepted from every state)
//! ```

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Opaque player identifier.
pub type PlayerId = String;

/// Opaque session identifier. A waiting room and the match promoted from it
/// share the same id.
pub type SessionId = String;

/// Kind of session a player asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    Quick,
    Ranked,
    Friend,
    Tournament,
    Rematch,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Ranked => "ranked",
            Self::Friend => "friend",
            Self::Tournament => "tournament",
            Self::Rematch => "rematch",
        }
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerStatus {
    #[default]
    Idle,
    Searching,
    Waiting,
    Matched,
    Playing,
}

impl PlayerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Searching => "searching",
            Self::Waiting => "waiting",
            Self::Matched => "matched",
            Self::Playing => "playing",
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

impl fmt::Display for PlayerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State transition events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    Search {
        session_type: SessionType,
        game_mode: String,
    },
    EnterSession {
        session_id: SessionId,
        status: PlayerStatus,
    },
    OpponentFound {
        session_id: SessionId,
        opponent_id: PlayerId,
    },
    StartPlaying {
        session_id: SessionId,
    },
    Release,
}

/// Error when a state transition is invalid.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid transition from {from} via {event:?}: {reason}")]
pub struct InvalidTransition {
    pub from: PlayerStatus,
    pub event: PlayerEvent,
    pub reason: String,
}

/// Persisted player-state document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    pub player_id: PlayerId,
    pub current_session_id: Option<SessionId>,
    pub current_session_type: Option<SessionType>,
    pub current_game_mode: Option<String>,
    pub current_status: PlayerStatus,
    pub last_activity: DateTime<Utc>,
    pub is_in_game: bool,
    pub is_in_queue: bool,
    pub opponent_id: Option<PlayerId>,
}

impl PlayerState {
    /// Create an idle record.
    pub fn new(player_id: impl Into<PlayerId>) -> Self {
        Self::idle_at(player_id.into(), Utc::now())
    }

    fn idle_at(player_id: PlayerId, now: DateTime<Utc>) -> Self {
        Self {
            player_id,
            current_session_id: None,
            current_session_type: None,
            current_game_mode: None,
            current_status: PlayerStatus::Idle,
            last_activity: now,
            is_in_game: false,
            is_in_queue: false,
            opponent_id: None,
        }
    }

    pub fn status(&self) -> PlayerStatus {
        self.current_status
    }

    pub fn is_idle(&self) -> bool {
        self.current_status.is_idle()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.current_session_id.as_deref()
    }

    /// Non-idle record whose last activity is older than `threshold`.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: TimeDelta) -> bool {
        !self.is_idle() && now - self.last_activity > threshold
    }

    /// Refresh the activity timestamp without changing state.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity = now;
    }

    /// Apply an event, returning the new state or an error.
    pub fn apply(&self, event: PlayerEvent) -> Result<Self, InvalidTransition> {
        self.transition(&event, Utc::now())
    }

    /// Apply an event in place, returning error if invalid.
    pub fn apply_mut(&mut self, event: PlayerEvent) -> Result<(), InvalidTransition> {
        self.apply_mut_at(event, Utc::now())
    }

    /// Apply an event in place using an explicit clock reading.
    pub fn apply_mut_at(
        &mut self,
        event: PlayerEvent,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        *self = self.transition(&event, now)?;
        Ok(())
    }

    /// Calculate the next record for an event.
    fn transition(
        &self,
        event: &PlayerEvent,
        now: DateTime<Utc>,
    ) -> Result<Self, InvalidTransition> {
        use PlayerEvent::*;
        use PlayerStatus::*;

        let invalid = |reason: String| InvalidTransition {
            from: self.current_status,
            event: event.clone(),
            reason,
        };

        let mut next = self.clone();
        next.last_activity = now;

        match (self.current_status, event) {
            // Search: Idle -> Searching, or refresh an ongoing search of the same type
            (Idle, Search { session_type, game_mode }) => {
                next.current_status = Searching;
                next.current_session_id = None;
                next.current_session_type = Some(*session_type);
                next.current_game_mode = Some(game_mode.clone());
                next.is_in_queue = true;
                next.is_in_game = false;
                next.opponent_id = None;
                Ok(next)
            }
            (Searching, Search { session_type, game_mode }) => {
                match self.current_session_type {
                    Some(current) if current != *session_type => Err(invalid(format!(
                        "Already searching for a {} match",
                        current
                    ))),
                    _ => {
                        next.current_session_type = Some(*session_type);
                        next.current_game_mode = Some(game_mode.clone());
                        Ok(next)
                    }
                }
            }
            (Waiting, Search { .. }) => Err(invalid("Already waiting for an opponent".into())),
            (Matched, Search { .. }) | (Playing, Search { .. }) => {
                Err(invalid("Already in a game".into()))
            }

            // EnterSession: Searching -> Waiting | Matched, Waiting -> Matched
            (_, EnterSession { status, .. }) if !matches!(status, Waiting | Matched) => {
                Err(invalid("Session status must be waiting or matched".into()))
            }
            (Searching, EnterSession { session_id, status }) => {
                next.current_status = *status;
                next.current_session_id = Some(session_id.clone());
                next.is_in_queue = *status == Waiting;
                Ok(next)
            }
            (Waiting, EnterSession { session_id, status: Matched }) => {
                if self.session_id() != Some(session_id.as_str()) {
                    return Err(invalid("Entered a different session".into()));
                }
                next.current_status = Matched;
                next.is_in_queue = false;
                Ok(next)
            }
            (Waiting, EnterSession { .. }) => Err(invalid("Already waiting for an opponent".into())),
            (Idle, EnterSession { .. }) => Err(invalid("Not searching".into())),
            (_, EnterSession { .. }) => Err(invalid("Already in a game".into())),

            // OpponentFound: bind an opponent
            (Searching, OpponentFound { session_id, opponent_id }) => {
                next.current_status = Matched;
                next.current_session_id = Some(session_id.clone());
                next.opponent_id = Some(opponent_id.clone());
                next.is_in_game = true;
                next.is_in_queue = false;
                Ok(next)
            }
            (Waiting | Matched, OpponentFound { session_id, opponent_id }) => {
                if self.session_id() != Some(session_id.as_str()) {
                    return Err(invalid("Matched into a different session".into()));
                }
                next.current_status = Matched;
                next.opponent_id = Some(opponent_id.clone());
                next.is_in_game = true;
                next.is_in_queue = false;
                Ok(next)
            }
            (Idle, OpponentFound { .. }) => Err(invalid("Not searching".into())),
            (Playing, OpponentFound { .. }) => Err(invalid("Already playing".into())),

            // StartPlaying: Matched -> Playing
            (Matched, StartPlaying { session_id }) => {
                if self.session_id() != Some(session_id.as_str()) {
                    return Err(invalid("Playing a different session".into()));
                }
                next.current_status = Playing;
                next.is_in_game = true;
                next.is_in_queue = false;
                Ok(next)
            }
            (Playing, StartPlaying { .. }) => Err(invalid("Already playing".into())),
            (_, StartPlaying { .. }) => Err(invalid("Not matched".into())),

            // Release: any -> Idle
            (_, Release) => Ok(Self::idle_at(self.player_id.clone(), now)),
        }
    }
}
