//! Data model for matchmaking and matches.
//!
//! This module provides the plain document types and their validated
//! transitions. Nothing here performs I/O or spawns tasks:
//!
//! - `player` - Player state machine (idle → searching → waiting → matched → playing)
//! - `room` - Waiting rooms as a tagged open/full/abandoned state
//! - `game` - Match documents and the dice rule table
//! - `presence` - Heartbeat tracking
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                               Store                                  │
//! │                                                                      │
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌──────────────────┐    │
//! │  │  player states   │  │  waiting rooms   │  │     matches      │    │
//! │  │                  │  │                  │  │                  │    │
//! │  │ player_id →      │  │ room_id →        │  │ match_id →       │    │
//! │  │   PlayerState    │  │   WaitingRoom    │  │   Match          │    │
//! │  │                  │  │                  │  │   + watch feed   │    │
//! │  └──────────────────┘  └────────┬─────────┘  └────────▲─────────┘    │
//! │                                 │   promote (same id)  │              │
//! │                                 └──────────────────────┘              │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

pub mod game;
pub mod player;
pub mod presence;
pub mod room;

// Re-export commonly used types
pub use game::{
    score_roll, BankOutcome, DiceRules, DieSlot, GameData, GameError, GamePhase, Match,
    MatchSeat, MatchStatus, Parity, RollOutcome, Seat, DEFAULT_DIE_FACES,
    DEFAULT_SNAKE_EYES_BONUS, DEFAULT_TARGET_SCORE,
};
pub use player::{
    InvalidTransition, PlayerEvent, PlayerId, PlayerState, PlayerStatus, SessionId, SessionType,
};
pub use presence::{Connection, ConnectionStatus, Presence, PresenceTracker};
pub use room::{
    Controller, Participant, Personality, PlayerStats, RoomError, RoomState, WaitingRoom,
};
