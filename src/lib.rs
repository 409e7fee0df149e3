//! RollDuel State Library
//!
//! This crate provides matchmaking and the match state machine for
//! RollDuel, a two-player push-your-luck dice game.
//!
//! # Overview
//!
//! - **Player State Machine** - Tracks where each player is (idle, searching,
//!   waiting, matched, playing) with validated transitions.
//!
//! - **Room Allocation** - Pairs requests into waiting rooms under optimistic
//!   transactions, so concurrent searchers never double-book a seat.
//!
//! - **Match Engine** - Turn decider, staged dice reveals, scoring, banking and
//!   completion, published to subscribers on every write.
//!
//! - **Bots** - Seat a bot after a fallback delay and drive its turns.
//!
//! - **Reaper** - Periodically clears stale rooms, orphaned matches and
//!   players left pointing at sessions that no longer exist.
//!
//! # Design Principles
//!
//! 1. **State machines validate transitions** - Invalid changes are rejected
//!    with the reason shown to the player.
//!
//! 2. **Writes are checked and atomic** - Every update is applied to a copy and
//!    committed only when it validates.
//!
//! 3. **No networking** - Presentation layers call [`Matchmaker`] and subscribe
//!    to match snapshots; transport is theirs.
//!
//! 4. **Serialization-ready** - Documents serialize to the camelCase JSON
//!    clients read.
//!
//! # Example
//!
//! ```rust
//! use rollduel_state::{
//!     DiceRules, Match, Parity, Participant, PlayerEvent, PlayerState, PlayerStatus,
//!     RollOutcome, Seat, SessionType, WaitingRoom, score_roll,
//! };
//!
//! // Update the player state machine
//! let mut alice = PlayerState::new("alice");
//! alice
//!     .apply_mut(PlayerEvent::Search {
//!         session_type: SessionType::Quick,
//!         game_mode: "classic".to_string(),
//!     })
//!     .unwrap();
//! assert_eq!(alice.status(), PlayerStatus::Searching);
//!
//! // Fill a room and promote it
//! let mut room = WaitingRoom::open("classic", SessionType::Quick, Participant::human("alice", "Alice"));
//! room.fill(Participant::human("bob", "Bob")).unwrap();
//! let mut game = Match::from_room(&room, DiceRules::default(), Seat::Host).unwrap();
//! assert_eq!(game.id, room.id);
//!
//! // Alice calls odd and the decider shows 3
//! game.choose_parity("alice", Parity::Odd).unwrap();
//! assert_eq!(game.resolve_turn_decider(3).unwrap(), Seat::Host);
//!
//! assert_eq!(score_roll(4, 5, &game.game.rules), RollOutcome::Points(9));
//! ```

pub mod allocator;
pub mod bot;
pub mod config;
pub mod engine;
pub mod matchmaker;
pub mod profile;
pub mod reaper;
pub mod state;
pub mod store;
pub mod timer;
pub mod tracker;

// Re-export everything from state module at crate root
pub use state::*;

pub use config::{ConfigError, GameMode, MatchmakingConfig, ReaperConfig};
pub use engine::{Action, ActionError, DiceSource, MatchEngine, RandomDice, ScriptedDice};
pub use matchmaker::{CleanupReport, Collaborators, MatchTicket, Matchmaker, MatchmakingError};
pub use profile::{BotRoster, DefaultRoster, MemoryProfiles, ProfileService};
pub use store::{Store, StoreError};
