//! Match state management.
//!
//! The authoritative game session once two participants are bound. Everything
//! here is pure: the [`MatchEngine`](crate::engine::MatchEngine) draws dice and
//! persists, while this module decides what each action does.
//!
//! # Phases
//!
//! ```text
//! ┌─────────────┐ parity resolved ┌──────────┐ bank >= target ┌──────────┐
//! │ TurnDecider │────────────────▶│ Gameplay │───────────────▶│ GameOver │
//! └─────────────┘                 └──────────┘                └──────────┘
//!        │                              │         abandon           ▲
//!        └──────────────────────────────┴───────────────────────────┘
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::player::{PlayerId, SessionId};
use super::room::{Controller, Participant, RoomState, WaitingRoom};

/// Default score needed to win.
pub const DEFAULT_TARGET_SCORE: u32 = 100;

/// Default number of die faces.
pub const DEFAULT_DIE_FACES: u8 = 6;

/// Turn score awarded for double ones.
pub const DEFAULT_SNAKE_EYES_BONUS: u32 = 20;

/// Numeric parameters of a game mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiceRules {
    pub target_score: u32,
    pub die_faces: u8,
    pub snake_eyes_bonus: u32,
}

impl Default for DiceRules {
    fn default() -> Self {
        Self {
            target_score: DEFAULT_TARGET_SCORE,
            die_faces: DEFAULT_DIE_FACES,
            snake_eyes_bonus: DEFAULT_SNAKE_EYES_BONUS,
        }
    }
}

/// Game phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GamePhase {
    #[default]
    TurnDecider,
    Gameplay,
    GameOver,
}

impl GamePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TurnDecider => "turnDecider",
            Self::Gameplay => "gameplay",
            Self::GameOver => "gameOver",
        }
    }
}

impl fmt::Display for GamePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    #[default]
    Active,
    Completed,
    Abandoned,
}

impl MatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Abandoned)
    }
}

/// Odd or even call made during the turn decider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    Odd,
    Even,
}

impl Parity {
    pub fn of(value: u8) -> Self {
        if value % 2 == 0 {
            Self::Even
        } else {
            Self::Odd
        }
    }

    pub fn matches(&self, value: u8) -> bool {
        Self::of(value) == *self
    }
}

/// One of the two seats. Persisted as `1` (host) or `2` (opponent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Seat {
    Host,
    Opponent,
}

impl Seat {
    pub fn other(&self) -> Self {
        match self {
            Self::Host => Self::Opponent,
            Self::Opponent => Self::Host,
        }
    }
}

impl From<Seat> for u8 {
    fn from(seat: Seat) -> u8 {
        match seat {
            Seat::Host => 1,
            Seat::Opponent => 2,
        }
    }
}

impl TryFrom<u8> for Seat {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Host),
            2 => Ok(Self::Opponent),
            other => Err(format!("invalid seat {}", other)),
        }
    }
}

/// Which die of a roll is being revealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DieSlot {
    First,
    Second,
}

/// Result of a resolved roll, in rule priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollOutcome {
    /// Exactly one die shows 1: turn score lost, turn passes.
    Bust,
    /// Both dice show the top face: turn score lost, banked score reset, turn passes.
    Wipeout,
    /// Both dice show 1: bonus added, same player continues.
    SnakeEyes(u32),
    /// Sum added, same player continues.
    Points(u32),
}

impl RollOutcome {
    pub fn passes_turn(&self) -> bool {
        matches!(self, Self::Bust | Self::Wipeout)
    }
}

/// Score a pair of dice.
pub fn score_roll(first: u8, second: u8, rules: &DiceRules) -> RollOutcome {
    let top = rules.die_faces;
    match (first, second) {
        (1, 1) => RollOutcome::SnakeEyes(rules.snake_eyes_bonus),
        (1, _) | (_, 1) => RollOutcome::Bust,
        (a, b) if a == top && b == top => RollOutcome::Wipeout,
        (a, b) => RollOutcome::Points(u32::from(a) + u32::from(b)),
    }
}

/// Result of a bank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BankOutcome {
    /// Score committed, turn passed.
    Banked { score: u32 },
    /// Score reached the target.
    Won { winner: PlayerId, score: u32 },
}

/// A seat in the match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchSeat {
    pub player_id: PlayerId,
    pub display_name: String,
    pub score: u32,
    pub turn_active: bool,
    pub controller: Controller,
}

impl MatchSeat {
    fn from_participant(p: &Participant) -> Self {
        Self {
            player_id: p.player_id.clone(),
            display_name: p.display_name.clone(),
            score: 0,
            turn_active: false,
            controller: p.controller.clone(),
        }
    }

    pub fn is_bot(&self) -> bool {
        self.controller.is_bot()
    }
}

/// Mutable game data of a match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameData {
    pub game_mode: String,
    pub game_phase: GamePhase,
    pub is_rolling: bool,
    pub dice_one: Option<u8>,
    pub dice_two: Option<u8>,
    pub turn_score: u32,
    /// Seat that calls odd or even
    pub turn_decider: Seat,
    pub turn_decider_choice: Option<Parity>,
    pub rules: DiceRules,
    pub winner: Option<PlayerId>,
    pub game_over_reason: Option<String>,
}

/// Game errors. Each renders as the reason shown to the player.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GameError {
    #[error("It's not your turn")]
    NotYourTurn,
    #[error("Not allowed during the {0} phase")]
    WrongPhase(GamePhase),
    #[error("A roll is already in progress")]
    RollInFlight,
    #[error("No roll is in progress")]
    NoRollInFlight,
    #[error("Nothing to bank yet")]
    NothingToBank,
    #[error("The game is already over")]
    GameOver,
    #[error("Not a player in this match")]
    NotParticipant,
    #[error("Only the deciding player picks odd or even")]
    NotChooser,
    #[error("Odd or even has already been chosen")]
    ChoiceAlreadyMade,
    #[error("Waiting room is not full")]
    RoomNotFull,
    #[error("Session expired")]
    SessionExpired,
}

/// Match document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Match {
    /// Same id as the waiting room it was promoted from
    pub id: SessionId,

    #[serde(rename = "hostData")]
    pub host: MatchSeat,

    #[serde(rename = "opponentData")]
    pub opponent: MatchSeat,

    #[serde(rename = "gameData")]
    pub game: GameData,

    pub status: MatchStatus,

    pub created_at: DateTime<Utc>,

    /// Last accepted mutation
    pub updated_at: DateTime<Utc>,

    /// Bumped by the store on every committed write
    pub version: u64,
}

impl Match {
    /// Promote a full room. `chooser` calls odd or even and holds the turn
    /// until the decider resolves.
    pub fn from_room(room: &WaitingRoom, rules: DiceRules, chooser: Seat) -> Result<Self, GameError> {
        let (host, opponent) = match &room.state {
            RoomState::Full { host, opponent } => (host, opponent),
            _ => return Err(GameError::RoomNotFull),
        };
        let now = Utc::now();
        let mut game = Self {
            id: room.id.clone(),
            host: MatchSeat::from_participant(host),
            opponent: MatchSeat::from_participant(opponent),
            game: GameData {
                game_mode: room.game_mode.clone(),
                game_phase: GamePhase::TurnDecider,
                is_rolling: false,
                dice_one: None,
                dice_two: None,
                turn_score: 0,
                turn_decider: chooser,
                turn_decider_choice: None,
                rules,
                winner: None,
                game_over_reason: None,
            },
            status: MatchStatus::Active,
            created_at: now,
            updated_at: now,
            version: 0,
        };
        game.seat_mut(chooser).turn_active = true;
        Ok(game)
    }

    pub fn seat(&self, seat: Seat) -> &MatchSeat {
        match seat {
            Seat::Host => &self.host,
            Seat::Opponent => &self.opponent,
        }
    }

    pub fn seat_mut(&mut self, seat: Seat) -> &mut MatchSeat {
        match seat {
            Seat::Host => &mut self.host,
            Seat::Opponent => &mut self.opponent,
        }
    }

    /// Seat held by a player.
    pub fn seat_of(&self, player_id: &str) -> Option<Seat> {
        if self.host.player_id == player_id {
            Some(Seat::Host)
        } else if self.opponent.player_id == player_id {
            Some(Seat::Opponent)
        } else {
            None
        }
    }

    /// Seat currently holding the turn.
    pub fn active_seat(&self) -> Option<Seat> {
        match (self.host.turn_active, self.opponent.turn_active) {
            (true, false) => Some(Seat::Host),
            (false, true) => Some(Seat::Opponent),
            _ => None,
        }
    }

    pub fn phase(&self) -> GamePhase {
        self.game.game_phase
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn has_bot(&self) -> bool {
        self.host.is_bot() || self.opponent.is_bot()
    }

    pub fn has_player(&self, player_id: &str) -> bool {
        self.seat_of(player_id).is_some()
    }

    pub fn seats(&self) -> [&MatchSeat; 2] {
        [&self.host, &self.opponent]
    }

    /// Exactly one turn flag while live, none once over.
    pub fn turn_flags_consistent(&self) -> bool {
        let active = [self.host.turn_active, self.opponent.turn_active]
            .iter()
            .filter(|a| **a)
            .count();
        if self.is_terminal() || self.phase() == GamePhase::GameOver {
            active == 0
        } else {
            active == 1
        }
    }

    /// Validate that `player_id` may act in `phase`, returning their seat.
    fn ensure_turn(&self, player_id: &str, phase: GamePhase) -> Result<Seat, GameError> {
        if self.is_terminal() {
            return Err(GameError::GameOver);
        }
        let seat = self.seat_of(player_id).ok_or(GameError::NotParticipant)?;
        if self.game.game_phase != phase {
            return Err(GameError::WrongPhase(self.game.game_phase));
        }
        if !self.seat(seat).turn_active {
            return Err(GameError::NotYourTurn);
        }
        Ok(seat)
    }

    /// Record the chooser's odd/even call. The decider die is drawn next.
    pub fn choose_parity(&mut self, player_id: &str, choice: Parity) -> Result<(), GameError> {
        let seat = self.ensure_turn(player_id, GamePhase::TurnDecider)?;
        if seat != self.game.turn_decider {
            return Err(GameError::NotChooser);
        }
        if self.game.turn_decider_choice.is_some() {
            return Err(GameError::ChoiceAlreadyMade);
        }
        self.game.turn_decider_choice = Some(choice);
        self.game.is_rolling = true;
        Ok(())
    }

    /// Resolve the decider with the drawn die, returning the seat that
    /// opens gameplay.
    pub fn resolve_turn_decider(&mut self, value: u8) -> Result<Seat, GameError> {
        if self.is_terminal() {
            return Err(GameError::SessionExpired);
        }
        if self.game.game_phase != GamePhase::TurnDecider {
            return Err(GameError::WrongPhase(self.game.game_phase));
        }
        let choice = self.game.turn_decider_choice.ok_or(GameError::NoRollInFlight)?;
        let chooser = self.game.turn_decider;
        let first = if choice.matches(value) {
            chooser
        } else {
            chooser.other()
        };

        self.game.dice_one = Some(value);
        self.game.dice_two = None;
        self.game.is_rolling = false;
        self.game.turn_score = 0;
        self.game.game_phase = GamePhase::Gameplay;
        self.seat_mut(first).turn_active = true;
        self.seat_mut(first.other()).turn_active = false;
        Ok(first)
    }

    /// Start a roll for the active player.
    pub fn begin_roll(&mut self, player_id: &str) -> Result<Seat, GameError> {
        let seat = self.ensure_turn(player_id, GamePhase::Gameplay)?;
        if self.game.is_rolling {
            return Err(GameError::RollInFlight);
        }
        self.game.is_rolling = true;
        self.game.dice_one = None;
        self.game.dice_two = None;
        Ok(seat)
    }

    /// Expose one die of the roll in flight.
    pub fn reveal_die(&mut self, slot: DieSlot, value: u8) -> Result<(), GameError> {
        if self.is_terminal() {
            return Err(GameError::SessionExpired);
        }
        if !self.game.is_rolling {
            return Err(GameError::NoRollInFlight);
        }
        match slot {
            DieSlot::First => self.game.dice_one = Some(value),
            DieSlot::Second => self.game.dice_two = Some(value),
        }
        Ok(())
    }

    /// Apply the rule table to the revealed dice.
    pub fn resolve_roll(&mut self) -> Result<RollOutcome, GameError> {
        if self.is_terminal() {
            return Err(GameError::SessionExpired);
        }
        if self.game.game_phase != GamePhase::Gameplay {
            return Err(GameError::WrongPhase(self.game.game_phase));
        }
        let (first, second) = match (self.game.is_rolling, self.game.dice_one, self.game.dice_two) {
            (true, Some(a), Some(b)) => (a, b),
            _ => return Err(GameError::NoRollInFlight),
        };
        let seat = self.active_seat().ok_or(GameError::NotYourTurn)?;

        let outcome = score_roll(first, second, &self.game.rules);
        self.game.is_rolling = false;
        match outcome {
            RollOutcome::Bust => self.pass_turn(seat),
            RollOutcome::Wipeout => {
                self.seat_mut(seat).score = 0;
                self.pass_turn(seat);
            }
            RollOutcome::SnakeEyes(points) | RollOutcome::Points(points) => {
                self.game.turn_score += points;
            }
        }
        Ok(outcome)
    }

    /// Land both dice and score them in one step. Earlier reveals of the
    /// same roll may or may not have been written.
    pub fn settle_roll(&mut self, first: u8, second: u8) -> Result<RollOutcome, GameError> {
        self.reveal_die(DieSlot::First, first)?;
        self.reveal_die(DieSlot::Second, second)?;
        self.resolve_roll()
    }

    /// Commit the turn score.
    pub fn bank(&mut self, player_id: &str) -> Result<BankOutcome, GameError> {
        let seat = self.ensure_turn(player_id, GamePhase::Gameplay)?;
        if self.game.is_rolling {
            return Err(GameError::RollInFlight);
        }
        if self.game.turn_score == 0 {
            return Err(GameError::NothingToBank);
        }

        let score = self.seat(seat).score + self.game.turn_score;
        self.seat_mut(seat).score = score;
        self.game.turn_score = 0;

        if score >= self.game.rules.target_score {
            let winner = self.seat(seat).player_id.clone();
            self.finish(MatchStatus::Completed, Some(winner.clone()), "Target score reached");
            Ok(BankOutcome::Won { winner, score })
        } else {
            self.pass_turn(seat);
            Ok(BankOutcome::Banked { score })
        }
    }

    /// Retire a live match without a winner.
    pub fn abandon(&mut self, reason: &str) -> Result<(), GameError> {
        if self.is_terminal() {
            return Err(GameError::GameOver);
        }
        self.finish(MatchStatus::Abandoned, None, reason);
        Ok(())
    }

    fn pass_turn(&mut self, from: Seat) {
        self.game.turn_score = 0;
        self.seat_mut(from).turn_active = false;
        self.seat_mut(from.other()).turn_active = true;
    }

    fn finish(&mut self, status: MatchStatus, winner: Option<PlayerId>, reason: &str) {
        self.status = status;
        self.game.game_phase = GamePhase::GameOver;
        self.game.is_rolling = false;
        self.game.winner = winner;
        self.game.game_over_reason = Some(reason.to_string());
        self.host.turn_active = false;
        self.opponent.turn_active = false;
    }
}
