//! Waiting room state.
//!
//! A waiting room is the transient pairing record behind one open seek. It
//! holds the host until a second participant (human or bot) fills it, after
//! which it is promoted into a [`Match`](super::game::Match) carrying the same id.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::player::{PlayerId, SessionId, SessionType};

/// Aggregate stats snapshot shown next to a participant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerStats {
    pub games_played: u32,
    pub wins: u32,
    pub losses: u32,
}

/// Bot personality parameters consumed by the bot strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Personality {
    pub name: String,
    /// Turn score at which the bot prefers to bank.
    pub bank_threshold: u32,
    /// 0.0 plays it safe, 1.0 keeps rolling when behind.
    pub risk_appetite: f32,
}

impl Personality {
    pub fn cautious() -> Self {
        Self {
            name: "cautious".to_string(),
            bank_threshold: 12,
            risk_appetite: 0.2,
        }
    }

    pub fn balanced() -> Self {
        Self {
            name: "balanced".to_string(),
            bank_threshold: 20,
            risk_appetite: 0.5,
        }
    }

    pub fn reckless() -> Self {
        Self {
            name: "reckless".to_string(),
            bank_threshold: 30,
            risk_appetite: 0.9,
        }
    }
}

impl Default for Personality {
    fn default() -> Self {
        Self::balanced()
    }
}

/// Who drives a seat.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Controller {
    #[default]
    Human,
    Bot { personality: Personality },
}

impl Controller {
    pub fn is_bot(&self) -> bool {
        matches!(self, Self::Bot { .. })
    }
}

/// Identity and display snapshot of a participant, taken when the room is
/// created or joined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub player_id: PlayerId,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub stats: PlayerStats,
    pub controller: Controller,
}

impl Participant {
    pub fn human(player_id: impl Into<PlayerId>, display_name: impl Into<String>) -> Self {
        Self {
            player_id: player_id.into(),
            display_name: display_name.into(),
            avatar_url: None,
            stats: PlayerStats::default(),
            controller: Controller::Human,
        }
    }

    pub fn bot(
        player_id: impl Into<PlayerId>,
        display_name: impl Into<String>,
        personality: Personality,
    ) -> Self {
        Self {
            player_id: player_id.into(),
            display_name: display_name.into(),
            avatar_url: None,
            stats: PlayerStats::default(),
            controller: Controller::Bot { personality },
        }
    }

    pub fn is_bot(&self) -> bool {
        self.controller.is_bot()
    }
}

/// Pairing state of a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum RoomState {
    /// Waiting for an opponent; visible to the allocator.
    Open { host: Participant },
    /// Both seats taken; awaiting promotion.
    Full {
        host: Participant,
        opponent: Participant,
    },
    /// Retired by the reaper; kept for statistics.
    Abandoned {
        host: Participant,
        opponent: Option<Participant>,
    },
}

impl RoomState {
    pub fn host(&self) -> &Participant {
        match self {
            Self::Open { host } | Self::Full { host, .. } | Self::Abandoned { host, .. } => host,
        }
    }

    pub fn opponent(&self) -> Option<&Participant> {
        match self {
            Self::Open { .. } => None,
            Self::Full { opponent, .. } => Some(opponent),
            Self::Abandoned { opponent, .. } => opponent.as_ref(),
        }
    }

    pub fn players_required(&self) -> u8 {
        match self {
            Self::Open { .. } => 1,
            Self::Full { .. } | Self::Abandoned { .. } => 0,
        }
    }
}

/// Room errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    #[error("Room is full")]
    Full,
    #[error("Cannot join your own room")]
    OwnRoom,
    #[error("Room is no longer open")]
    NotOpen,
}

/// Waiting room document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitingRoom {
    /// Unique room id, reused as the match id on promotion
    pub id: SessionId,

    pub game_mode: String,

    pub session_type: SessionType,

    pub state: RoomState,

    /// Set once promotion into a match has begun
    pub promoted_to: Option<SessionId>,

    pub created_at: DateTime<Utc>,
}

impl WaitingRoom {
    /// Create a new open room hosted by `host`.
    pub fn open(game_mode: impl Into<String>, session_type: SessionType, host: Participant) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            game_mode: game_mode.into(),
            session_type,
            state: RoomState::Open { host },
            promoted_to: None,
            created_at: Utc::now(),
        }
    }

    pub fn host(&self) -> &Participant {
        self.state.host()
    }

    pub fn opponent(&self) -> Option<&Participant> {
        self.state.opponent()
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, RoomState::Open { .. })
    }

    pub fn is_full(&self) -> bool {
        matches!(self.state, RoomState::Full { .. })
    }

    pub fn is_abandoned(&self) -> bool {
        matches!(self.state, RoomState::Abandoned { .. })
    }

    pub fn players_required(&self) -> u8 {
        self.state.players_required()
    }

    /// Check if the player holds either seat.
    pub fn has_participant(&self, player_id: &str) -> bool {
        self.host().player_id == player_id
            || self.opponent().is_some_and(|o| o.player_id == player_id)
    }

    /// Ids of both seats that are taken.
    pub fn participant_ids(&self) -> Vec<PlayerId> {
        std::iter::once(self.host())
            .chain(self.opponent())
            .map(|p| p.player_id.clone())
            .collect()
    }

    /// Seat an opponent, closing the room.
    pub fn fill(&mut self, opponent: Participant) -> Result<(), RoomError> {
        let host = match &self.state {
            RoomState::Open { host } => host.clone(),
            RoomState::Full { .. } => return Err(RoomError::Full),
            RoomState::Abandoned { .. } => return Err(RoomError::NotOpen),
        };
        if host.player_id == opponent.player_id {
            return Err(RoomError::OwnRoom);
        }
        self.state = RoomState::Full { host, opponent };
        Ok(())
    }

    /// Retire the room, keeping whoever was seated.
    pub fn abandon(&mut self) {
        let host = self.host().clone();
        let opponent = self.opponent().cloned();
        self.state = RoomState::Abandoned { host, opponent };
    }

    /// Flat store document.
    ///
    /// `opponentData` is absent, not null, while the room is open.
    pub fn to_document(&self) -> serde_json::Value {
        let mut doc = serde_json::json!({
            "id": self.id,
            "gameMode": self.game_mode,
            "sessionType": self.session_type.as_str(),
            "hostData": participant_json(self.host()),
            "playersRequired": self.players_required(),
            "createdAt": self.created_at.to_rfc3339(),
        });
        if let Some(opponent) = self.opponent() {
            doc["opponentData"] = participant_json(opponent);
        }
        if self.is_abandoned() {
            doc["status"] = serde_json::json!("abandoned");
        }
        doc
    }
}

fn participant_json(p: &Participant) -> serde_json::Value {
    serde_json::json!({
        "playerId": p.player_id,
        "displayName": p.display_name,
        "avatarUrl": p.avatar_url,
        "isBot": p.is_bot(),
        "stats": {
            "gamesPlayed": p.stats.games_played,
            "wins": p.stats.wins,
            "losses": p.stats.losses
        }
    })
}

impl fmt::Display for WaitingRoom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "room {} ({}/{}, host {}, needs {})",
            self.id,
            self.session_type,
            self.game_mode,
            self.host().player_id,
            self.players_required()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_room(host: &str) -> WaitingRoom {
        WaitingRoom::open("classic", SessionType::Quick, Participant::human(host, host))
    }

    #[test]
    fn test_room_new() {
        let room = open_room("p1");
        assert!(room.is_open());
        assert_eq!(room.players_required(), 1);
        assert!(room.opponent().is_none());
        assert!(room.has_participant("p1"));
    }

    #[test]
    fn test_room_fill() {
        let mut room = open_room("p1");
        room.fill(Participant::human("p2", "P2")).unwrap();

        assert!(room.is_full());
        assert_eq!(room.players_required(), 0);
        assert_eq!(room.opponent().unwrap().player_id, "p2");
        assert_eq!(room.participant_ids(), vec!["p1".to_string(), "p2".to_string()]);
    }

    #[test]
    fn test_room_fill_rejections() {
        let mut room = open_room("p1");
        assert_eq!(
            room.fill(Participant::human("p1", "P1")),
            Err(RoomError::OwnRoom)
        );

        room.fill(Participant::human("p2", "P2")).unwrap();
        assert_eq!(room.fill(Participant::human("p3", "P3")), Err(RoomError::Full));

        room.abandon();
        assert_eq!(
            room.fill(Participant::human("p3", "P3")),
            Err(RoomError::NotOpen)
        );
    }

    #[test]
    fn test_abandon_keeps_participants() {
        let mut room = open_room("p1");
        room.fill(Participant::bot("bot-1", "Bot", Personality::cautious()))
            .unwrap();
        room.abandon();

        assert!(room.is_abandoned());
        assert_eq!(room.players_required(), 0);
        assert!(room.opponent().unwrap().is_bot());
    }

    #[test]
    fn test_document_omits_opponent_while_open() {
        let mut room = open_room("p1");
        let doc = room.to_document();
        assert_eq!(doc["playersRequired"], 1);
        assert!(doc.get("opponentData").is_none());

        room.fill(Participant::human("p2", "P2")).unwrap();
        let doc = room.to_document();
        assert_eq!(doc["playersRequired"], 0);
        assert_eq!(doc["opponentData"]["playerId"], "p2");
    }
}
