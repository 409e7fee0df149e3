//! Player State Tracker.
//!
//! Guarded mutators over the player-state collection. The cached record is
//! advisory: conflict checks consult live matches first and heal records
//! that point at sessions which no longer exist.

use std::sync::Arc;

use chrono::{TimeDelta, Utc};

use crate::state::player::{
    InvalidTransition, PlayerEvent, PlayerState, PlayerStatus, SessionType,
};
use crate::store::{Store, StoreError};

/// Tracker errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackerError {
    /// Rejected transition; the string is shown to the player.
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<InvalidTransition> for TrackerError {
    fn from(err: InvalidTransition) -> Self {
        Self::Conflict(err.reason)
    }
}

/// Result of an access check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessCheck {
    pub valid: bool,
    pub reason: Option<String>,
}

impl AccessCheck {
    fn allowed() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    fn denied(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

/// Guarded access to player states.
#[derive(Debug)]
pub struct PlayerTracker {
    store: Arc<Store>,
    stale_after: TimeDelta,
}

impl PlayerTracker {
    pub fn new(store: Arc<Store>, stale_after: TimeDelta) -> Self {
        Self { store, stale_after }
    }

    async fn apply(&self, player_id: &str, event: PlayerEvent) -> Result<PlayerState, TrackerError> {
        let ((), state) = self
            .store
            .update_player(player_id, |state| {
                state.apply_mut(event).map_err(TrackerError::from)
            })
            .await?;
        Ok(state)
    }

    /// Enter the search queue. The player's own open rooms are removed
    /// first; their ids are returned so pending timers can be dropped.
    pub async fn set_searching(
        &self,
        player_id: &str,
        session_type: SessionType,
        game_mode: &str,
    ) -> Result<Vec<String>, TrackerError> {
        let event = PlayerEvent::Search {
            session_type,
            game_mode: game_mode.to_string(),
        };
        if let Some(current) = self.store.player(player_id).await? {
            current.apply(event.clone())?;
        }

        let cleared = self
            .store
            .transaction(|tx| {
                tx.remove_where(|r| r.is_open() && r.host().player_id == player_id)
                    .into_iter()
                    .map(|r| r.id)
                    .collect::<Vec<_>>()
            })
            .await?;
        if !cleared.is_empty() {
            log::debug!("[tracker {}] cleared {} leftover room(s)", player_id, cleared.len());
        }

        self.apply(player_id, event).await?;
        Ok(cleared)
    }

    /// Bind the player to a room as `waiting` or `matched`.
    pub async fn set_in_session(
        &self,
        player_id: &str,
        session_id: &str,
        session_type: SessionType,
        game_mode: &str,
        status: PlayerStatus,
    ) -> Result<PlayerState, TrackerError> {
        let ((), state) = self
            .store
            .update_player(player_id, |state| {
                state.apply_mut(PlayerEvent::EnterSession {
                    session_id: session_id.to_string(),
                    status,
                })?;
                state.current_session_type = Some(session_type);
                state.current_game_mode = Some(game_mode.to_string());
                Ok::<_, TrackerError>(())
            })
            .await?;
        Ok(state)
    }

    pub async fn set_matched(
        &self,
        player_id: &str,
        session_id: &str,
        opponent_id: &str,
    ) -> Result<PlayerState, TrackerError> {
        self.apply(
            player_id,
            PlayerEvent::OpponentFound {
                session_id: session_id.to_string(),
                opponent_id: opponent_id.to_string(),
            },
        )
        .await
    }

    /// Seat a player in a promoted match in one write, whatever stage of the
    /// pairing their record reached. Refused when the record belongs to
    /// another session or to a different search.
    pub async fn bind_to_match(
        &self,
        player_id: &str,
        session_id: &str,
        opponent_id: &str,
        session_type: SessionType,
        game_mode: &str,
    ) -> Result<PlayerState, TrackerError> {
        let ((), state) = self
            .store
            .update_player(player_id, |state| {
                let bindable = match state.session_id() {
                    Some(current) => current == session_id,
                    None => {
                        state.is_idle()
                            || (state.current_session_type == Some(session_type)
                                && state.current_game_mode.as_deref() == Some(game_mode))
                    }
                };
                if !bindable {
                    return Err(TrackerError::Conflict("Already in a game".to_string()));
                }
                let events = [
                    PlayerEvent::Release,
                    PlayerEvent::Search {
                        session_type,
                        game_mode: game_mode.to_string(),
                    },
                    PlayerEvent::OpponentFound {
                        session_id: session_id.to_string(),
                        opponent_id: opponent_id.to_string(),
                    },
                    PlayerEvent::StartPlaying {
                        session_id: session_id.to_string(),
                    },
                ];
                for event in events {
                    state.apply_mut(event)?;
                }
                Ok(())
            })
            .await?;
        Ok(state)
    }

    /// Clear every session field.
    pub async fn set_idle(&self, player_id: &str) -> Result<(), TrackerError> {
        self.apply(player_id, PlayerEvent::Release).await.map(|_| ())
    }

    /// Release a player only while they still point at `session_id`.
    pub async fn release_if_in(&self, player_id: &str, session_id: &str) -> Result<bool, StoreError> {
        let current = self.store.player(player_id).await?;
        if current.as_ref().and_then(|s| s.session_id()) != Some(session_id) {
            return Ok(false);
        }
        let (released, _) = self
            .store
            .update_player(player_id, |state| {
                if state.session_id() != Some(session_id) {
                    return Ok::<_, StoreError>(false);
                }
                *state = PlayerState::new(state.player_id.clone());
                Ok(true)
            })
            .await?;
        Ok(released)
    }

    /// Refresh `lastActivity` of a non-idle record.
    pub async fn touch(&self, player_id: &str) -> Result<(), StoreError> {
        match self.store.player(player_id).await? {
            Some(state) if !state.is_idle() => {
                self.store
                    .update_player(player_id, |state| {
                        state.touch(Utc::now());
                        Ok::<_, StoreError>(())
                    })
                    .await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Whether a session id still names a live room or match.
    pub async fn session_exists(&self, session_id: &str) -> Result<bool, StoreError> {
        if let Some(room) = self.store.room(session_id).await? {
            return Ok(!room.is_abandoned());
        }
        Ok(self
            .store
            .get_match(session_id)
            .await?
            .is_some_and(|m| !m.is_terminal()))
    }

    /// Decide whether a new request of `target` type may proceed.
    ///
    /// Live matches take precedence over the cached record. Store failures
    /// allow the request.
    pub async fn validate_session_type_access(&self, player_id: &str, target: SessionType) -> AccessCheck {
        match self.check_access(player_id, target).await {
            Ok(check) => check,
            Err(e) => {
                log::warn!("[tracker {}] access check failed open: {}", player_id, e);
                AccessCheck::allowed()
            }
        }
    }

    async fn check_access(&self, player_id: &str, target: SessionType) -> Result<AccessCheck, TrackerError> {
        if let Some(game) = self.store.active_match_for(player_id).await? {
            log::debug!("[tracker {}] still seated in match {}", player_id, game.id);
            return Ok(AccessCheck::denied("Already in a game"));
        }

        let state = match self.store.player(player_id).await? {
            Some(state) if !state.is_idle() => state,
            _ => return Ok(AccessCheck::allowed()),
        };

        if state.is_stale(Utc::now(), self.stale_after) {
            log::info!("[tracker {}] resetting stale {} state", player_id, state.status());
            self.set_idle(player_id).await?;
            return Ok(AccessCheck::allowed());
        }
        if let Some(session_id) = state.session_id() {
            if !self.session_exists(session_id).await? {
                log::info!("[tracker {}] session {} is gone, resetting", player_id, session_id);
                self.set_idle(player_id).await?;
                return Ok(AccessCheck::allowed());
            }
        }

        let same_type = state.current_session_type.map_or(true, |t| t == target);
        Ok(match state.status() {
            PlayerStatus::Idle => AccessCheck::allowed(),
            PlayerStatus::Searching | PlayerStatus::Waiting if same_type => AccessCheck::allowed(),
            PlayerStatus::Searching => AccessCheck::denied(format!(
                "Already searching for a {} match",
                state.current_session_type.unwrap_or(target)
            )),
            PlayerStatus::Waiting => AccessCheck::denied("Already waiting for an opponent"),
            PlayerStatus::Matched | PlayerStatus::Playing => AccessCheck::denied("Already in a game"),
        })
    }

    /// Force idle on every record inactive for longer than `threshold`.
    pub async fn cleanup_stale_states(&self, threshold: TimeDelta) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut cleaned = 0;
        for state in self.store.players().await? {
            if !state.is_stale(now, threshold) {
                continue;
            }
            let (reset, _) = self
                .store
                .update_player(&state.player_id, |current| {
                    if !current.is_stale(now, threshold) {
                        return Ok::<_, StoreError>(false);
                    }
                    *current = PlayerState::new(current.player_id.clone());
                    Ok(true)
                })
                .await?;
            if reset {
                cleaned += 1;
            }
        }
        if cleaned > 0 {
            log::info!("[tracker] reset {} stale player state(s)", cleaned);
        }
        Ok(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::game::{DiceRules, Match, Seat};
    use crate::state::room::{Participant, WaitingRoom};
    use pretty_assertions::assert_eq;

    fn tracker() -> (Arc<Store>, PlayerTracker) {
        let store = Arc::new(Store::default());
        let tracker = PlayerTracker::new(store.clone(), TimeDelta::minutes(30));
        (store, tracker)
    }

    async fn open_room(store: &Store, host: &str) -> String {
        let room = WaitingRoom::open("classic", SessionType::Quick, Participant::human(host, host));
        let id = room.id.clone();
        store.transaction(|tx| tx.insert(room.clone())).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_search_then_wait() {
        let (store, tracker) = tracker();
        tracker
            .set_searching("p1", SessionType::Quick, "classic")
            .await
            .unwrap();
        let room_id = open_room(&store, "p1").await;
        let state = tracker
            .set_in_session("p1", &room_id, SessionType::Quick, "classic", PlayerStatus::Waiting)
            .await
            .unwrap();

        assert_eq!(state.status(), PlayerStatus::Waiting);
        assert!(state.is_in_queue);
        assert_eq!(state.current_game_mode.as_deref(), Some("classic"));
    }

    #[tokio::test]
    async fn test_search_clears_own_open_rooms() {
        let (store, tracker) = tracker();
        let leftover = open_room(&store, "p1").await;
        open_room(&store, "p2").await;

        let cleared = tracker
            .set_searching("p1", SessionType::Quick, "classic")
            .await
            .unwrap();
        assert_eq!(cleared, vec![leftover]);
        assert_eq!(store.rooms().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_search_conflict_leaves_rooms() {
        let (store, tracker) = tracker();
        tracker
            .set_searching("p1", SessionType::Quick, "classic")
            .await
            .unwrap();
        let room_id = open_room(&store, "p1").await;
        tracker
            .set_in_session("p1", &room_id, SessionType::Quick, "classic", PlayerStatus::Waiting)
            .await
            .unwrap();

        let err = tracker
            .set_searching("p1", SessionType::Ranked, "classic")
            .await
            .unwrap_err();
        assert_eq!(err, TrackerError::Conflict("Already waiting for an opponent".to_string()));
        assert_eq!(store.rooms().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_access_prefers_live_match() {
        let (store, tracker) = tracker();
        let mut room = WaitingRoom::open("classic", SessionType::Quick, Participant::human("p1", "P1"));
        room.fill(Participant::human("p2", "P2")).unwrap();
        store
            .insert_match(Match::from_room(&room, DiceRules::default(), Seat::Host).unwrap())
            .await
            .unwrap();

        // Cached record says idle but the match is live
        let check = tracker.validate_session_type_access("p2", SessionType::Quick).await;
        assert_eq!(check, AccessCheck::denied("Already in a game"));
    }

    #[tokio::test]
    async fn test_access_different_type_while_searching() {
        let (_store, tracker) = tracker();
        tracker
            .set_searching("p1", SessionType::Quick, "classic")
            .await
            .unwrap();

        let check = tracker.validate_session_type_access("p1", SessionType::Ranked).await;
        assert!(!check.valid);
        assert_eq!(check.reason.as_deref(), Some("Already searching for a quick match"));
        assert!(tracker.validate_session_type_access("p1", SessionType::Quick).await.valid);
    }

    #[tokio::test]
    async fn test_access_heals_missing_session() {
        let (store, tracker) = tracker();
        tracker
            .set_searching("p1", SessionType::Quick, "classic")
            .await
            .unwrap();
        tracker
            .set_matched("p1", "gone-room", "p2")
            .await
            .unwrap();

        let check = tracker.validate_session_type_access("p1", SessionType::Quick).await;
        assert!(check.valid);
        assert!(store.player("p1").await.unwrap().unwrap().is_idle());
    }

    #[tokio::test]
    async fn test_access_heals_stale_state() {
        let (store, tracker) = tracker();
        let room_id = open_room(&store, "p1").await;
        let mut state = PlayerState::new("p1");
        state.current_status = PlayerStatus::Waiting;
        state.current_session_id = Some(room_id);
        state.current_session_type = Some(SessionType::Ranked);
        state.last_activity = Utc::now() - TimeDelta::minutes(31);
        store.put_player(state).await.unwrap();

        let check = tracker.validate_session_type_access("p1", SessionType::Quick).await;
        assert!(check.valid);
        assert!(store.player("p1").await.unwrap().unwrap().is_idle());
    }

    #[tokio::test]
    async fn test_access_fails_open() {
        let (store, tracker) = tracker();
        store.set_online(false);
        let check = tracker.validate_session_type_access("p1", SessionType::Quick).await;
        assert!(check.valid);
    }

    #[tokio::test]
    async fn test_release_if_in() {
        let (_store, tracker) = tracker();
        tracker
            .set_searching("p1", SessionType::Quick, "classic")
            .await
            .unwrap();
        tracker.set_matched("p1", "room-a", "p2").await.unwrap();

        assert!(!tracker.release_if_in("p1", "room-b").await.unwrap());
        assert!(tracker.release_if_in("p1", "room-a").await.unwrap());
        assert!(!tracker.release_if_in("p1", "room-a").await.unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_stale_states() {
        let (store, tracker) = tracker();
        let mut old = PlayerState::new("old");
        old.current_status = PlayerStatus::Searching;
        old.last_activity = Utc::now() - TimeDelta::hours(2);
        store.put_player(old).await.unwrap();
        tracker
            .set_searching("fresh", SessionType::Quick, "classic")
            .await
            .unwrap();

        let cleaned = tracker.cleanup_stale_states(TimeDelta::minutes(30)).await.unwrap();
        assert_eq!(cleaned, 1);
        assert!(store.player("old").await.unwrap().unwrap().is_idle());
        assert!(!store.player("fresh").await.unwrap().unwrap().is_idle());
    }

    #[tokio::test]
    async fn test_bind_to_match() {
        let (store, tracker) = tracker();
        // Idle after a cancelled search
        tracker
            .bind_to_match("p1", "m1", "p2", SessionType::Quick, "classic")
            .await
            .unwrap();
        let state = store.player("p1").await.unwrap().unwrap();
        assert_eq!(state.status(), PlayerStatus::Playing);
        assert_eq!(state.session_id(), Some("m1"));
        assert_eq!(state.opponent_id.as_deref(), Some("p2"));

        // Still searching the same queue
        tracker
            .set_searching("p2", SessionType::Quick, "classic")
            .await
            .unwrap();
        tracker
            .bind_to_match("p2", "m1", "p1", SessionType::Quick, "classic")
            .await
            .unwrap();
        assert_eq!(store.player("p2").await.unwrap().unwrap().status(), PlayerStatus::Playing);

        // Busy elsewhere
        tracker
            .set_searching("p3", SessionType::Quick, "blitz")
            .await
            .unwrap();
        let err = tracker
            .bind_to_match("p3", "m1", "p1", SessionType::Quick, "classic")
            .await
            .unwrap_err();
        assert_eq!(err, TrackerError::Conflict("Already in a game".to_string()));
        let err = tracker
            .bind_to_match("p1", "m2", "p4", SessionType::Quick, "classic")
            .await
            .unwrap_err();
        assert_eq!(err, TrackerError::Conflict("Already in a game".to_string()));
        assert_eq!(store.player("p1").await.unwrap().unwrap().session_id(), Some("m1"));
    }
}
