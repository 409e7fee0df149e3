//! Match Rules Engine service.
//!
//! Draws dice, applies the pure transitions in [`crate::state::game`] as
//! atomic single-document updates, and runs completion side effects. Human
//! clients and bots both reach a match only through [`MatchEngine::submit`].

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::MatchmakingConfig;
use crate::profile::ProfileService;
use crate::state::game::{BankOutcome, DieSlot, GameError, Match, MatchStatus, Parity, RollOutcome};
use crate::state::player::SessionId;
use crate::store::{Store, StoreError};
use crate::tracker::PlayerTracker;

/// Source of die faces.
pub trait DiceSource: Send + Sync {
    /// A value in `1..=faces`.
    fn roll(&self, faces: u8) -> u8;

    /// Fair coin, used to pick who calls the turn decider.
    fn coin(&self) -> bool;
}

/// Thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomDice;

impl DiceSource for RandomDice {
    fn roll(&self, faces: u8) -> u8 {
        rand::rng().random_range(1..=faces.max(1))
    }

    fn coin(&self) -> bool {
        rand::rng().random_bool(0.5)
    }
}

/// Replays queued values, then falls back to random draws.
#[derive(Debug, Default)]
pub struct ScriptedDice {
    faces: Mutex<VecDeque<u8>>,
    coins: Mutex<VecDeque<bool>>,
}

impl ScriptedDice {
    pub fn new(faces: impl IntoIterator<Item = u8>) -> Self {
        Self {
            faces: Mutex::new(faces.into_iter().collect()),
            coins: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_coins(self, coins: impl IntoIterator<Item = bool>) -> Self {
        self.coins
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(coins);
        self
    }

    pub fn push(&self, faces: impl IntoIterator<Item = u8>) {
        self.faces
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(faces);
    }
}

impl DiceSource for ScriptedDice {
    fn roll(&self, faces: u8) -> u8 {
        let next = self
            .faces
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        next.unwrap_or_else(|| RandomDice.roll(faces))
    }

    fn coin(&self) -> bool {
        let next = self
            .coins
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        next.unwrap_or_else(|| RandomDice.coin())
    }
}

/// Player action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Action {
    Roll,
    Bank,
    ChooseParity { value: Parity },
}

/// Action errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    #[error(transparent)]
    Rejected(#[from] GameError),
    #[error("Match {0} not found")]
    UnknownMatch(SessionId),
    #[error("store error: {0}")]
    Store(StoreError),
    #[error("Action was interrupted")]
    Interrupted,
}

impl From<StoreError> for ActionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::UnknownMatch(id),
            other => Self::Store(other),
        }
    }
}

const SETTLE_BACKOFF_MIN: Duration = Duration::from_millis(250);
const SETTLE_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Run an action on its own task so dropping the caller cannot cut it short.
async fn detached<T, Fut>(action: Fut) -> Result<T, ActionError>
where
    T: Send + 'static,
    Fut: Future<Output = Result<T, ActionError>> + Send + 'static,
{
    match tokio::spawn(action).await {
        Ok(result) => result,
        Err(e) => {
            log::error!("[engine] action task failed: {}", e);
            Err(ActionError::Interrupted)
        }
    }
}

/// Rules engine over the store.
pub struct MatchEngine {
    store: Arc<Store>,
    tracker: Arc<PlayerTracker>,
    profiles: Arc<dyn ProfileService>,
    dice: Arc<dyn DiceSource>,
    roll_stage: Duration,
    decider_reveal: Duration,
}

impl MatchEngine {
    pub fn new(
        store: Arc<Store>,
        tracker: Arc<PlayerTracker>,
        profiles: Arc<dyn ProfileService>,
        dice: Arc<dyn DiceSource>,
        config: &MatchmakingConfig,
    ) -> Self {
        Self {
            store,
            tracker,
            profiles,
            dice,
            roll_stage: config.roll_stage(),
            decider_reveal: config.decider_reveal(),
        }
    }

    pub fn dice(&self) -> &Arc<dyn DiceSource> {
        &self.dice
    }

    async fn update<T>(
        &self,
        match_id: &str,
        f: impl FnOnce(&mut Match) -> Result<T, GameError>,
    ) -> Result<(T, Match), ActionError> {
        self.store
            .update_match(match_id, |m| f(m).map_err(ActionError::from))
            .await
    }

    /// Apply an action for `player_id`.
    pub async fn submit(
        self: &Arc<Self>,
        match_id: &str,
        player_id: &str,
        action: Action,
    ) -> Result<Match, ActionError> {
        match action {
            Action::Roll => self.roll_dice(match_id, player_id).await.map(|(_, m)| m),
            Action::Bank => self.bank_score(match_id, player_id).await.map(|(_, m)| m),
            Action::ChooseParity { value } => self.choose_parity(match_id, player_id, value).await,
        }
    }

    /// Record the chooser's call, then reveal the decider die.
    ///
    /// Runs on its own task: once the call is committed the decider always
    /// resolves, even if the caller goes away.
    pub async fn choose_parity(
        self: &Arc<Self>,
        match_id: &str,
        player_id: &str,
        choice: Parity,
    ) -> Result<Match, ActionError> {
        let this = Arc::clone(self);
        let (match_id, player_id) = (match_id.to_string(), player_id.to_string());
        detached(async move { this.staged_call(&match_id, &player_id, choice).await }).await
    }

    async fn staged_call(&self, match_id: &str, player_id: &str, choice: Parity) -> Result<Match, ActionError> {
        let ((), game) = self
            .update(match_id, |m| m.choose_parity(player_id, choice))
            .await?;
        let value = self.dice.roll(game.game.rules.die_faces);
        log::debug!("[match {}] {} calls {:?}", match_id, player_id, choice);

        tokio::time::sleep(self.decider_reveal).await;
        let (first, game) = self
            .settle(match_id, |m| m.resolve_turn_decider(value))
            .await?;
        log::info!(
            "[match {}] decider rolled {}, {} goes first",
            match_id,
            value,
            game.seat(first).player_id
        );
        Ok(game)
    }

    /// Roll both dice for the active player, exposing each die as it lands.
    ///
    /// Runs on its own task: once the roll has started it always settles,
    /// even if the caller goes away.
    pub async fn roll_dice(
        self: &Arc<Self>,
        match_id: &str,
        player_id: &str,
    ) -> Result<(RollOutcome, Match), ActionError> {
        let this = Arc::clone(self);
        let (match_id, player_id) = (match_id.to_string(), player_id.to_string());
        detached(async move { this.staged_roll(&match_id, &player_id).await }).await
    }

    async fn staged_roll(&self, match_id: &str, player_id: &str) -> Result<(RollOutcome, Match), ActionError> {
        let (_, game) = self.update(match_id, |m| m.begin_roll(player_id)).await?;
        let faces = game.game.rules.die_faces;
        let (first, second) = (self.dice.roll(faces), self.dice.roll(faces));

        self.publish(match_id, |m| m.reveal_die(DieSlot::First, first))
            .await;
        tokio::time::sleep(self.roll_stage).await;
        self.publish(match_id, |m| m.reveal_die(DieSlot::Second, second))
            .await;
        tokio::time::sleep(self.roll_stage).await;

        let (outcome, game) = self
            .settle(match_id, |m| m.settle_roll(first, second))
            .await?;
        log::debug!(
            "[match {}] {} rolled ({}, {}): {:?}",
            match_id,
            player_id,
            first,
            second,
            outcome
        );
        Ok((outcome, game))
    }

    /// Write an intermediate reveal. Failures only cost the animation.
    async fn publish(&self, match_id: &str, f: impl FnOnce(&mut Match) -> Result<(), GameError>) {
        if let Err(e) = self.update(match_id, f).await {
            log::debug!("[match {}] reveal not published: {}", match_id, e);
        }
    }

    /// Write the step that closes an action in flight, retrying while the
    /// store is failing.
    async fn settle<T>(
        &self,
        match_id: &str,
        f: impl Fn(&mut Match) -> Result<T, GameError>,
    ) -> Result<(T, Match), ActionError> {
        let mut backoff = SETTLE_BACKOFF_MIN;
        loop {
            match self.update(match_id, &f).await {
                Err(ActionError::Store(e)) => {
                    log::warn!("[match {}] settle failed, retrying in {:?}: {}", match_id, backoff, e);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(SETTLE_BACKOFF_MAX);
                }
                result => return result,
            }
        }
    }

    /// Commit the turn score. Completes the match when the target is reached.
    pub async fn bank_score(
        self: &Arc<Self>,
        match_id: &str,
        player_id: &str,
    ) -> Result<(BankOutcome, Match), ActionError> {
        let this = Arc::clone(self);
        let (match_id, player_id) = (match_id.to_string(), player_id.to_string());
        detached(async move { this.commit_bank(&match_id, &player_id).await }).await
    }

    async fn commit_bank(&self, match_id: &str, player_id: &str) -> Result<(BankOutcome, Match), ActionError> {
        let (outcome, game) = self.update(match_id, |m| m.bank(player_id)).await?;
        match &outcome {
            BankOutcome::Banked { score } => {
                log::debug!("[match {}] {} banked to {}", match_id, player_id, score);
            }
            BankOutcome::Won { winner, score } => {
                log::info!("[match {}] {} wins with {}", match_id, winner, score);
                self.on_finished(&game).await;
            }
        }
        Ok((outcome, game))
    }

    /// Retire a live match without a winner.
    pub async fn abandon(&self, match_id: &str, reason: &str) -> Result<Match, ActionError> {
        let ((), game) = self.update(match_id, |m| m.abandon(reason)).await?;
        log::info!("[match {}] abandoned: {}", match_id, reason);
        self.on_finished(&game).await;
        Ok(game)
    }

    /// Stats and player release for a terminal match.
    async fn on_finished(&self, game: &Match) {
        for seat in game.seats() {
            if seat.is_bot() {
                continue;
            }
            let player_id = seat.player_id.as_str();
            if game.status == MatchStatus::Completed {
                if game.game.winner.as_deref() == Some(player_id) {
                    self.profiles.record_match_win(player_id).await;
                } else {
                    self.profiles.record_match_loss(player_id).await;
                }
            }
            self.profiles.record_game_played(player_id).await;

            if let Err(e) = self.tracker.release_if_in(player_id, &game.id).await {
                log::warn!("[match {}] failed to release {}: {}", game.id, player_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::MemoryProfiles;
    use crate::state::game::{DiceRules, GamePhase, Seat};
    use crate::state::player::{PlayerStatus, SessionType};
    use crate::state::room::{Participant, PlayerStats, WaitingRoom};
    use chrono::TimeDelta;
    use pretty_assertions::assert_eq;

    struct Harness {
        store: Arc<Store>,
        profiles: Arc<MemoryProfiles>,
        dice: Arc<ScriptedDice>,
        engine: Arc<MatchEngine>,
        match_id: String,
    }

    /// Human match p1 (host, chooser) vs p2, both playing.
    async fn harness(config: MatchmakingConfig) -> Harness {
        let store = Arc::new(Store::default());
        let tracker = Arc::new(PlayerTracker::new(store.clone(), TimeDelta::minutes(30)));
        let profiles = Arc::new(MemoryProfiles::new());
        profiles.register("p1", "Alice", None);
        profiles.register("p2", "Bob", None);
        let dice = Arc::new(ScriptedDice::default());
        let engine = Arc::new(MatchEngine::new(
            store.clone(),
            tracker.clone(),
            profiles.clone(),
            dice.clone(),
            &config,
        ));

        let mut room = WaitingRoom::open("classic", SessionType::Quick, Participant::human("p1", "Alice"));
        room.fill(Participant::human("p2", "Bob")).unwrap();
        let game = Match::from_room(&room, DiceRules::default(), Seat::Host).unwrap();
        let match_id = game.id.clone();
        store.insert_match(game).await.unwrap();
        for (player, opponent) in [("p1", "p2"), ("p2", "p1")] {
            tracker
                .bind_to_match(player, &match_id, opponent, SessionType::Quick, "classic")
                .await
                .unwrap();
        }

        Harness {
            store,
            profiles,
            dice,
            engine,
            match_id,
        }
    }

    /// p1 calls odd, decider shows 3, p1 opens.
    async fn start(h: &Harness) {
        h.dice.push([3]);
        h.engine
            .submit(&h.match_id, "p1", Action::ChooseParity { value: Parity::Odd })
            .await
            .unwrap();
    }

    async fn roll(h: &Harness, player: &str, a: u8, b: u8) -> RollOutcome {
        h.dice.push([a, b]);
        h.engine.roll_dice(&h.match_id, player).await.unwrap().0
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_decider_through_engine() {
        let h = harness(MatchmakingConfig::default()).await;
        h.dice.push([4]);
        let game = h
            .engine
            .choose_parity(&h.match_id, "p1", Parity::Odd)
            .await
            .unwrap();

        assert_eq!(game.phase(), GamePhase::Gameplay);
        assert_eq!(game.game.dice_one, Some(4));
        assert_eq!(game.active_seat(), Some(Seat::Opponent));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bust_then_wipeout_then_bank() {
        let h = harness(MatchmakingConfig::instant()).await;
        start(&h).await;

        // p1 busts on a single one
        assert_eq!(roll(&h, "p1", 1, 3).await, RollOutcome::Bust);

        // p2 banks 5
        assert_eq!(roll(&h, "p2", 2, 3).await, RollOutcome::Points(5));
        h.engine.bank_score(&h.match_id, "p2").await.unwrap();

        // p1 banks 4
        roll(&h, "p1", 2, 2).await;
        h.engine.bank_score(&h.match_id, "p1").await.unwrap();

        // p2 wipes out their banked 5
        assert_eq!(roll(&h, "p2", 6, 6).await, RollOutcome::Wipeout);
        let game = h.store.get_match(&h.match_id).await.unwrap().unwrap();
        assert_eq!(game.opponent.score, 0);
        assert_eq!(game.host.score, 4);
        assert_eq!(game.active_seat(), Some(Seat::Host));
        assert_eq!(game.game.turn_score, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejections_leave_match_untouched() {
        let h = harness(MatchmakingConfig::instant()).await;
        start(&h).await;
        let before = h.store.get_match(&h.match_id).await.unwrap().unwrap();

        let err = h.engine.submit(&h.match_id, "p2", Action::Roll).await.unwrap_err();
        assert_eq!(err, ActionError::Rejected(GameError::NotYourTurn));
        assert_eq!(err.to_string(), "It's not your turn");

        let err = h.engine.submit(&h.match_id, "p1", Action::Bank).await.unwrap_err();
        assert_eq!(err, ActionError::Rejected(GameError::NothingToBank));

        let after = h.store.get_match(&h.match_id).await.unwrap().unwrap();
        assert_eq!(after, before);

        let err = h.engine.submit("missing", "p1", Action::Roll).await.unwrap_err();
        assert_eq!(err, ActionError::UnknownMatch("missing".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_staged_reveal_is_observable() {
        let h = harness(MatchmakingConfig::default()).await;
        start(&h).await;
        let mut feed = h.store.subscribe(&h.match_id).await.unwrap().unwrap();
        feed.borrow_and_update();

        h.dice.push([4, 5]);
        let store = h.store.clone();
        let engine = h.engine.clone();
        let match_id = h.match_id.clone();
        let roller = {
            let engine = engine.clone();
            let match_id = match_id.clone();
            tokio::spawn(async move { engine.roll_dice(&match_id, "p1").await })
        };

        let mut saw_half_roll = false;
        while feed.changed().await.is_ok() {
            let snapshot = feed.borrow_and_update().clone();
            if snapshot.game.is_rolling
                && snapshot.game.dice_one == Some(4)
                && snapshot.game.dice_two.is_none()
            {
                saw_half_roll = true;
            }
            if !snapshot.game.is_rolling {
                break;
            }
        }
        roller.await.unwrap().unwrap();

        assert!(saw_half_roll);
        let game = store.get_match(&match_id).await.unwrap().unwrap();
        assert_eq!(game.game.turn_score, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_win_records_stats_and_releases() {
        let h = harness(MatchmakingConfig::instant()).await;
        start(&h).await;
        h.store
            .update_match::<_, StoreError, _>(&h.match_id, |m| {
                m.host.score = 95;
                Ok(())
            })
            .await
            .unwrap();

        roll(&h, "p1", 3, 4).await;
        let (outcome, game) = h.engine.bank_score(&h.match_id, "p1").await.unwrap();
        assert_eq!(
            outcome,
            BankOutcome::Won {
                winner: "p1".to_string(),
                score: 102
            }
        );
        assert_eq!(game.status, MatchStatus::Completed);

        assert_eq!(
            h.profiles.stats("p1").unwrap(),
            PlayerStats {
                games_played: 1,
                wins: 1,
                losses: 0
            }
        );
        assert_eq!(h.profiles.stats("p2").unwrap().losses, 1);
        for player in ["p1", "p2"] {
            let state = h.store.player(player).await.unwrap().unwrap();
            assert_eq!(state.status(), PlayerStatus::Idle);
        }

        let err = h.engine.submit(&h.match_id, "p2", Action::Roll).await.unwrap_err();
        assert_eq!(err, ActionError::Rejected(GameError::GameOver));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandon_releases_without_result() {
        let h = harness(MatchmakingConfig::instant()).await;
        let game = h
            .engine
            .abandon(&h.match_id, "All players disconnected")
            .await
            .unwrap();

        assert_eq!(game.status, MatchStatus::Abandoned);
        assert_eq!(game.game.game_over_reason.as_deref(), Some("All players disconnected"));
        let stats = h.profiles.stats("p1").unwrap();
        assert_eq!((stats.games_played, stats.wins, stats.losses), (1, 0, 0));
        assert!(h.store.player("p2").await.unwrap().unwrap().is_idle());

        let err = h.engine.abandon(&h.match_id, "again").await.unwrap_err();
        assert_eq!(err, ActionError::Rejected(GameError::GameOver));
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_outage_fails_closed() {
        let h = harness(MatchmakingConfig::instant()).await;
        h.store.set_online(false);
        let err = h
            .engine
            .submit(&h.match_id, "p1", Action::ChooseParity { value: Parity::Even })
            .await
            .unwrap_err();
        assert_eq!(err, ActionError::Store(StoreError::Unavailable));

        h.store.set_online(true);
        let game = h.store.get_match(&h.match_id).await.unwrap().unwrap();
        assert_eq!(game.game.turn_decider_choice, None);
    }

    /// Take the store offline 100ms from now for `outage`.
    async fn outage(store: Arc<Store>, outage: Duration) {
        tokio::time::sleep(Duration::from_millis(100)).await;
        store.set_online(false);
        tokio::time::sleep(outage).await;
        store.set_online(true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_roll_settles_after_outage() {
        let h = harness(MatchmakingConfig::default()).await;
        start(&h).await;

        h.dice.push([4, 5]);
        let (result, ()) = tokio::join!(
            h.engine.roll_dice(&h.match_id, "p1"),
            outage(h.store.clone(), Duration::from_secs(10)),
        );
        let (outcome, game) = result.unwrap();
        assert_eq!(outcome, RollOutcome::Points(9));
        assert!(!game.game.is_rolling);
        assert_eq!(game.game.turn_score, 9);
        assert_eq!(game.active_seat(), Some(Seat::Host));

        let (outcome, _) = h.engine.bank_score(&h.match_id, "p1").await.unwrap();
        assert_eq!(outcome, BankOutcome::Banked { score: 9 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_roll_still_settles() {
        let h = harness(MatchmakingConfig::default()).await;
        start(&h).await;

        h.dice.push([2, 3]);
        let roller = {
            let engine = h.engine.clone();
            let match_id = h.match_id.clone();
            tokio::spawn(async move { engine.roll_dice(&match_id, "p1").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        roller.abort();

        tokio::time::sleep(Duration::from_secs(5)).await;
        let game = h.store.get_match(&h.match_id).await.unwrap().unwrap();
        assert!(!game.game.is_rolling);
        assert_eq!((game.game.dice_one, game.game.dice_two), (Some(2), Some(3)));
        assert_eq!(game.game.turn_score, 5);
        h.engine.roll_dice(&h.match_id, "p1").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_decider_resolves_after_outage() {
        let h = harness(MatchmakingConfig::default()).await;
        h.dice.push([3]);
        let (result, ()) = tokio::join!(
            h.engine.choose_parity(&h.match_id, "p1", Parity::Odd),
            outage(h.store.clone(), Duration::from_secs(5)),
        );

        let game = result.unwrap();
        assert_eq!(game.phase(), GamePhase::Gameplay);
        assert!(!game.game.is_rolling);
        assert_eq!(game.active_seat(), Some(Seat::Host));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_call_still_resolves() {
        let h = harness(MatchmakingConfig::default()).await;
        h.dice.push([4]);
        let caller = {
            let engine = h.engine.clone();
            let match_id = h.match_id.clone();
            tokio::spawn(async move { engine.choose_parity(&match_id, "p1", Parity::Odd).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        caller.abort();

        tokio::time::sleep(Duration::from_secs(5)).await;
        let game = h.store.get_match(&h.match_id).await.unwrap().unwrap();
        assert_eq!(game.phase(), GamePhase::Gameplay);
        assert_eq!(game.game.dice_one, Some(4));
        assert_eq!(game.active_seat(), Some(Seat::Opponent));
    }

    #[test]
    fn test_action_wire_format() {
        let action: Action = serde_json::from_str(r#"{"type":"chooseParity","value":"even"}"#).unwrap();
        assert_eq!(action, Action::ChooseParity { value: Parity::Even });
        assert_eq!(serde_json::to_string(&Action::Roll).unwrap(), r#"{"type":"roll"}"#);
    }
}
