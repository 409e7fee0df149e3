//! Matchmaking service.
//!
//! The surface presentation layers talk to. A request is gated by the
//! tracker, paired by the allocator, promoted into a match after a grace
//! delay (or after a bot fallback), and played through the engine.
//!
//! ```text
//! request_match ──▶ tracker ──▶ allocator ──┬─ joined ──▶ promotion (grace) ──▶ match
//!                                           └─ opened ──▶ bot fallback ───────┘
//! ```

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;

use crate::allocator::{Allocation, RoomAllocator};
use crate::bot::{BotDriver, BotStrategy, HeuristicStrategy};
use crate::config::{ConfigError, MatchmakingConfig};
use crate::engine::{Action, ActionError, DiceSource, MatchEngine, RandomDice};
use crate::profile::{BotRoster, DefaultRoster, MemoryProfiles, ProfileService};
use crate::reaper::{Reaper, SweepReport};
use crate::state::game::{Match, Seat};
use crate::state::player::{PlayerState, PlayerStatus, SessionId, SessionType};
use crate::state::presence::PresenceTracker;
use crate::state::room::Participant;
use crate::store::{Store, StoreError};
use crate::timer::TaskSet;
use crate::tracker::{PlayerTracker, TrackerError};

/// Matchmaking errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MatchmakingError {
    /// Request violates the player's current state; shown as is.
    #[error("{0}")]
    Conflict(String),
    #[error("Unknown game mode {0}")]
    UnknownGameMode(String),
    #[error("Matchmaking is busy, please try again")]
    Retryable,
    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for MatchmakingError {
    fn from(err: StoreError) -> Self {
        if err.is_retryable() {
            Self::Retryable
        } else {
            Self::Store(err)
        }
    }
}

impl From<TrackerError> for MatchmakingError {
    fn from(err: TrackerError) -> Self {
        match err {
            TrackerError::Conflict(reason) => Self::Conflict(reason),
            TrackerError::Store(e) => e.into(),
        }
    }
}

/// Answer to a match request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchTicket {
    /// Room id, which becomes the match id on promotion
    pub session_id: SessionId,
    pub is_new_room: bool,
    pub has_opponent: bool,
}

/// Result of a manual cleanup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub cleaned_count: usize,
    pub errors: Vec<String>,
}

impl From<SweepReport> for CleanupReport {
    fn from(report: SweepReport) -> Self {
        Self {
            cleaned_count: report.cleaned_count(),
            errors: report.errors,
        }
    }
}

/// External collaborators.
pub struct Collaborators {
    pub profiles: Arc<dyn ProfileService>,
    pub presence: Arc<PresenceTracker>,
    pub roster: Arc<dyn BotRoster>,
    pub dice: Arc<dyn DiceSource>,
    pub strategy: Arc<dyn BotStrategy>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            profiles: Arc::new(MemoryProfiles::new()),
            presence: Arc::new(PresenceTracker::new()),
            roster: Arc::new(DefaultRoster::new()),
            dice: Arc::new(RandomDice),
            strategy: Arc::new(HeuristicStrategy),
        }
    }
}

/// Matchmaking and match service.
pub struct Matchmaker {
    config: MatchmakingConfig,
    store: Arc<Store>,
    tracker: Arc<PlayerTracker>,
    allocator: RoomAllocator,
    engine: Arc<MatchEngine>,
    bots: BotDriver,
    reaper: Arc<Reaper>,
    presence: Arc<PresenceTracker>,
    profiles: Arc<dyn ProfileService>,
    roster: Arc<dyn BotRoster>,
    dice: Arc<dyn DiceSource>,
    background: TaskSet,
}

impl Matchmaker {
    pub fn new(config: MatchmakingConfig, collaborators: Collaborators) -> Result<Arc<Self>, ConfigError> {
        let store = Arc::new(Store::new(config.transaction_retries));
        Self::with_store(config, collaborators, store)
    }

    /// Build over an existing store.
    pub fn with_store(
        config: MatchmakingConfig,
        collaborators: Collaborators,
        store: Arc<Store>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let Collaborators {
            profiles,
            presence,
            roster,
            dice,
            strategy,
        } = collaborators;

        let tracker = Arc::new(PlayerTracker::new(store.clone(), config.stale_state_after()));
        let engine = Arc::new(MatchEngine::new(
            store.clone(),
            tracker.clone(),
            profiles.clone(),
            dice.clone(),
            &config,
        ));
        let bots = BotDriver::new(
            engine.clone(),
            store.clone(),
            strategy,
            config.bot_delay_min_ms..=config.bot_delay_max_ms,
        );
        let reaper = Arc::new(Reaper::new(
            store.clone(),
            tracker.clone(),
            engine.clone(),
            presence.clone(),
            config.reaper.clone(),
            config.stale_state_after(),
        ));

        Ok(Arc::new(Self {
            allocator: RoomAllocator::new(store.clone()),
            config,
            store,
            tracker,
            engine,
            bots,
            reaper,
            presence,
            profiles,
            roster,
            dice,
            background: TaskSet::new("matchmaker"),
        }))
    }

    pub fn config(&self) -> &MatchmakingConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn bots(&self) -> &BotDriver {
        &self.bots
    }

    pub async fn player_state(&self, player_id: &str) -> Result<Option<PlayerState>, StoreError> {
        self.store.player(player_id).await
    }

    pub async fn get_match(&self, match_id: &str) -> Result<Option<Match>, StoreError> {
        self.store.get_match(match_id).await
    }

    /// Ask for a match. Returns the room the player now sits in.
    pub async fn request_match(
        self: &Arc<Self>,
        player_id: &str,
        session_type: SessionType,
        game_mode: &str,
    ) -> Result<MatchTicket, MatchmakingError> {
        if self.config.mode(game_mode).is_none() {
            return Err(MatchmakingError::UnknownGameMode(game_mode.to_string()));
        }

        let access = self
            .tracker
            .validate_session_type_access(player_id, session_type)
            .await;
        if !access.valid {
            let reason = access.reason.unwrap_or_else(|| "Already in a game".to_string());
            log::debug!("[matchmaker {}] request rejected: {}", player_id, reason);
            return Err(MatchmakingError::Conflict(reason));
        }

        if let Some(ticket) = self.reusable_room(player_id, session_type, game_mode).await? {
            log::debug!("[matchmaker {}] still waiting in {}", player_id, ticket.session_id);
            return Ok(ticket);
        }

        let cleared = self
            .tracker
            .set_searching(player_id, session_type, game_mode)
            .await?;
        for room_id in &cleared {
            self.allocator.cancel_timers(room_id);
        }

        let participant = match self.profiles.snapshot(player_id).await {
            Some(participant) => participant,
            None => Participant::human(player_id, player_id),
        };
        let allocation = match self
            .allocator
            .find_or_create_room(game_mode, session_type, participant)
            .await
        {
            Ok(allocation) => allocation,
            Err(e) => {
                log::warn!("[matchmaker {}] allocation failed: {}", player_id, e);
                if let Err(e) = self.tracker.set_idle(player_id).await {
                    log::warn!("[matchmaker {}] failed to reset state: {}", player_id, e);
                }
                return Err(e.into());
            }
        };
        self.seat_allocation(player_id, session_type, game_mode, allocation).await
    }

    /// Record the player's seat after allocation. A full room is always
    /// promoted; a room the player no longer waits in is withdrawn.
    async fn seat_allocation(
        self: &Arc<Self>,
        player_id: &str,
        session_type: SessionType,
        game_mode: &str,
        allocation: Allocation,
    ) -> Result<MatchTicket, MatchmakingError> {
        let room_id = allocation.room_id.clone();
        let mut ticket = MatchTicket {
            session_id: room_id.clone(),
            is_new_room: allocation.is_new_room,
            has_opponent: allocation.has_opponent,
        };

        if allocation.has_opponent {
            let host_id = allocation.room.host().player_id.clone();
            self.allocator.cancel_bot_fallback(&room_id);
            self.schedule_promotion(&room_id);
            // Promotion binds both players even when these writes are lost
            for (pid, opponent) in [(player_id, host_id.as_str()), (host_id.as_str(), player_id)] {
                if let Err(e) = self.tracker.set_matched(pid, &room_id, opponent).await {
                    log::warn!("[matchmaker {}] failed to mark {} matched: {}", room_id, pid, e);
                }
            }
            log::info!("[matchmaker {}] {} paired with {}", room_id, player_id, host_id);
            return Ok(ticket);
        }

        if let Err(e) = self
            .tracker
            .set_in_session(player_id, &room_id, session_type, game_mode, PlayerStatus::Waiting)
            .await
        {
            let current = self.store.player(player_id).await?;
            if current.as_ref().and_then(|s| s.session_id()) == Some(room_id.as_str()) {
                log::debug!("[matchmaker {}] {} already matched in this room", room_id, player_id);
                ticket.has_opponent = true;
                return Ok(ticket);
            }
            if self.allocator.withdraw_room(&room_id).await?.is_some() {
                log::debug!("[matchmaker {}] search of {} ended early ({}), room withdrawn", room_id, player_id, e);
                return Err(MatchmakingError::Conflict("Search cancelled".to_string()));
            }
            log::debug!("[matchmaker {}] opponent joined before {} was seated", room_id, player_id);
            ticket.has_opponent = true;
            return Ok(ticket);
        }
        if !self.allocator.has_bot_fallback(&room_id) {
            self.arm_bot_fallback(&room_id);
        }
        Ok(ticket)
    }

    /// A waiting player asking again for the same kind of match keeps
    /// their open room. Asking for another game mode withdraws it.
    async fn reusable_room(
        &self,
        player_id: &str,
        session_type: SessionType,
        game_mode: &str,
    ) -> Result<Option<MatchTicket>, MatchmakingError> {
        let Some(state) = self.store.player(player_id).await? else {
            return Ok(None);
        };
        let (PlayerStatus::Waiting, Some(room_id)) = (state.status(), state.session_id()) else {
            return Ok(None);
        };

        let room = self.store.room(room_id).await?;
        if room.as_ref().is_some_and(|r| r.is_full() && r.has_participant(player_id)) {
            return Err(MatchmakingError::Conflict("Already in a game".to_string()));
        }
        let same_request = state.current_session_type == Some(session_type)
            && state.current_game_mode.as_deref() == Some(game_mode);
        if same_request {
            if let Some(room) = room.filter(|r| r.is_open() && r.host().player_id == player_id) {
                return Ok(Some(MatchTicket {
                    session_id: room.id,
                    is_new_room: false,
                    has_opponent: false,
                }));
            }
        }

        log::debug!("[matchmaker {}] leaving {} to search again", player_id, room_id);
        self.allocator.cancel_search_rooms(player_id).await?;
        self.tracker.set_idle(player_id).await?;
        Ok(None)
    }

    fn arm_bot_fallback(self: &Arc<Self>, room_id: &str) {
        let this = Arc::clone(self);
        let id = room_id.to_string();
        self.allocator
            .arm_bot_fallback(room_id, self.config.bot_fallback(), async move {
                this.inject_bot(&id).await;
            });
    }

    fn schedule_promotion(self: &Arc<Self>, room_id: &str) {
        let this = Arc::clone(self);
        let id = room_id.to_string();
        self.allocator
            .schedule_promotion(room_id, self.config.promotion_grace(), async move {
                this.promote(&id).await;
            });
    }

    async fn inject_bot(self: &Arc<Self>, room_id: &str) {
        let bot = self.roster.pick();
        let bot_id = bot.player_id.clone();
        match self.allocator.fill_with_bot(room_id, bot).await {
            Ok(Some(room)) => {
                let host_id = room.host().player_id.clone();
                log::info!("[matchmaker {}] no opponent for {}, seating bot {}", room_id, host_id, bot_id);
                if let Err(e) = self.tracker.set_matched(&host_id, room_id, &bot_id).await {
                    log::warn!("[matchmaker {}] failed to mark host {} matched: {}", room_id, host_id, e);
                }
                self.schedule_promotion(room_id);
            }
            Ok(None) => log::debug!("[matchmaker {}] bot fallback no longer needed", room_id),
            Err(e) => log::warn!("[matchmaker {}] bot fallback failed: {}", room_id, e),
        }
    }

    /// Turn a full room into a match under the same id.
    async fn promote(&self, room_id: &str) {
        let room = match self.allocator.claim_for_promotion(room_id).await {
            Ok(Some(room)) => room,
            Ok(None) => {
                log::debug!("[matchmaker {}] nothing to promote", room_id);
                return;
            }
            Err(e) => {
                log::error!("[matchmaker {}] promotion claim failed: {}", room_id, e);
                return;
            }
        };

        let rules = self
            .config
            .mode(&room.game_mode)
            .map(|m| m.rules())
            .unwrap_or_default();
        let chooser = if self.dice.coin() { Seat::Host } else { Seat::Opponent };
        let game = match Match::from_room(&room, rules, chooser) {
            Ok(game) => game,
            Err(e) => {
                log::error!("[matchmaker {}] cannot promote: {}", room_id, e);
                return;
            }
        };
        let has_bot = game.has_bot();
        let seats = game.seats();
        let humans: Vec<(String, String)> = seats
            .iter()
            .zip(seats.iter().rev())
            .filter(|(seat, _)| !seat.is_bot())
            .map(|(seat, other)| (seat.player_id.clone(), other.player_id.clone()))
            .collect();

        match self.store.insert_match(game).await {
            Ok(true) => {}
            Ok(false) => log::warn!("[matchmaker {}] match already exists", room_id),
            Err(e) => {
                log::error!("[matchmaker {}] failed to create match: {}", room_id, e);
                return;
            }
        }
        if let Err(e) = self.allocator.remove_room(room_id).await {
            log::warn!("[matchmaker {}] failed to remove promoted room: {}", room_id, e);
        }
        for (player_id, opponent_id) in &humans {
            if let Err(e) = self
                .tracker
                .bind_to_match(player_id, room_id, opponent_id, room.session_type, &room.game_mode)
                .await
            {
                log::warn!("[matchmaker {}] failed to mark {} playing: {}", room_id, player_id, e);
            }
        }
        if has_bot {
            if let Err(e) = self.bots.start_match_monitoring(room_id).await {
                log::error!("[matchmaker {}] failed to start bot: {}", room_id, e);
            }
        }
        log::info!("[matchmaker {}] match started ({:?} calls the decider)", room_id, chooser);
    }

    /// Apply a player action to a match.
    pub async fn submit_action(
        &self,
        match_id: &str,
        player_id: &str,
        action: Action,
    ) -> Result<Match, ActionError> {
        let game = self.engine.submit(match_id, player_id, action).await?;
        if game.is_terminal() {
            self.bots.stop_match_monitoring(match_id);
        }
        Ok(game)
    }

    /// Leave the queue. Rejected once an opponent has been found.
    pub async fn cancel_search(&self, player_id: &str) -> Result<(), MatchmakingError> {
        let Some(state) = self.store.player(player_id).await? else {
            return Ok(());
        };
        match state.status() {
            PlayerStatus::Idle => return Ok(()),
            PlayerStatus::Matched | PlayerStatus::Playing => {
                return Err(MatchmakingError::Conflict("Already in a game".to_string()));
            }
            PlayerStatus::Searching | PlayerStatus::Waiting => {}
        }

        let removed = self.allocator.cancel_search_rooms(player_id).await?;
        if let Some(session_id) = state.session_id() {
            let still_full = self
                .store
                .room(session_id)
                .await?
                .is_some_and(|room| room.is_full());
            if still_full {
                return Err(MatchmakingError::Conflict("Opponent already found".to_string()));
            }
        }
        self.tracker.set_idle(player_id).await?;
        log::debug!("[matchmaker {}] search cancelled, {} room(s) removed", player_id, removed.len());
        Ok(())
    }

    /// Push feed of match snapshots.
    pub async fn subscribe(&self, match_id: &str) -> Result<Option<watch::Receiver<Match>>, StoreError> {
        self.store.subscribe(match_id).await
    }

    /// Record a heartbeat and refresh the player's activity.
    pub async fn heartbeat(&self, player_id: &str) {
        self.presence.heartbeat(player_id);
        if let Err(e) = self.tracker.touch(player_id).await {
            log::warn!("[matchmaker {}] heartbeat not recorded: {}", player_id, e);
        }
    }

    /// Mark a player's connection as dropped. The reaper treats them as gone
    /// at once instead of waiting out the heartbeat threshold.
    pub fn disconnect(&self, player_id: &str) {
        self.presence.disconnect(player_id);
        log::debug!("[matchmaker {}] disconnected", player_id);
    }

    /// Run one reaper sweep now.
    pub async fn run_manual_cleanup(&self) -> CleanupReport {
        self.reaper.sweep(Utc::now()).await.into()
    }

    /// Start the periodic reaper.
    pub fn spawn_reaper(&self) {
        let reaper = self.reaper.clone();
        self.background.spawn("reaper", move |cancel| reaper.run(cancel));
    }

    /// Stop every background task.
    pub fn shutdown(&self) {
        self.background.cancel_all();
        self.allocator.shutdown();
        self.bots.shutdown();
    }
}
