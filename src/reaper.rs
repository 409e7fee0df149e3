//! Orphaned Session Reaper.
//!
//! A periodic sweep over rooms, matches, and player states. Sessions are
//! only retired when every participant has been silent past the disconnect
//! threshold and the session itself is older than the orphan threshold.
//! Bots never heartbeat, so they always count as disconnected.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};

use crate::config::ReaperConfig;
use crate::engine::MatchEngine;
use crate::state::game::{GamePhase, Match};
use crate::state::player::{PlayerId, SessionId};
use crate::state::presence::Presence;
use crate::state::room::WaitingRoom;
use crate::store::Store;
use crate::timer::CancelToken;
use crate::tracker::PlayerTracker;

/// Reason recorded on matches retired by the sweep.
pub const ORPHANED_REASON: &str = "All players disconnected";

/// What a sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted_rooms: usize,
    pub abandoned_rooms: usize,
    pub abandoned_matches: usize,
    pub released_players: usize,
    /// Presence entries forgotten; not counted as cleaned sessions
    pub expired_connections: usize,
    pub errors: Vec<String>,
}

impl SweepReport {
    pub fn cleaned_count(&self) -> usize {
        self.deleted_rooms + self.abandoned_rooms + self.abandoned_matches + self.released_players
    }
}

#[derive(Debug, Default)]
struct RoomSweep {
    deleted: Vec<WaitingRoom>,
    abandoned: Vec<WaitingRoom>,
}

/// Periodic cleanup service.
pub struct Reaper {
    store: Arc<Store>,
    tracker: Arc<PlayerTracker>,
    engine: Arc<MatchEngine>,
    presence: Arc<dyn Presence>,
    config: ReaperConfig,
    stale_state_after: TimeDelta,
}

impl Reaper {
    pub fn new(
        store: Arc<Store>,
        tracker: Arc<PlayerTracker>,
        engine: Arc<MatchEngine>,
        presence: Arc<dyn Presence>,
        config: ReaperConfig,
        stale_state_after: TimeDelta,
    ) -> Self {
        Self {
            store,
            tracker,
            engine,
            presence,
            config,
            stale_state_after,
        }
    }

    fn all_disconnected<'a>(&self, mut players: impl Iterator<Item = &'a str>, now: DateTime<Utc>) -> bool {
        let threshold = self.config.disconnect_after();
        players.all(|id| self.presence.is_disconnected(id, now, threshold))
    }

    /// Run one sweep as of `now`.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        self.sweep_rooms(now, &mut report).await;
        self.sweep_matches(now, &mut report).await;
        self.sweep_players(&mut report).await;
        report.expired_connections = self
            .presence
            .expire_stale(now, self.config.orphan_after())
            .len();

        if report.cleaned_count() > 0 || !report.errors.is_empty() {
            log::info!(
                "[reaper] sweep: {} rooms deleted, {} rooms abandoned, {} matches abandoned, {} players released, {} errors",
                report.deleted_rooms,
                report.abandoned_rooms,
                report.abandoned_matches,
                report.released_players,
                report.errors.len()
            );
        }
        report
    }

    async fn sweep_rooms(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let live_matches: HashSet<SessionId> = match self.store.matches().await {
            Ok(matches) => matches.into_iter().map(|m| m.id).collect(),
            Err(e) => {
                report.errors.push(format!("listing matches: {}", e));
                return;
            }
        };
        let stale_after = self.config.room_stale_after();
        let orphan_after = self.config.orphan_after();

        let swept = self
            .store
            .transaction(|tx| {
                let mut sweep = RoomSweep::default();
                sweep.deleted = tx.remove_where(|room| {
                    let age = now - room.created_at;
                    match &room.promoted_to {
                        Some(match_id) => !live_matches.contains(match_id) && age > orphan_after,
                        None => room.is_open() && age > stale_after,
                    }
                });

                let orphaned: Vec<SessionId> = tx
                    .rooms()
                    .iter()
                    .filter(|room| {
                        room.is_full()
                            && room.promoted_to.is_none()
                            && now - room.created_at > orphan_after
                            && self.all_disconnected(room.participant_ids().iter().map(String::as_str), now)
                    })
                    .map(|room| room.id.clone())
                    .collect();
                for id in orphaned {
                    if let Some(room) = tx.get_mut(&id) {
                        room.abandon();
                        sweep.abandoned.push(room.clone());
                    }
                }
                sweep
            })
            .await;

        let swept = match swept {
            Ok(swept) => swept,
            Err(e) => {
                report.errors.push(format!("sweeping rooms: {}", e));
                return;
            }
        };
        report.deleted_rooms += swept.deleted.len();
        report.abandoned_rooms += swept.abandoned.len();

        for room in swept.deleted.iter().chain(&swept.abandoned) {
            log::debug!("[reaper] retired {}", room);
            for player_id in room.participant_ids() {
                self.release(&player_id, &room.id, report).await;
            }
        }
    }

    fn is_orphaned(&self, game: &Match, now: DateTime<Utc>) -> bool {
        let players = game.seats().into_iter().map(|s| s.player_id.as_str());
        if !self.all_disconnected(players, now) || now - game.created_at <= self.config.orphan_after() {
            return false;
        }
        match game.phase() {
            GamePhase::TurnDecider => true,
            GamePhase::Gameplay => now - game.updated_at > self.config.active_inactivity(),
            GamePhase::GameOver => false,
        }
    }

    async fn sweep_matches(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let matches = match self.store.matches().await {
            Ok(matches) => matches,
            Err(e) => {
                report.errors.push(format!("listing matches: {}", e));
                return;
            }
        };
        for game in matches {
            if game.is_terminal() || !self.is_orphaned(&game, now) {
                continue;
            }
            match self.engine.abandon(&game.id, ORPHANED_REASON).await {
                Ok(_) => report.abandoned_matches += 1,
                Err(e) => report.errors.push(format!("abandoning match {}: {}", game.id, e)),
            }
        }
    }

    async fn sweep_players(&self, report: &mut SweepReport) {
        let players = match self.store.players().await {
            Ok(players) => players,
            Err(e) => {
                report.errors.push(format!("listing players: {}", e));
                return;
            }
        };
        for state in players.iter().filter(|s| !s.is_idle()) {
            let Some(session_id) = state.session_id() else {
                continue;
            };
            match self.tracker.session_exists(session_id).await {
                Ok(true) => {}
                Ok(false) => self.release(&state.player_id, session_id, report).await,
                Err(e) => report.errors.push(format!("checking session {}: {}", session_id, e)),
            }
        }

        match self.tracker.cleanup_stale_states(self.stale_state_after).await {
            Ok(count) => report.released_players += count,
            Err(e) => report.errors.push(format!("cleaning stale states: {}", e)),
        }
    }

    async fn release(&self, player_id: &PlayerId, session_id: &str, report: &mut SweepReport) {
        match self.tracker.release_if_in(player_id, session_id).await {
            Ok(true) => report.released_players += 1,
            Ok(false) => {}
            Err(e) => report.errors.push(format!("releasing {}: {}", player_id, e)),
        }
    }

    /// Sweep on the configured interval until cancelled.
    pub async fn run(self: Arc<Self>, mut cancel: CancelToken) {
        if self.config.interval().is_zero() {
            log::error!("[reaper] not started: interval must be positive");
            return;
        }
        let mut ticker = tokio::time::interval(self.config.interval());
        // First tick completes immediately
        ticker.tick().await;
        log::info!("[reaper] running every {:?}", self.config.interval());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("[reaper] stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.sweep(Utc::now()).await;
                }
            }
        }
    }
}
