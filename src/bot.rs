//! Bot Automation Loop.
//!
//! Each match with a bot seat gets one monitor task that follows the match
//! feed. On every snapshot each seat's [`SeatDriver`] is consulted; a human
//! seat does nothing, a bot seat waits a humanlike delay, re-reads the
//! match, and submits through the same [`MatchEngine::submit`] entry point
//! clients use.

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::watch;

use crate::engine::{Action, MatchEngine};
use crate::state::game::{GamePhase, Match, Parity, Seat};
use crate::state::room::{Controller, Personality};
use crate::store::{Store, StoreError};
use crate::timer::{CancelToken, TaskSet};

/// What a seat is expected to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Due {
    /// Call odd or even
    Call,
    /// Roll or bank
    Play,
}

/// Whether `seat` must act on `game` right now.
pub fn pending_action(game: &Match, seat: Seat) -> Option<Due> {
    if game.is_terminal() || !game.seat(seat).turn_active {
        return None;
    }
    match game.phase() {
        GamePhase::TurnDecider
            if game.game.turn_decider == seat && game.game.turn_decider_choice.is_none() =>
        {
            Some(Due::Call)
        }
        GamePhase::Gameplay if !game.game.is_rolling => Some(Due::Play),
        _ => None,
    }
}

/// Inputs to a bot decision, seen from the bot's seat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnView {
    pub due: Due,
    pub own_score: u32,
    pub opponent_score: u32,
    pub turn_score: u32,
    pub target_score: u32,
}

impl TurnView {
    pub fn of(game: &Match, seat: Seat) -> Option<Self> {
        Some(Self {
            due: pending_action(game, seat)?,
            own_score: game.seat(seat).score,
            opponent_score: game.seat(seat.other()).score,
            turn_score: game.game.turn_score,
            target_score: game.game.rules.target_score,
        })
    }
}

/// Pluggable decision model.
pub trait BotStrategy: Send + Sync {
    fn decide(&self, view: &TurnView, personality: &Personality) -> Action;
}

/// Threshold banking adjusted by the score gap.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicStrategy;

impl HeuristicStrategy {
    /// Turn score at which the bot banks.
    pub fn bank_threshold(view: &TurnView, personality: &Personality) -> u32 {
        let base = personality.bank_threshold as f32;
        let gap = view.opponent_score as i64 - view.own_score as i64;
        let threshold = if gap < 0 {
            base * 0.75
        } else if gap > i64::from(view.target_score / 4) {
            base * (1.0 + personality.risk_appetite)
        } else {
            base
        };
        threshold.round().max(1.0) as u32
    }
}

impl BotStrategy for HeuristicStrategy {
    fn decide(&self, view: &TurnView, personality: &Personality) -> Action {
        match view.due {
            Due::Call => {
                let value = if rand::rng().random_bool(0.5) {
                    Parity::Odd
                } else {
                    Parity::Even
                };
                Action::ChooseParity { value }
            }
            Due::Play => {
                if view.turn_score == 0 {
                    Action::Roll
                } else if view.own_score + view.turn_score >= view.target_score {
                    Action::Bank
                } else if view.turn_score >= Self::bank_threshold(view, personality) {
                    Action::Bank
                } else {
                    Action::Roll
                }
            }
        }
    }
}

/// Something that may act for a seat.
#[async_trait]
pub trait SeatDriver: Send + Sync {
    /// React to a snapshot. Returns once any action taken has been applied.
    async fn on_update(&self, snapshot: &Match, seat: Seat, cancel: &mut CancelToken);
}

/// Humans act through their own client.
#[derive(Debug, Default, Clone, Copy)]
pub struct HumanSeat;

#[async_trait]
impl SeatDriver for HumanSeat {
    async fn on_update(&self, _snapshot: &Match, _seat: Seat, _cancel: &mut CancelToken) {}
}

/// Timer-driven bot seat.
pub struct BotSeat {
    engine: Arc<MatchEngine>,
    store: Arc<Store>,
    strategy: Arc<dyn BotStrategy>,
    personality: Personality,
    delay: RangeInclusive<u64>,
}

impl BotSeat {
    fn think_time(&self) -> Duration {
        let (min, max) = (*self.delay.start(), *self.delay.end());
        Duration::from_millis(rand::rng().random_range(min..=max.max(min)))
    }
}

#[async_trait]
impl SeatDriver for BotSeat {
    async fn on_update(&self, snapshot: &Match, seat: Seat, cancel: &mut CancelToken) {
        if pending_action(snapshot, seat).is_none() {
            return;
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(self.think_time()) => {}
        }

        // The snapshot may be stale after the delay
        let latest = match self.store.get_match(&snapshot.id).await {
            Ok(Some(game)) => game,
            Ok(None) => return,
            Err(e) => {
                log::warn!("[bot {}] failed to re-read match: {}", snapshot.id, e);
                return;
            }
        };
        let Some(view) = TurnView::of(&latest, seat) else {
            return;
        };

        let player_id = latest.seat(seat).player_id.clone();
        let action = self.strategy.decide(&view, &self.personality);
        log::debug!(
            "[bot {}] {} ({}) chooses {:?} at turn score {}",
            latest.id,
            player_id,
            self.personality.name,
            action,
            view.turn_score
        );
        if let Err(e) = self.engine.submit(&latest.id, &player_id, action).await {
            log::warn!("[bot {}] {} action rejected: {}", latest.id, player_id, e);
        }
    }
}

/// Owns one monitor task per bot match.
pub struct BotDriver {
    engine: Arc<MatchEngine>,
    store: Arc<Store>,
    strategy: Arc<dyn BotStrategy>,
    delay: RangeInclusive<u64>,
    monitors: TaskSet,
}

impl BotDriver {
    pub fn new(
        engine: Arc<MatchEngine>,
        store: Arc<Store>,
        strategy: Arc<dyn BotStrategy>,
        delay_ms: RangeInclusive<u64>,
    ) -> Self {
        Self {
            engine,
            store,
            strategy,
            delay: delay_ms,
            monitors: TaskSet::new("bots"),
        }
    }

    fn driver_for(&self, controller: &Controller) -> Arc<dyn SeatDriver> {
        match controller {
            Controller::Human => Arc::new(HumanSeat),
            Controller::Bot { personality } => Arc::new(BotSeat {
                engine: self.engine.clone(),
                store: self.store.clone(),
                strategy: self.strategy.clone(),
                personality: personality.clone(),
                delay: self.delay.clone(),
            }),
        }
    }

    /// Start following a match. Returns `false` when it does not exist.
    pub async fn start_match_monitoring(&self, match_id: &str) -> Result<bool, StoreError> {
        let Some(feed) = self.store.subscribe(match_id).await? else {
            return Ok(false);
        };
        let snapshot = feed.borrow().clone();
        let drivers = [
            (Seat::Host, self.driver_for(&snapshot.host.controller)),
            (Seat::Opponent, self.driver_for(&snapshot.opponent.controller)),
        ];
        log::info!("[bots] monitoring match {}", match_id);
        self.monitors
            .spawn(match_id, move |cancel| monitor(drivers, feed, cancel));
        Ok(true)
    }

    pub fn stop_match_monitoring(&self, match_id: &str) -> bool {
        let stopped = self.monitors.cancel(match_id);
        if stopped {
            log::info!("[bots] stopped monitoring match {}", match_id);
        }
        stopped
    }

    pub fn is_monitoring(&self, match_id: &str) -> bool {
        self.monitors.contains(match_id)
    }

    pub fn monitored_count(&self) -> usize {
        self.monitors.len()
    }

    pub fn shutdown(&self) {
        self.monitors.cancel_all();
    }
}

async fn monitor(
    drivers: [(Seat, Arc<dyn SeatDriver>); 2],
    mut feed: watch::Receiver<Match>,
    mut cancel: CancelToken,
) {
    loop {
        let snapshot = feed.borrow_and_update().clone();
        if snapshot.is_terminal() {
            log::debug!("[bots] match {} finished, monitor exiting", snapshot.id);
            return;
        }
        for (seat, driver) in &drivers {
            if cancel.is_cancelled() {
                return;
            }
            driver.on_update(&snapshot, *seat, &mut cancel).await;
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = feed.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}
