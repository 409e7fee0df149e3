//! Matchmaking Room Allocator.
//!
//! Pairing happens inside one room transaction: the first open room for
//! the mode that the requester does not host is joined, otherwise a new
//! room is opened. Everything after the transaction (promotion grace, bot
//! fallback) is a timer registered here under the room id.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::state::player::{SessionId, SessionType};
use crate::state::room::{Participant, WaitingRoom};
use crate::store::{Store, StoreError};
use crate::timer::TaskSet;

/// Outcome of a find-or-create.
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub room_id: SessionId,
    pub is_new_room: bool,
    pub has_opponent: bool,
    /// Room as committed
    pub room: WaitingRoom,
}

impl Allocation {
    fn of(room: &WaitingRoom, is_new_room: bool) -> Self {
        Self {
            room_id: room.id.clone(),
            is_new_room,
            has_opponent: room.is_full(),
            room: room.clone(),
        }
    }
}

fn fallback_key(room_id: &str) -> String {
    format!("fallback:{}", room_id)
}

fn promotion_key(room_id: &str) -> String {
    format!("promote:{}", room_id)
}

/// Room allocator.
#[derive(Debug)]
pub struct RoomAllocator {
    store: Arc<Store>,
    timers: TaskSet,
}

impl RoomAllocator {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            timers: TaskSet::new("allocator"),
        }
    }

    /// Join the first open room for `game_mode` or open a new one.
    ///
    /// A requester who already hosts an open room of the same kind gets it
    /// back instead of a second one.
    pub async fn find_or_create_room(
        &self,
        game_mode: &str,
        session_type: SessionType,
        participant: Participant,
    ) -> Result<Allocation, StoreError> {
        let requester = participant.player_id.clone();
        let allocation = self
            .store
            .transaction(|tx| {
                let candidate = tx
                    .open_rooms(game_mode)
                    .find(|r| r.session_type == session_type && r.host().player_id != requester)
                    .map(|r| r.id.clone());
                if let Some(room) = candidate.and_then(|id| tx.get_mut(&id)) {
                    if room.fill(participant.clone()).is_ok() {
                        return Allocation::of(room, false);
                    }
                }

                let own = tx
                    .open_rooms(game_mode)
                    .find(|r| r.session_type == session_type && r.host().player_id == requester)
                    .cloned();
                if let Some(room) = own {
                    return Allocation::of(&room, false);
                }

                let room = WaitingRoom::open(game_mode, session_type, participant.clone());
                tx.insert(room.clone());
                Allocation::of(&room, true)
            })
            .await?;

        if allocation.has_opponent {
            log::debug!(
                "[allocator mode={}] {} joined {}",
                game_mode,
                requester,
                allocation.room_id
            );
        } else if allocation.is_new_room {
            log::debug!(
                "[allocator mode={}] {} opened {}",
                game_mode,
                requester,
                allocation.room_id
            );
        }
        Ok(allocation)
    }

    /// Seat a bot in a room that is still open. `None` when a human got
    /// there first or the room is gone.
    pub async fn fill_with_bot(
        &self,
        room_id: &str,
        bot: Participant,
    ) -> Result<Option<WaitingRoom>, StoreError> {
        self.store
            .transaction(|tx| {
                let room = tx.get(room_id)?;
                if !room.is_open() || room.promoted_to.is_some() {
                    return None;
                }
                let room = tx.get_mut(room_id)?;
                room.fill(bot.clone()).ok()?;
                Some(room.clone())
            })
            .await
    }

    /// Mark a full room as being promoted. Only the first caller gets the
    /// room back.
    pub async fn claim_for_promotion(&self, room_id: &str) -> Result<Option<WaitingRoom>, StoreError> {
        self.store
            .transaction(|tx| {
                let room = tx.get(room_id)?;
                if !room.is_full() || room.promoted_to.is_some() {
                    return None;
                }
                let room = tx.get_mut(room_id)?;
                room.promoted_to = Some(room.id.clone());
                Some(room.clone())
            })
            .await
    }

    pub async fn remove_room(&self, room_id: &str) -> Result<Option<WaitingRoom>, StoreError> {
        self.cancel_timers(room_id);
        self.store.transaction(|tx| tx.remove(room_id)).await
    }

    /// Remove a room only while it is still waiting for an opponent.
    pub async fn withdraw_room(&self, room_id: &str) -> Result<Option<WaitingRoom>, StoreError> {
        let removed = self
            .store
            .transaction(|tx| {
                let room = tx.get(room_id)?;
                if !room.is_open() || room.promoted_to.is_some() {
                    return None;
                }
                tx.remove(room_id)
            })
            .await?;
        if removed.is_some() {
            self.cancel_timers(room_id);
        }
        Ok(removed)
    }

    /// Withdraw every open room hosted by `player_id`.
    pub async fn cancel_search_rooms(&self, player_id: &str) -> Result<Vec<WaitingRoom>, StoreError> {
        let removed = self
            .store
            .transaction(|tx| tx.remove_where(|r| r.is_open() && r.host().player_id == player_id))
            .await?;
        for room in &removed {
            self.cancel_timers(&room.id);
        }
        Ok(removed)
    }

    /// Run `task` after `delay` unless a real opponent shows up first.
    pub fn arm_bot_fallback<Fut>(&self, room_id: &str, delay: Duration, task: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        log::debug!("[allocator] bot fallback for {} in {:?}", room_id, delay);
        self.timers.schedule(fallback_key(room_id), delay, task);
    }

    pub fn cancel_bot_fallback(&self, room_id: &str) -> bool {
        self.timers.cancel(&fallback_key(room_id))
    }

    pub fn has_bot_fallback(&self, room_id: &str) -> bool {
        self.timers.contains(&fallback_key(room_id))
    }

    /// Run `task` after the promotion grace delay.
    pub fn schedule_promotion<Fut>(&self, room_id: &str, delay: Duration, task: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.timers.schedule(promotion_key(room_id), delay, task);
    }

    pub fn cancel_timers(&self, room_id: &str) {
        self.timers.cancel(&fallback_key(room_id));
        self.timers.cancel(&promotion_key(room_id));
    }

    /// Drop every pending timer.
    pub fn shutdown(&self) {
        self.timers.cancel_all();
    }
}
