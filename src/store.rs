//! Shared document store.
//!
//! In-memory stand-in for the transactional document store that owns all
//! durable state. Three flat collections keyed by opaque ids:
//!
//! - player states by player id
//! - waiting rooms by room id, kept in insertion order
//! - matches by match id, each with a push feed of snapshots
//!
//! Single-document updates are atomic: the closure runs on a copy that is
//! committed only if it returns `Ok`. Room transactions are optimistic: the
//! body runs against a snapshot and commits only if no other transaction
//! committed in between, otherwise it is re-run from scratch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::sync::{watch, RwLock};

use crate::state::game::Match;
use crate::state::player::{PlayerId, PlayerState, SessionId};
use crate::state::room::WaitingRoom;

/// Default attempts for a room transaction.
pub const DEFAULT_TRANSACTION_RETRIES: u32 = 8;

/// Store errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable")]
    Unavailable,
    #[error("transaction aborted after {attempts} attempts due to concurrent writers")]
    Contention { attempts: u32 },
    #[error("document {0} not found")]
    NotFound(String),
}

impl StoreError {
    /// Whether retrying the whole operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Contention { .. })
    }
}

#[derive(Debug, Default)]
struct RoomTable {
    version: u64,
    rooms: Vec<WaitingRoom>,
}

#[derive(Debug)]
struct MatchEntry {
    doc: Match,
    feed: watch::Sender<Match>,
}

/// Staged view of the room collection inside a transaction.
#[derive(Debug)]
pub struct RoomTransaction {
    rooms: Vec<WaitingRoom>,
    dirty: bool,
}

impl RoomTransaction {
    pub fn rooms(&self) -> &[WaitingRoom] {
        &self.rooms
    }

    /// Open, unpromoted rooms for a mode in insertion order.
    pub fn open_rooms<'a>(&'a self, game_mode: &'a str) -> impl Iterator<Item = &'a WaitingRoom> + 'a {
        self.rooms
            .iter()
            .filter(move |r| r.game_mode == game_mode && r.is_open() && r.promoted_to.is_none())
    }

    pub fn get(&self, room_id: &str) -> Option<&WaitingRoom> {
        self.rooms.iter().find(|r| r.id == room_id)
    }

    pub fn get_mut(&mut self, room_id: &str) -> Option<&mut WaitingRoom> {
        let room = self.rooms.iter_mut().find(|r| r.id == room_id)?;
        self.dirty = true;
        Some(room)
    }

    pub fn insert(&mut self, room: WaitingRoom) {
        self.dirty = true;
        self.rooms.push(room);
    }

    pub fn remove(&mut self, room_id: &str) -> Option<WaitingRoom> {
        let index = self.rooms.iter().position(|r| r.id == room_id)?;
        self.dirty = true;
        Some(self.rooms.remove(index))
    }

    /// Remove every room matching `predicate`, returning them.
    pub fn remove_where(&mut self, predicate: impl Fn(&WaitingRoom) -> bool) -> Vec<WaitingRoom> {
        let (removed, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.rooms).into_iter().partition(|r| predicate(r));
        self.rooms = kept;
        if !removed.is_empty() {
            self.dirty = true;
        }
        removed
    }
}

/// The shared store.
#[derive(Debug)]
pub struct Store {
    online: AtomicBool,
    retries: u32,
    players: RwLock<HashMap<PlayerId, PlayerState>>,
    rooms: RwLock<RoomTable>,
    matches: RwLock<HashMap<SessionId, MatchEntry>>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new(DEFAULT_TRANSACTION_RETRIES)
    }
}

impl Store {
    pub fn new(retries: u32) -> Self {
        Self {
            online: AtomicBool::new(true),
            retries: retries.max(1),
            players: RwLock::new(HashMap::new()),
            rooms: RwLock::new(RoomTable::default()),
            matches: RwLock::new(HashMap::new()),
        }
    }

    /// Simulate the backend going away or coming back.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> Result<(), StoreError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable)
        }
    }

    // Player states

    pub async fn player(&self, player_id: &str) -> Result<Option<PlayerState>, StoreError> {
        self.ensure_online()?;
        Ok(self.players.read().await.get(player_id).cloned())
    }

    pub async fn players(&self) -> Result<Vec<PlayerState>, StoreError> {
        self.ensure_online()?;
        Ok(self.players.read().await.values().cloned().collect())
    }

    pub async fn put_player(&self, state: PlayerState) -> Result<(), StoreError> {
        self.ensure_online()?;
        self.players
            .write()
            .await
            .insert(state.player_id.clone(), state);
        Ok(())
    }

    /// Atomic read-modify-write of a player state, creating an idle record
    /// on first touch. Nothing is written when `f` fails.
    pub async fn update_player<T, E, F>(&self, player_id: &str, f: F) -> Result<(T, PlayerState), E>
    where
        F: FnOnce(&mut PlayerState) -> Result<T, E>,
        E: From<StoreError>,
    {
        self.ensure_online()?;
        let mut players = self.players.write().await;
        let mut state = players
            .get(player_id)
            .cloned()
            .unwrap_or_else(|| PlayerState::new(player_id));
        let value = f(&mut state)?;
        players.insert(player_id.to_string(), state.clone());
        Ok((value, state))
    }

    // Waiting rooms

    pub async fn room(&self, room_id: &str) -> Result<Option<WaitingRoom>, StoreError> {
        self.ensure_online()?;
        Ok(self
            .rooms
            .read()
            .await
            .rooms
            .iter()
            .find(|r| r.id == room_id)
            .cloned())
    }

    pub async fn rooms(&self) -> Result<Vec<WaitingRoom>, StoreError> {
        self.ensure_online()?;
        Ok(self.rooms.read().await.rooms.clone())
    }

    /// Run `body` as a serializable transaction over the room collection.
    ///
    /// The body may be invoked several times and must only touch the
    /// transaction it is given. Read-only bodies never conflict.
    pub async fn transaction<T, F>(&self, mut body: F) -> Result<T, StoreError>
    where
        F: FnMut(&mut RoomTransaction) -> T,
    {
        for attempt in 1..=self.retries {
            self.ensure_online()?;
            let (version, rooms) = {
                let table = self.rooms.read().await;
                (table.version, table.rooms.clone())
            };
            let mut tx = RoomTransaction { rooms, dirty: false };
            let result = body(&mut tx);
            if !tx.dirty {
                return Ok(result);
            }

            let mut table = self.rooms.write().await;
            if table.version == version {
                table.rooms = tx.rooms;
                table.version += 1;
                return Ok(result);
            }
            drop(table);
            log::debug!("[store] room transaction conflict on attempt {}", attempt);
            tokio::task::yield_now().await;
        }
        log::warn!("[store] room transaction gave up after {} attempts", self.retries);
        Err(StoreError::Contention {
            attempts: self.retries,
        })
    }

    // Matches

    /// Insert a new match. Returns `false` when the id is already taken.
    pub async fn insert_match(&self, game: Match) -> Result<bool, StoreError> {
        self.ensure_online()?;
        let mut matches = self.matches.write().await;
        if matches.contains_key(&game.id) {
            return Ok(false);
        }
        let (feed, _) = watch::channel(game.clone());
        matches.insert(game.id.clone(), MatchEntry { doc: game, feed });
        Ok(true)
    }

    pub async fn get_match(&self, match_id: &str) -> Result<Option<Match>, StoreError> {
        self.ensure_online()?;
        Ok(self.matches.read().await.get(match_id).map(|e| e.doc.clone()))
    }

    pub async fn matches(&self) -> Result<Vec<Match>, StoreError> {
        self.ensure_online()?;
        Ok(self
            .matches
            .read()
            .await
            .values()
            .map(|e| e.doc.clone())
            .collect())
    }

    /// Live match referencing a player, if any.
    pub async fn active_match_for(&self, player_id: &str) -> Result<Option<Match>, StoreError> {
        self.ensure_online()?;
        Ok(self
            .matches
            .read()
            .await
            .values()
            .find(|e| !e.doc.is_terminal() && e.doc.has_player(player_id))
            .map(|e| e.doc.clone()))
    }

    /// Atomic read-modify-write of a match. On success the new version is
    /// published to subscribers and returned alongside `f`'s value.
    pub async fn update_match<T, E, F>(&self, match_id: &str, f: F) -> Result<(T, Match), E>
    where
        F: FnOnce(&mut Match) -> Result<T, E>,
        E: From<StoreError>,
    {
        self.ensure_online()?;
        let mut matches = self.matches.write().await;
        let entry = matches
            .get_mut(match_id)
            .ok_or_else(|| StoreError::NotFound(match_id.to_string()))?;
        let mut doc = entry.doc.clone();
        let value = f(&mut doc)?;
        doc.version += 1;
        doc.updated_at = Utc::now();
        entry.doc = doc.clone();
        entry.feed.send_replace(doc.clone());
        Ok((value, doc))
    }

    /// Remove a match. Subscribers see their feed close.
    pub async fn delete_match(&self, match_id: &str) -> Result<Option<Match>, StoreError> {
        self.ensure_online()?;
        Ok(self.matches.write().await.remove(match_id).map(|e| e.doc))
    }

    /// Push feed of snapshots for a match, starting at the current version.
    pub async fn subscribe(&self, match_id: &str) -> Result<Option<watch::Receiver<Match>>, StoreError> {
        self.ensure_online()?;
        Ok(self
            .matches
            .read()
            .await
            .get(match_id)
            .map(|e| e.feed.subscribe()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ActionError;
    use crate::state::game::{DiceRules, Parity, Seat};
    use crate::state::player::SessionType;
    use crate::state::room::Participant;
    use std::sync::Arc;

    fn open_room(host: &str, mode: &str) -> WaitingRoom {
        WaitingRoom::open(mode, SessionType::Quick, Participant::human(host, host))
    }

    fn full_match(id_host: &str, id_opp: &str) -> Match {
        let mut room = open_room(id_host, "classic");
        room.fill(Participant::human(id_opp, id_opp)).unwrap();
        Match::from_room(&room, DiceRules::default(), Seat::Host).unwrap()
    }

    #[tokio::test]
    async fn test_update_player_creates_lazily() {
        let store = Store::default();
        assert!(store.player("p1").await.unwrap().is_none());

        let ((), state) = store
            .update_player::<_, StoreError, _>("p1", |_| Ok(()))
            .await
            .unwrap();
        assert!(state.is_idle());
        assert!(store.player("p1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_update_writes_nothing() {
        let store = Store::default();
        let game = full_match("p1", "p2");
        let id = game.id.clone();
        store.insert_match(game).await.unwrap();

        let result: Result<((), Match), StoreError> = store
            .update_match(&id, |m| {
                m.host.score = 50;
                Err(StoreError::NotFound("forced".to_string()))
            })
            .await;
        assert!(result.is_err());
        let stored = store.get_match(&id).await.unwrap().unwrap();
        assert_eq!(stored.host.score, 0);
        assert_eq!(stored.version, 0);
    }

    #[tokio::test]
    async fn test_update_match_publishes() {
        let store = Store::default();
        let game = full_match("p1", "p2");
        let id = game.id.clone();
        store.insert_match(game).await.unwrap();
        let mut feed = store.subscribe(&id).await.unwrap().unwrap();

        store
            .update_match::<_, ActionError, _>(&id, |m| Ok(m.choose_parity("p1", Parity::Odd)?))
            .await
            .unwrap();

        feed.changed().await.unwrap();
        let snapshot = feed.borrow_and_update().clone();
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.game.turn_decider_choice, Some(Parity::Odd));
    }

    #[tokio::test]
    async fn test_update_missing_match() {
        let store = Store::default();
        let result: Result<((), Match), StoreError> = store.update_match("nope", |_| Ok(())).await;
        assert_eq!(result.unwrap_err(), StoreError::NotFound("nope".to_string()));
    }

    #[tokio::test]
    async fn test_insert_match_once() {
        let store = Store::default();
        let game = full_match("p1", "p2");
        assert!(store.insert_match(game.clone()).await.unwrap());
        assert!(!store.insert_match(game).await.unwrap());
    }

    #[tokio::test]
    async fn test_active_match_for() {
        let store = Store::default();
        let game = full_match("p1", "p2");
        let id = game.id.clone();
        store.insert_match(game).await.unwrap();

        assert!(store.active_match_for("p2").await.unwrap().is_some());
        assert!(store.active_match_for("p3").await.unwrap().is_none());

        store
            .update_match::<_, ActionError, _>(&id, |m| Ok(m.abandon("test")?))
            .await
            .unwrap();
        assert!(store.active_match_for("p2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transaction_open_rooms_in_order() {
        let store = Store::default();
        store
            .transaction(|tx| {
                tx.insert(open_room("a", "classic"));
                tx.insert(open_room("b", "blitz"));
                tx.insert(open_room("c", "classic"));
            })
            .await
            .unwrap();

        let hosts = store
            .transaction(|tx| {
                tx.open_rooms("classic")
                    .map(|r| r.host().player_id.clone())
                    .collect::<Vec<_>>()
            })
            .await
            .unwrap();
        assert_eq!(hosts, vec!["a".to_string(), "c".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_transactions_lose_no_writes() {
        let store = Arc::new(Store::new(64));
        let mut handles = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .transaction(|tx| tx.insert(open_room(&format!("p{}", i), "classic")))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(store.rooms().await.unwrap().len(), 32);
    }

    #[tokio::test]
    async fn test_offline_store() {
        let store = Store::default();
        store.set_online(false);
        assert_eq!(store.player("p1").await, Err(StoreError::Unavailable));
        assert_eq!(
            store.transaction(|tx| tx.rooms().len()).await,
            Err(StoreError::Unavailable)
        );

        store.set_online(true);
        assert!(store.player("p1").await.is_ok());
    }
}
