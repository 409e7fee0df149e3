//! Presence tracking.
//!
//! Records the last heartbeat seen from each player. The reaper reads it to
//! decide whether every participant of a session has gone silent.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, TimeDelta, Utc};

use super::player::PlayerId;

/// Heartbeat source consumed by the reaper.
pub trait Presence: Send + Sync {
    /// Last heartbeat seen from a player, if any.
    fn last_seen(&self, player_id: &str) -> Option<DateTime<Utc>>;

    /// A player is disconnected when no heartbeat arrived within `threshold`.
    fn is_disconnected(&self, player_id: &str, now: DateTime<Utc>, threshold: TimeDelta) -> bool {
        match self.last_seen(player_id) {
            Some(seen) => now - seen > threshold,
            None => true,
        }
    }

    /// Forget players silent for longer than `threshold`, returning their ids.
    fn expire_stale(&self, now: DateTime<Utc>, threshold: TimeDelta) -> Vec<PlayerId>;
}

/// Connection status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Heartbeats arriving
    Connected,

    /// Client said goodbye or the transport dropped
    Disconnected { since: DateTime<Utc> },
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Presence of a single player.
#[derive(Debug, Clone)]
pub struct Connection {
    pub player_id: PlayerId,
    pub status: ConnectionStatus,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl Connection {
    pub fn new(player_id: PlayerId, now: DateTime<Utc>) -> Self {
        Self {
            player_id,
            status: ConnectionStatus::Connected,
            connected_at: now,
            last_heartbeat: now,
        }
    }

    /// Record heartbeat, reviving a disconnected entry.
    pub fn heartbeat(&mut self, now: DateTime<Utc>) {
        self.status = ConnectionStatus::Connected;
        self.last_heartbeat = now;
    }

    pub fn disconnect(&mut self, now: DateTime<Utc>) {
        self.status = ConnectionStatus::Disconnected { since: now };
    }

    /// Time since the last heartbeat.
    pub fn silence(&self, now: DateTime<Utc>) -> TimeDelta {
        now - self.last_heartbeat
    }
}

/// In-memory presence tracker keyed by player id.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    connections: RwLock<HashMap<PlayerId, Connection>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<PlayerId, Connection>> {
        self.connections.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<PlayerId, Connection>> {
        self.connections.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a heartbeat now.
    pub fn heartbeat(&self, player_id: &str) {
        self.heartbeat_at(player_id, Utc::now());
    }

    /// Record a heartbeat at an explicit time.
    pub fn heartbeat_at(&self, player_id: &str, at: DateTime<Utc>) {
        let mut connections = self.write();
        connections
            .entry(player_id.to_string())
            .and_modify(|c| c.heartbeat(at))
            .or_insert_with(|| Connection::new(player_id.to_string(), at));
    }

    /// Mark a player as disconnected until their next heartbeat.
    pub fn disconnect(&self, player_id: &str) {
        let mut connections = self.write();
        if let Some(conn) = connections.get_mut(player_id) {
            conn.disconnect(Utc::now());
        }
    }

    pub fn get(&self, player_id: &str) -> Option<Connection> {
        let connections = self.read();
        connections.get(player_id).cloned()
    }
}

impl Presence for PresenceTracker {
    fn last_seen(&self, player_id: &str) -> Option<DateTime<Utc>> {
        self.get(player_id).map(|c| c.last_heartbeat)
    }

    /// An explicit disconnect counts at once; otherwise heartbeat silence decides.
    fn is_disconnected(&self, player_id: &str, now: DateTime<Utc>, threshold: TimeDelta) -> bool {
        match self.get(player_id) {
            Some(conn) if conn.status.is_connected() => conn.silence(now) > threshold,
            _ => true,
        }
    }

    fn expire_stale(&self, now: DateTime<Utc>, threshold: TimeDelta) -> Vec<PlayerId> {
        let mut connections = self.write();
        let expired: Vec<PlayerId> = connections
            .values()
            .filter(|c| c.silence(now) > threshold)
            .map(|c| c.player_id.clone())
            .collect();
        for id in &expired {
            connections.remove(id);
        }
        expired
    }
}
