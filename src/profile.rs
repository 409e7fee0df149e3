//! Identity and profile collaborators.
//!
//! The core only reads display snapshots when seating a participant and
//! bumps aggregate counters when a match ends. Bots come from a separate
//! roster so they never touch the profile service.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::state::player::PlayerId;
use crate::state::room::{Participant, Personality, PlayerStats};

/// Profile service contract.
#[async_trait]
pub trait ProfileService: Send + Sync {
    /// Display snapshot used to seat a player, if the profile exists.
    async fn snapshot(&self, player_id: &str) -> Option<Participant>;

    async fn record_match_win(&self, player_id: &str);

    async fn record_match_loss(&self, player_id: &str);

    async fn record_game_played(&self, player_id: &str);
}

#[derive(Debug, Clone)]
struct Profile {
    display_name: String,
    avatar_url: Option<String>,
    stats: PlayerStats,
}

/// In-memory profile store.
#[derive(Debug, Default)]
pub struct MemoryProfiles {
    profiles: RwLock<HashMap<PlayerId, Profile>>,
}

impl MemoryProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<PlayerId, Profile>> {
        self.profiles.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<PlayerId, Profile>> {
        self.profiles.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, player_id: &str, display_name: &str, avatar_url: Option<String>) {
        self.write().insert(
            player_id.to_string(),
            Profile {
                display_name: display_name.to_string(),
                avatar_url,
                stats: PlayerStats::default(),
            },
        );
    }

    pub fn stats(&self, player_id: &str) -> Option<PlayerStats> {
        self.read().get(player_id).map(|p| p.stats.clone())
    }

    fn bump(&self, player_id: &str, f: impl FnOnce(&mut PlayerStats)) {
        match self.write().get_mut(player_id) {
            Some(profile) => f(&mut profile.stats),
            None => log::debug!("[profiles] no profile for {}", player_id),
        }
    }
}

#[async_trait]
impl ProfileService for MemoryProfiles {
    async fn snapshot(&self, player_id: &str) -> Option<Participant> {
        self.read().get(player_id).map(|p| Participant {
            player_id: player_id.to_string(),
            display_name: p.display_name.clone(),
            avatar_url: p.avatar_url.clone(),
            stats: p.stats.clone(),
            controller: Default::default(),
        })
    }

    async fn record_match_win(&self, player_id: &str) {
        self.bump(player_id, |s| s.wins += 1);
    }

    async fn record_match_loss(&self, player_id: &str) {
        self.bump(player_id, |s| s.losses += 1);
    }

    async fn record_game_played(&self, player_id: &str) {
        self.bump(player_id, |s| s.games_played += 1);
    }
}

/// Source of bot opponents.
pub trait BotRoster: Send + Sync {
    /// A fresh bot participant with its personality.
    fn pick(&self) -> Participant;
}

const BOT_NAMES: [&str; 6] = ["Rolly", "Dicey", "Lucky Lou", "Snake", "Boxcar", "Pip"];

/// Cycles through the built-in names and personality presets.
#[derive(Debug, Default)]
pub struct DefaultRoster {
    next: AtomicUsize,
}

impl DefaultRoster {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BotRoster for DefaultRoster {
    fn pick(&self) -> Participant {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        let personality = match n % 3 {
            0 => Personality::balanced(),
            1 => Personality::cautious(),
            _ => Personality::reckless(),
        };
        let mut bot = Participant::bot(
            format!("bot-{}", uuid::Uuid::new_v4()),
            BOT_NAMES[n % BOT_NAMES.len()],
            personality,
        );
        bot.stats = PlayerStats {
            games_played: 40 + (n as u32 * 7) % 60,
            wins: 20 + (n as u32 * 3) % 25,
            losses: 20 + (n as u32 * 5) % 25,
        };
        bot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_snapshot_and_counters() {
        let profiles = MemoryProfiles::new();
        assert!(profiles.snapshot("p1").await.is_none());

        profiles.register("p1", "Alice", None);
        profiles.record_match_win("p1").await;
        profiles.record_game_played("p1").await;
        profiles.record_match_loss("unknown").await;

        let snapshot = profiles.snapshot("p1").await.unwrap();
        assert_eq!(snapshot.display_name, "Alice");
        assert!(!snapshot.is_bot());
        assert_eq!(
            profiles.stats("p1").unwrap(),
            PlayerStats {
                games_played: 1,
                wins: 1,
                losses: 0
            }
        );
    }

    #[test]
    fn test_roster_cycles_personalities() {
        let roster = DefaultRoster::new();
        let picks: Vec<Participant> = (0..4).map(|_| roster.pick()).collect();

        assert!(picks.iter().all(|p| p.is_bot()));
        assert_ne!(picks[0].player_id, picks[3].player_id);
        let names: Vec<String> = picks
            .iter()
            .map(|p| match &p.controller {
                crate::state::room::Controller::Bot { personality } => personality.name.clone(),
                crate::state::room::Controller::Human => String::new(),
            })
            .collect();
        assert_eq!(names, vec!["balanced", "cautious", "reckless", "balanced"]);
    }
}
