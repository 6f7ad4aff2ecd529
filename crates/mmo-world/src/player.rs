//! Player records.

use std::collections::VecDeque;
use std::time::Duration;

use glam::DVec2;
use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;

/// Speech lines kept per player; the oldest is evicted first.
pub const SPEECH_CAPACITY: usize = 5;

/// One line a player said.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechEntry {
    /// What was said.
    pub text: String,
    /// Server time the line was accepted.
    pub spoken_at: Timestamp,
}

/// A participant in the shared world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    /// Globally unique identifier chosen at login.
    pub id: String,
    /// Cartesian position.
    pub position: DVec2,
    /// Most recent speech, oldest first, at most [`SPEECH_CAPACITY`] lines.
    pub speech: VecDeque<SpeechEntry>,
    /// Inactive players are treated as absent but keep their record so a
    /// reconnect can reactivate them.
    pub active: bool,
}

impl Player {
    /// A fresh, active player with no speech.
    pub fn new(id: impl Into<String>, position: DVec2) -> Self {
        Self {
            id: id.into(),
            position,
            speech: VecDeque::with_capacity(SPEECH_CAPACITY),
            active: true,
        }
    }

    /// Appends a speech line, evicting the oldest beyond [`SPEECH_CAPACITY`].
    ///
    /// An entry identical to one already held is ignored, so replaying the
    /// same `PlayerSpoke` (e.g. after a snapshot that already contains it)
    /// does not duplicate the line.
    pub fn push_speech(&mut self, entry: SpeechEntry) {
        if self.speech.contains(&entry) {
            return;
        }
        self.speech.push_back(entry);
        while self.speech.len() > SPEECH_CAPACITY {
            self.speech.pop_front();
        }
    }

    /// Speech lines younger than `ttl` at time `now`, oldest first.
    pub fn recent_speech(&self, now: Timestamp, ttl: Duration) -> impl Iterator<Item = &SpeechEntry> {
        self.speech
            .iter()
            .filter(move |entry| now.saturating_since(entry.spoken_at) < ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(text: &str, at: u64) -> SpeechEntry {
        SpeechEntry {
            text: text.to_string(),
            spoken_at: Timestamp(at),
        }
    }

    #[test]
    fn test_new_player_is_active_and_silent() {
        let p = Player::new("alice", DVec2::new(1.0, 2.0));
        assert!(p.active);
        assert!(p.speech.is_empty());
        assert_eq!(p.position, DVec2::new(1.0, 2.0));
    }

    #[test]
    fn test_speech_evicts_oldest_first() {
        let mut p = Player::new("alice", DVec2::ZERO);
        for i in 0..8u64 {
            p.push_speech(line(&format!("line {i}"), i));
        }
        assert_eq!(p.speech.len(), SPEECH_CAPACITY);
        let texts: Vec<_> = p.speech.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, ["line 3", "line 4", "line 5", "line 6", "line 7"]);
    }

    #[test]
    fn test_identical_speech_is_not_duplicated() {
        let mut p = Player::new("alice", DVec2::ZERO);
        p.push_speech(line("hi", 10));
        p.push_speech(line("hi", 10));
        p.push_speech(line("hi", 11));
        assert_eq!(p.speech.len(), 2);
    }

    #[test]
    fn test_recent_speech_prunes_expired_lines() {
        let mut p = Player::new("alice", DVec2::ZERO);
        p.push_speech(line("old", 0));
        p.push_speech(line("new", 4_000_000));
        let now = Timestamp(6_000_000);
        let visible: Vec<_> = p
            .recent_speech(now, Duration::from_secs(5))
            .map(|e| e.text.as_str())
            .collect();
        assert_eq!(visible, ["new"]);
        // Pruning is lazy: the record still holds both lines.
        assert_eq!(p.speech.len(), 2);
    }
}
