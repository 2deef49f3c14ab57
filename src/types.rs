//! Shared types used across modules
//!
//! This module contains types that are used by multiple modules
//! to avoid circular dependencies.

use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Conversation identifier chosen by the client on join
pub type ConversationId = String;

/// Owner (user) identifier, taken from the JWT subject
pub type OwnerId = String;

/// Role of a transcript fragment
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "User"),
            Role::Assistant => write!(f, "Assistant"),
        }
    }
}

/// A single transcript fragment with its position in the conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationTurn {
    pub seq: u64,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Append-only transcript of a conversation
///
/// Sequence numbers are monotonic and never reused, even when old turns
/// are evicted from the in-memory window.
#[derive(Debug, Clone)]
pub struct Transcript {
    turns: VecDeque<ConversationTurn>,
    next_seq: u64,
    capacity: usize,
}

impl Transcript {
    pub fn new(capacity: usize) -> Self {
        Self {
            turns: VecDeque::with_capacity(capacity.min(256)),
            next_seq: 0,
            capacity: capacity.max(1),
        }
    }

    /// Append a fragment, returning the stored turn. Empty text is ignored.
    pub fn append(&mut self, role: Role, text: &str) -> Option<ConversationTurn> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let turn = ConversationTurn {
            seq: self.next_seq,
            role,
            text: text.to_string(),
            timestamp: Utc::now(),
        };
        self.next_seq += 1;
        self.turns.push_back(turn.clone());
        while self.turns.len() > self.capacity {
            self.turns.pop_front();
        }
        Some(turn)
    }

    /// Turns with a sequence number at or after `seq` (UI replay)
    pub fn since(&self, seq: u64) -> Vec<ConversationTurn> {
        self.turns.iter().filter(|t| t.seq >= seq).cloned().collect()
    }

    /// The most recent `n` turns, oldest first
    pub fn recent(&self, n: usize) -> Vec<ConversationTurn> {
        let skip = self.turns.len().saturating_sub(n);
        self.turns.iter().skip(skip).cloned().collect()
    }

    /// Compact digest used to rebuild model context after a reconnect
    pub fn digest(&self, n: usize) -> Option<String> {
        let recent = self.recent(n);
        if recent.is_empty() {
            return None;
        }
        let lines: Vec<String> = recent
            .iter()
            .map(|t| format!("{}: {}", t.role, t.text))
            .collect();
        Some(lines.join("\n"))
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new(200)
    }
}

/// A media item produced by a tool (e.g. a generated image)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaItem {
    pub id: String,
    pub kind: String,
    pub url: String,
    #[serde(default)]
    pub prompt: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MediaItem {
    /// Parse the `data.media` payload a tool returns. Accepts a single
    /// object or an array of objects; entries without a url are skipped.
    pub fn from_tool_data(data: &serde_json::Value) -> Vec<MediaItem> {
        let media = match data.get("media") {
            Some(m) => m,
            None => return Vec::new(),
        };
        let entries: Vec<&serde_json::Value> = match media {
            serde_json::Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };
        entries
            .into_iter()
            .filter_map(|m| {
                let url = m.get("url")?.as_str()?.to_string();
                Some(MediaItem {
                    id: m
                        .get("id")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                    kind: m
                        .get("kind")
                        .and_then(|v| v.as_str())
                        .unwrap_or("image")
                        .to_string(),
                    url,
                    prompt: m.get("prompt").and_then(|v| v.as_str()).map(str::to_string),
                    created_at: Utc::now(),
                })
            })
            .collect()
    }

    /// Case-insensitive match against prompt, kind and url
    pub fn matches(&self, query: &str) -> bool {
        let q = query.to_lowercase();
        self.kind.to_lowercase().contains(&q)
            || self.url.to_lowercase().contains(&q)
            || self
                .prompt
                .as_deref()
                .map(|p| p.to_lowercase().contains(&q))
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcript_sequence_is_monotonic() {
        let mut t = Transcript::new(2);
        t.append(Role::User, "one");
        t.append(Role::Assistant, "two");
        let third = t.append(Role::User, "three").unwrap();
        assert_eq!(third.seq, 2);
        assert_eq!(t.len(), 2);
        assert_eq!(t.since(0).first().unwrap().seq, 1);
    }

    #[test]
    fn test_transcript_ignores_empty_text() {
        let mut t = Transcript::default();
        assert!(t.append(Role::User, "   ").is_none());
        assert!(t.is_empty());
    }

    #[test]
    fn test_digest() {
        let mut t = Transcript::default();
        assert!(t.digest(4).is_none());
        t.append(Role::User, "hi");
        t.append(Role::Assistant, "hello there");
        assert_eq!(t.digest(4).unwrap(), "User: hi\nAssistant: hello there");
    }

    #[test]
    fn test_media_from_tool_data() {
        let data = serde_json::json!({
            "media": [
                {"url": "https://cdn/a.png", "prompt": "a red fox"},
                {"kind": "video"}
            ]
        });
        let items = MediaItem::from_tool_data(&data);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].kind, "image");
        assert!(items[0].matches("FOX"));
        assert!(MediaItem::from_tool_data(&serde_json::json!({"ok": true})).is_empty());
    }
}
