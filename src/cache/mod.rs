//! In-memory TTL cache of worker answers.
//!
//! # Design
//!
//! - Keys are SHA-256 digests of the normalized question, a bounded slice of
//!   recent history, and the detail mode (see [`CacheKey`])
//! - Expired entries are invisible to reads and purged lazily
//! - When the item bound is exceeded, expired entries go first, then the
//!   entries closest to expiry
//! - A TTL of zero disables the cache
//! - Nothing is persisted; the cache dies with the process

mod hash;
pub use hash::compute_hash;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;

use crate::worker::protocol::{AskRequest, DetailMode, HistoryTurn};

/// Number of trailing history turns that take part in the key.
pub const KEY_HISTORY_TURNS: usize = 3;

/// Characters kept from each history field in the key.
pub const KEY_TURN_CHARS: usize = 240;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    expires_at: Instant,
}

/// TTL-bounded response cache.
#[derive(Debug)]
pub struct ResponseCache {
    ttl: Duration,
    max_items: usize,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ResponseCache {
    pub fn new(ttl: Duration, max_items: usize) -> Self {
        Self {
            ttl,
            max_items,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Whether caching is switched on at all.
    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero() && self.max_items > 0
    }

    /// Get a copy of a live entry.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.get_at(key, Instant::now())
    }

    /// Store a value, evicting as needed to respect the item bound.
    pub fn set(&self, key: impl Into<String>, value: &Value) {
        self.set_at(key.into(), value, Instant::now());
    }

    /// Drop every entry.
    pub fn clear(&self) -> usize {
        let mut entries = lock(&self.entries);
        let removed = entries.len();
        entries.clear();
        removed
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get_at(&self, key: &str, now: Instant) -> Option<Value> {
        if !self.is_enabled() {
            return None;
        }
        let mut entries = lock(&self.entries);
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn set_at(&self, key: String, value: &Value, now: Instant) {
        if !self.is_enabled() {
            return;
        }
        let mut entries = lock(&self.entries);
        entries.insert(
            key,
            CacheEntry {
                value: value.clone(),
                expires_at: now + self.ttl,
            },
        );
        if entries.len() > self.max_items {
            entries.retain(|_, entry| entry.expires_at > now);
        }
        while entries.len() > self.max_items {
            let Some(oldest) = entries
                .iter()
                .min_by(|a, b| a.1.expires_at.cmp(&b.1.expires_at).then(a.0.cmp(b.0)))
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            entries.remove(&oldest);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Helper for generating cache keys.
pub struct CacheKey;

#[derive(Serialize)]
struct AskKeyParts<'a> {
    question: String,
    history: Vec<(String, String)>,
    mode: &'a str,
}

impl CacheKey {
    /// Key for an `ask` request.
    pub fn ask(request: &AskRequest) -> String {
        Self::for_question(&request.question, &request.history, request.mode)
    }

    /// Key from the parts that determine an answer.
    pub fn for_question(question: &str, history: &[HistoryTurn], mode: DetailMode) -> String {
        let start = history.len().saturating_sub(KEY_HISTORY_TURNS);
        let parts = AskKeyParts {
            question: normalize(question, usize::MAX),
            history: history[start..]
                .iter()
                .map(|turn| {
                    (
                        normalize(&turn.question, KEY_TURN_CHARS),
                        normalize(&turn.answer, KEY_TURN_CHARS),
                    )
                })
                .collect(),
            mode: mode.as_str(),
        };
        // Serializing a struct of strings cannot fail.
        let digest = compute_hash(&parts).unwrap_or_default();
        format!("ask:{digest}")
    }
}

fn normalize(text: &str, max_chars: usize) -> String {
    text.trim().to_lowercase().chars().take(max_chars).collect()
}
