//! In-Process Ephemeral Store
//!
//! Implements EphemeralStore using DashMap. Used for development
//! deployments and tests; Redis is the shared store for real fleets.

use crate::domain::ports::{EphemeralStore, StoreError, WindowOutcome};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    /// Sorted-set of (score ms, member), ascending by insertion time
    Window(Vec<(u64, String)>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn empty_window() -> Self {
        Self {
            value: Value::Window(Vec::new()),
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

/// DashMap-backed ephemeral store.
///
/// Each entry lives in a DashMap shard; compound operations run while
/// holding the shard's write lock, which makes them atomic with respect
/// to other callers.
pub struct MemoryStore {
    entries: Arc<DashMap<String, Entry>>,
    available: AtomicBool,
    closed: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            available: AtomicBool::new(true),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Simulate the store going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove expired entries, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        purge(&self.entries, Instant::now())
    }

    /// Start the background task that reclaims expired entries.
    ///
    /// The task exits once the store is closed.
    pub fn start_gc(&self, interval: Duration) -> JoinHandle<()> {
        let entries = self.entries.clone();
        let closed = self.closed.clone();

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if closed.load(Ordering::SeqCst) {
                    break;
                }

                let removed = purge(&entries, Instant::now());
                if removed > 0 {
                    tracing::debug!("memory store GC removed {} expired entries", removed);
                }
            }
        })
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store closed".to_string()));
        }
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".to_string()))
        }
    }
}

/// Drop expired entries and return how many the sweep itself removed.
fn purge(entries: &DashMap<String, Entry>, now: Instant) -> usize {
    let mut removed = 0;
    entries.retain(|_, e| {
        let keep = !e.is_expired(now);
        if !keep {
            removed += 1;
        }
        keep
    });
    removed
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EphemeralStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.ensure_available()
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.ensure_available()?;
        let now = Instant::now();

        let expired = match self.entries.get(key) {
            None => return Ok(None),
            Some(entry) if entry.is_expired(now) => true,
            Some(entry) => match &entry.value {
                Value::Text(s) => return Ok(Some(s.clone())),
                Value::Window(_) => {
                    return Err(StoreError::Command(format!(
                        "WRONGTYPE {} does not hold a string",
                        key
                    )))
                }
            },
        };

        if expired {
            self.entries.remove_if(key, |_, e| e.is_expired(now));
        }
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.ensure_available()?;
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut removed = 0;
        for key in keys {
            if let Some((_, entry)) = self.entries.remove(key) {
                if !entry.is_expired(now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.ensure_available()?;
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .map(|e| !e.is_expired(now))
            .unwrap_or(false))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.ensure_available()?;
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !e.is_expired(now) && glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn sliding_window_admit(
        &self,
        key: &str,
        now_ms: u64,
        window: Duration,
        limit: u64,
    ) -> Result<WindowOutcome, StoreError> {
        self.ensure_available()?;
        let now = Instant::now();
        let cutoff = now_ms.saturating_sub(window.as_millis() as u64);
        let member = format!("{}-{}", now_ms, uuid::Uuid::new_v4());

        // The entry guard holds the shard lock for the whole prune/count/add.
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(Entry::empty_window);
        if entry.is_expired(now) {
            *entry = Entry::empty_window();
        }

        let outcome = match &mut entry.value {
            Value::Window(stamps) => {
                stamps.retain(|(score, _)| *score > cutoff);
                let count = stamps.len() as u64;
                if count < limit {
                    stamps.push((now_ms, member));
                    WindowOutcome {
                        admitted: true,
                        count: count + 1,
                        oldest_ms: None,
                    }
                } else {
                    WindowOutcome {
                        admitted: false,
                        count,
                        oldest_ms: stamps.iter().map(|(s, _)| *s).min(),
                    }
                }
            }
            Value::Text(_) => {
                return Err(StoreError::Command(format!(
                    "WRONGTYPE {} does not hold a sorted set",
                    key
                )))
            }
        };

        if outcome.admitted {
            entry.expires_at = Some(now + window);
        }
        Ok(outcome)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.entries.clear();
            tracing::info!("memory store closed");
        }
    }
}

/// Match `text` against a Redis-style glob.
///
/// `*` matches any run, `?` one char, `[abc]`, `[a-z]` and `[^abc]` a
/// class, and `\` escapes the next char (also inside a class).
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    // Pattern index after the last `*` and the text index it resumes from
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && p[pi] == '*' {
            star = Some((pi + 1, ti));
            pi += 1;
            continue;
        }
        if pi < p.len() {
            if let Some(next) = match_token(&p, pi, t[ti]) {
                pi = next;
                ti += 1;
                continue;
            }
        }
        match star {
            Some((resume, from)) => {
                pi = resume;
                ti = from + 1;
                star = Some((resume, from + 1));
            }
            None => return false,
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Match one non-`*` token at `pi` against `c`, returning the index past it.
fn match_token(p: &[char], pi: usize, c: char) -> Option<usize> {
    match p[pi] {
        '?' => Some(pi + 1),
        '\\' if pi + 1 < p.len() => (p[pi + 1] == c).then_some(pi + 2),
        '[' => match_class(p, pi + 1, c),
        literal => (literal == c).then_some(pi + 1),
    }
}

/// Match a `[...]` class whose body starts at `start`. An unterminated
/// class runs to the end of the pattern.
fn match_class(p: &[char], start: usize, c: char) -> Option<usize> {
    let mut i = start;
    let negate = p.get(i) == Some(&'^');
    if negate {
        i += 1;
    }

    let mut matched = false;
    while i < p.len() {
        match p[i] {
            ']' => {
                i += 1;
                break;
            }
            '\\' if i + 1 < p.len() => {
                matched |= p[i + 1] == c;
                i += 2;
            }
            lo if i + 2 < p.len() && p[i + 1] == '-' && p[i + 2] != ']' => {
                let hi = p[i + 2];
                let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
                matched |= lo <= c && c <= hi;
                i += 3;
            }
            member => {
                matched |= member == c;
                i += 1;
            }
        }
    }

    (matched != negate).then_some(i)
}
