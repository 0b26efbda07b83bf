// ABOUTME: Short-lived guard against duplicate deliveries and accidental command resubmission
// ABOUTME: Two independent guards (message-id replay, per-user repeat) with scheduled eviction and a size cap

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Window lengths and size cap for the deduplication cache
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// How long an exact message id is remembered
    pub message_ttl: Duration,
    /// How long the same user may not repeat the same command text
    pub repeat_window: Duration,
    /// Hard cap on remembered entries
    pub max_entries: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            message_ttl: Duration::from_secs(2),
            repeat_window: Duration::from_secs(2),
            max_entries: 10_000,
        }
    }
}

/// Outcome of a dedup check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupVerdict {
    Accept,
    /// Same message id already seen within the TTL
    Replay,
    /// Same user sent the same command text within the repeat window
    Repeat,
}

impl DedupVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Replay => "replay",
            Self::Repeat => "repeat",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DedupKey {
    Message(String),
    Repeat { user: String, text: String },
}

#[derive(Default)]
struct DedupState {
    entries: HashMap<DedupKey, Instant>,
    /// Insertion order, used for eviction. May hold stale keys that were re-inserted.
    order: VecDeque<(DedupKey, Instant)>,
}

/// Thread-safe dedup cache. Entries leave only through [`DeduplicationCache::evict_expired`]
/// or the size cap, never on read.
pub struct DeduplicationCache {
    config: DedupConfig,
    state: Mutex<DedupState>,
}

/// Lower-case and collapse whitespace so "!Roll  2d6" repeats "!roll 2d6"
pub fn normalize_command_text(text: &str) -> String {
    text.split_whitespace()
        .map(|part| part.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

impl DeduplicationCache {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            state: Mutex::new(DedupState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, DedupState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ttl_for(&self, key: &DedupKey) -> Duration {
        match key {
            DedupKey::Message(_) => self.config.message_ttl,
            DedupKey::Repeat { .. } => self.config.repeat_window,
        }
    }

    /// True when the submission should be processed; records it if so
    pub fn should_process(&self, user_id: &str, command_text: &str, message_id: Option<&str>) -> bool {
        self.check(user_id, command_text, message_id) == DedupVerdict::Accept
    }

    /// Like [`Self::should_process`] but reports which guard rejected
    pub fn check(&self, user_id: &str, command_text: &str, message_id: Option<&str>) -> DedupVerdict {
        self.check_at(user_id, command_text, message_id, Instant::now())
    }

    fn check_at(
        &self,
        user_id: &str,
        command_text: &str,
        message_id: Option<&str>,
        now: Instant,
    ) -> DedupVerdict {
        let id_key = message_id
            .filter(|id| !id.is_empty())
            .map(|id| DedupKey::Message(id.to_string()));
        let repeat_key = DedupKey::Repeat {
            user: user_id.to_string(),
            text: normalize_command_text(command_text),
        };

        let mut state = self.state();

        if let Some(key) = &id_key {
            if self.is_fresh(&state, key, now) {
                return DedupVerdict::Replay;
            }
        }
        if self.is_fresh(&state, &repeat_key, now) {
            return DedupVerdict::Repeat;
        }

        if let Some(key) = id_key {
            self.insert(&mut state, key, now);
        }
        self.insert(&mut state, repeat_key, now);
        DedupVerdict::Accept
    }

    fn is_fresh(&self, state: &DedupState, key: &DedupKey, now: Instant) -> bool {
        state
            .entries
            .get(key)
            .is_some_and(|seen| now.saturating_duration_since(*seen) < self.ttl_for(key))
    }

    fn insert(&self, state: &mut DedupState, key: DedupKey, now: Instant) {
        if state.entries.len() >= self.config.max_entries {
            self.evict_locked(state, now);
        }
        while state.entries.len() >= self.config.max_entries {
            let Some((oldest, stamp)) = state.order.pop_front() else {
                break;
            };
            if state.entries.get(&oldest) == Some(&stamp) {
                state.entries.remove(&oldest);
                tracing::debug!("Dedup cache full, dropped oldest entry");
            }
        }
        state.entries.insert(key.clone(), now);
        state.order.push_back((key, now));
    }

    fn evict_locked(&self, state: &mut DedupState, now: Instant) -> usize {
        let mut removed = 0;
        while let Some((key, stamp)) = state.order.front() {
            if now.saturating_duration_since(*stamp) < self.ttl_for(key) {
                break;
            }
            let (key, stamp) = match state.order.pop_front() {
                Some(entry) => entry,
                None => break,
            };
            if state.entries.get(&key) == Some(&stamp) {
                state.entries.remove(&key);
                removed += 1;
            }
        }
        removed
    }

    /// Drop every entry whose window has elapsed. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let mut state = self.state();
        self.evict_locked(&mut state, Instant::now())
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run [`Self::evict_expired`] every `interval` until `cancel` fires
    pub fn spawn_eviction(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cache.evict_expired();
                        if removed > 0 {
                            tracing::trace!(removed, remaining = cache.len(), "Evicted dedup entries");
                        }
                    }
                }
            }
            tracing::debug!("Dedup eviction task stopped");
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> DeduplicationCache {
        DeduplicationCache::new(DedupConfig::default())
    }

    #[test]
    fn test_same_message_id_within_ttl_is_replay() {
        let cache = cache();
        let now = Instant::now();
        assert_eq!(cache.check_at("u1", "!roll 2d6", Some("m1"), now), DedupVerdict::Accept);
        // Different text so only the id guard can fire
        assert_eq!(
            cache.check_at("u2", "!other", Some("m1"), now + Duration::from_millis(500)),
            DedupVerdict::Replay
        );
    }

    #[test]
    fn test_message_id_accepted_after_ttl() {
        let cache = cache();
        let now = Instant::now();
        assert!(cache.check_at("u1", "!a", Some("m1"), now) == DedupVerdict::Accept);
        assert_eq!(
            cache.check_at("u2", "!b", Some("m1"), now + Duration::from_secs(3)),
            DedupVerdict::Accept
        );
    }

    #[test]
    fn test_same_user_same_text_within_window_is_repeat() {
        let cache = cache();
        let now = Instant::now();
        assert_eq!(cache.check_at("u1", "!roll 2d6", Some("m1"), now), DedupVerdict::Accept);
        assert_eq!(
            cache.check_at("u1", "!ROLL   2d6", Some("m2"), now + Duration::from_millis(800)),
            DedupVerdict::Repeat
        );
    }

    #[test]
    fn test_repeat_guard_is_per_user() {
        let cache = cache();
        let now = Instant::now();
        assert_eq!(cache.check_at("u1", "!roll", None, now), DedupVerdict::Accept);
        assert_eq!(cache.check_at("u2", "!roll", None, now), DedupVerdict::Accept);
    }

    #[test]
    fn test_rejected_submission_does_not_extend_window() {
        let cache = cache();
        let now = Instant::now();
        cache.check_at("u1", "!roll", None, now);
        assert_eq!(
            cache.check_at("u1", "!roll", None, now + Duration::from_millis(1500)),
            DedupVerdict::Repeat
        );
        assert_eq!(
            cache.check_at("u1", "!roll", None, now + Duration::from_millis(2100)),
            DedupVerdict::Accept
        );
    }

    #[test]
    fn test_reads_do_not_evict() {
        let cache = cache();
        let now = Instant::now();
        cache.check_at("u1", "!a", Some("m1"), now);
        assert_eq!(cache.len(), 2);
        cache.check_at("u1", "!a", Some("m1"), now + Duration::from_millis(10));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_expired_removes_old_entries() {
        let cache = cache();
        cache.check("u1", "!a", Some("m1"));
        assert_eq!(cache.len(), 2);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.evict_expired(), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.evict_expired(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_size_cap_drops_oldest() {
        let cache = DeduplicationCache::new(DedupConfig {
            max_entries: 4,
            ..DedupConfig::default()
        });
        let now = Instant::now();
        for i in 0..10 {
            let text = format!("!cmd{}", i);
            assert!(cache.check_at("u1", &text, None, now) == DedupVerdict::Accept);
            assert!(cache.len() <= 4);
        }
        // Newest entry is still remembered
        assert_eq!(cache.check_at("u1", "!cmd9", None, now), DedupVerdict::Repeat);
        // Oldest was dropped
        assert_eq!(cache.check_at("u1", "!cmd0", None, now), DedupVerdict::Accept);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_task_stops_on_cancel() {
        let cache = Arc::new(cache());
        let cancel = CancellationToken::new();
        let handle = cache.spawn_eviction(Duration::from_millis(100), cancel.clone());

        cache.check("u1", "!a", None);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(cache.is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_normalize_command_text() {
        assert_eq!(normalize_command_text("  !Roll\t 2D6 "), "!roll 2d6");
    }
}
