//! Single-flight cache for settled composite results.
//!
//! A concurrent map from fingerprint to either a settled outcome or a
//! pending-computation placeholder that waiters can await. Concurrent
//! rescore requests for the same article + config collapse into one
//! dispatch: the first caller becomes the owner, everyone else awaits the
//! owner's settle. Settled composites live for a bounded TTL; settled
//! errors for a much shorter negative TTL.

use super::CompositeScore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Pending slots older than this are treated as abandoned and evicted.
const STALE_PENDING: Duration = Duration::from_secs(3600);

/// Stable cache key over article content, config version, and prompt
/// variant; any config edit changes the version hash and with it the key.
pub fn fingerprint(content: &str, config_version: &str, variant_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hasher.update([0u8]);
    hasher.update(config_version.as_bytes());
    hasher.update([0u8]);
    hasher.update(variant_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// A settled cache value: the composite, or the run's stable failure.
#[derive(Debug, Clone)]
pub enum CacheOutcome {
    /// The run completed and produced a composite.
    Ready(CompositeScore),
    /// The run failed; replayed to coalesced callers until the negative
    /// TTL expires.
    Failed {
        /// Stable machine code of the original error.
        code: String,
        /// Human message of the original error.
        message: String,
    },
}

/// What `get_or_start` handed back.
pub enum Entry {
    /// No live entry existed; the caller owns the computation and must
    /// eventually [`ScoreCache::settle`] it.
    Owner,
    /// Another caller owns the computation (or it already settled); await
    /// the receiver via [`await_settled`].
    Waiter(watch::Receiver<Option<CacheOutcome>>),
}

struct Slot {
    tx: watch::Sender<Option<CacheOutcome>>,
    settled_at: Option<Instant>,
    error: bool,
    created_at: Instant,
}

impl Slot {
    fn expired(&self, ttl: Duration, error_ttl: Duration) -> bool {
        match self.settled_at {
            Some(at) => at.elapsed() > if self.error { error_ttl } else { ttl },
            None => self.created_at.elapsed() > STALE_PENDING,
        }
    }
}

/// Concurrent fingerprint → outcome map with single-flight semantics.
pub struct ScoreCache {
    inner: Mutex<HashMap<String, Slot>>,
    ttl: Duration,
    error_ttl: Duration,
}

impl ScoreCache {
    /// Create a cache with the given positive and negative TTLs.
    pub fn new(ttl: Duration, error_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl,
            error_ttl,
        }
    }

    /// Atomically fetch or create the entry for `fp`.
    ///
    /// Exactly one caller per live fingerprint observes `Entry::Owner`;
    /// expired entries count as absent.
    pub fn get_or_start(&self, fp: &str) -> Entry {
        let mut map = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if let Some(slot) = map.get(fp) {
            if !slot.expired(self.ttl, self.error_ttl) {
                return Entry::Waiter(slot.tx.subscribe());
            }
            map.remove(fp);
        }

        let (tx, _rx) = watch::channel(None);
        map.insert(
            fp.to_string(),
            Slot {
                tx,
                settled_at: None,
                error: false,
                created_at: Instant::now(),
            },
        );
        Entry::Owner
    }

    /// Settle the entry for `fp`, waking all waiters.
    pub fn settle(&self, fp: &str, outcome: CacheOutcome) {
        let mut map = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let error = matches!(outcome, CacheOutcome::Failed { .. });
        match map.get_mut(fp) {
            Some(slot) => {
                slot.settled_at = Some(Instant::now());
                slot.error = error;
                slot.tx.send_replace(Some(outcome));
            }
            None => {
                // The slot was purged while the run was in flight; re-insert
                // so immediate followers still hit the cache.
                let (tx, _rx) = watch::channel(Some(outcome));
                map.insert(
                    fp.to_string(),
                    Slot {
                        tx,
                        settled_at: Some(Instant::now()),
                        error,
                        created_at: Instant::now(),
                    },
                );
            }
        }
    }

    /// Drop expired entries. Called by the background sweeper.
    pub fn purge_expired(&self) {
        let mut map = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        map.retain(|_, slot| !slot.expired(self.ttl, self.error_ttl));
    }

    /// Number of live entries, pending included.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// True when the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Await a waiter's receiver until the owner settles.
pub async fn await_settled(mut rx: watch::Receiver<Option<CacheOutcome>>) -> CacheOutcome {
    loop {
        if let Some(outcome) = rx.borrow_and_update().clone() {
            return outcome;
        }
        if rx.changed().await.is_err() {
            return CacheOutcome::Failed {
                code: "cancelled".to_string(),
                message: "scoring run abandoned".to_string(),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::ScoreSource;

    fn composite(article_id: i64, score: f64) -> CompositeScore {
        CompositeScore {
            article_id,
            score,
            confidence: 0.8,
            source: ScoreSource::Ensemble,
            scored_at: "2026-03-01T00:00:00Z".to_string(),
        }
    }

    fn cache() -> ScoreCache {
        ScoreCache::new(Duration::from_secs(900), Duration::from_secs(30))
    }

    #[test]
    fn fingerprint_is_deterministic_and_component_sensitive() {
        let base = fingerprint("content", "v1", "prompt-a");
        assert_eq!(base, fingerprint("content", "v1", "prompt-a"));
        assert_ne!(base, fingerprint("content2", "v1", "prompt-a"));
        assert_ne!(base, fingerprint("content", "v2", "prompt-a"));
        assert_ne!(base, fingerprint("content", "v1", "prompt-b"));
    }

    #[test]
    fn first_caller_owns_followers_wait() {
        let cache = cache();
        assert!(matches!(cache.get_or_start("fp"), Entry::Owner));
        assert!(matches!(cache.get_or_start("fp"), Entry::Waiter(_)));
        assert!(matches!(cache.get_or_start("fp"), Entry::Waiter(_)));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn waiters_receive_the_settled_composite() {
        let cache = cache();
        assert!(matches!(cache.get_or_start("fp"), Entry::Owner));
        let Entry::Waiter(rx) = cache.get_or_start("fp") else {
            panic!("expected waiter");
        };

        let waiter = tokio::spawn(await_settled(rx));
        cache.settle("fp", CacheOutcome::Ready(composite(1, -0.5)));

        match waiter.await.expect("join") {
            CacheOutcome::Ready(c) => assert_eq!(c.score, -0.5),
            CacheOutcome::Failed { .. } => panic!("expected ready"),
        }
    }

    #[tokio::test]
    async fn settled_entry_served_without_recompute() {
        let cache = cache();
        assert!(matches!(cache.get_or_start("fp"), Entry::Owner));
        cache.settle("fp", CacheOutcome::Ready(composite(1, 0.25)));

        let Entry::Waiter(rx) = cache.get_or_start("fp") else {
            panic!("settled entry should not elect a new owner");
        };
        match await_settled(rx).await {
            CacheOutcome::Ready(c) => assert_eq!(c.score, 0.25),
            CacheOutcome::Failed { .. } => panic!("expected ready"),
        }
    }

    #[tokio::test]
    async fn expired_composite_elects_new_owner() {
        let cache = ScoreCache::new(Duration::from_millis(10), Duration::from_millis(10));
        assert!(matches!(cache.get_or_start("fp"), Entry::Owner));
        cache.settle("fp", CacheOutcome::Ready(composite(1, 0.1)));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(matches!(cache.get_or_start("fp"), Entry::Owner));
    }

    #[tokio::test]
    async fn failed_entry_replayed_until_negative_ttl() {
        let cache = ScoreCache::new(Duration::from_secs(900), Duration::from_millis(20));
        assert!(matches!(cache.get_or_start("fp"), Entry::Owner));
        cache.settle(
            "fp",
            CacheOutcome::Failed {
                code: "provider_unavailable".to_string(),
                message: "all models down".to_string(),
            },
        );

        let Entry::Waiter(rx) = cache.get_or_start("fp") else {
            panic!("expected waiter during negative TTL");
        };
        match await_settled(rx).await {
            CacheOutcome::Failed { code, .. } => assert_eq!(code, "provider_unavailable"),
            CacheOutcome::Ready(_) => panic!("expected failure"),
        }

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(matches!(cache.get_or_start("fp"), Entry::Owner));
    }

    #[tokio::test]
    async fn purge_drops_expired_entries() {
        let cache = ScoreCache::new(Duration::from_millis(10), Duration::from_millis(10));
        assert!(matches!(cache.get_or_start("a"), Entry::Owner));
        cache.settle("a", CacheOutcome::Ready(composite(1, 0.0)));
        assert!(matches!(cache.get_or_start("b"), Entry::Owner));

        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.purge_expired();
        assert_eq!(cache.len(), 1, "pending slot b must survive the purge");
    }
}
