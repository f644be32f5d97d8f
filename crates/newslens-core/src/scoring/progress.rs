//! Per-article scoring progress with pub/sub subscribers.
//!
//! Each article under (or after) scoring has a mutable progress state and a
//! broadcast channel. Updates overlay non-empty patch fields, keep `percent`
//! monotone within a run, and fan out to subscribers without blocking —
//! slow subscribers lag out and are dropped by the channel. A background
//! sweeper removes terminal entries once they are old enough and nobody is
//! subscribed.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Broadcast buffer per article; laggards beyond this are dropped.
const SUBSCRIBER_BUFFER: usize = 32;

/// Lifecycle of one scoring run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressStatus {
    Queued,
    InProgress,
    Complete,
    Error,
}

impl ProgressStatus {
    /// Terminal states are sticky until the next run begins.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    /// Position in the state machine; transitions never go backwards.
    fn rank(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::InProgress => 1,
            Self::Complete | Self::Error => 2,
        }
    }
}

/// Snapshot of one article's scoring progress. In-memory only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressState {
    /// The article being scored.
    pub article_id: i64,
    /// Current lifecycle status.
    pub status: ProgressStatus,
    /// Human-oriented step label, e.g. `scoring:gpt-4o-mini`.
    pub step: String,
    /// Completion percentage, monotone within a run.
    pub percent: u8,
    /// Latest status message.
    pub message: String,
    /// Run-level error, set only with `status = Error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Composite score, set only with `status = Complete`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_score: Option<f64>,
    /// ISO-8601 UTC timestamp of the last update.
    pub last_updated: String,
}

impl ProgressState {
    fn fresh(article_id: i64) -> Self {
        Self {
            article_id,
            status: ProgressStatus::Queued,
            step: "queued".to_string(),
            percent: 0,
            message: String::new(),
            error: None,
            final_score: None,
            last_updated: now(),
        }
    }
}

/// Partial update overlaid onto the current state.
#[derive(Debug, Clone, Default)]
pub struct ProgressPatch {
    pub status: Option<ProgressStatus>,
    pub step: Option<String>,
    pub percent: Option<u8>,
    pub message: Option<String>,
    pub error: Option<String>,
    pub final_score: Option<f64>,
}

struct Entry {
    state: ProgressState,
    tx: broadcast::Sender<ProgressState>,
    touched: Instant,
}

impl Entry {
    fn new(article_id: i64) -> Self {
        let (tx, _rx) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            state: ProgressState::fresh(article_id),
            tx,
            touched: Instant::now(),
        }
    }
}

/// Registry of per-article progress states and their subscribers.
pub struct ProgressRegistry {
    inner: Mutex<HashMap<i64, Entry>>,
    retention: Duration,
}

impl ProgressRegistry {
    /// Create a registry retaining terminal entries for `retention` after
    /// their last update.
    pub fn new(retention: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            retention,
        }
    }

    /// Start a new run for `article_id`, resetting any previous terminal
    /// state while keeping existing subscribers attached.
    pub fn begin(&self, article_id: i64) {
        let mut map = self.lock();
        let entry = map.entry(article_id).or_insert_with(|| Entry::new(article_id));
        entry.state = ProgressState::fresh(article_id);
        entry.touched = Instant::now();
        let _ = entry.tx.send(entry.state.clone());
    }

    /// Overlay `patch` onto the current state and broadcast the result.
    ///
    /// Within a run the status never moves backwards and `percent` never
    /// decreases; updates after a terminal status are dropped.
    pub fn update(&self, article_id: i64, patch: ProgressPatch) {
        let mut map = self.lock();
        let entry = map.entry(article_id).or_insert_with(|| Entry::new(article_id));

        if entry.state.status.is_terminal() {
            tracing::debug!(article_id, "ignoring progress update after terminal status");
            return;
        }

        if let Some(status) = patch.status {
            if status.rank() >= entry.state.status.rank() {
                entry.state.status = status;
            }
        }
        if let Some(step) = patch.step {
            entry.state.step = step;
        }
        if let Some(percent) = patch.percent {
            entry.state.percent = entry.state.percent.max(percent.min(100));
        }
        if let Some(message) = patch.message {
            entry.state.message = message;
        }
        if patch.error.is_some() {
            entry.state.error = patch.error;
        }
        if patch.final_score.is_some() {
            entry.state.final_score = patch.final_score;
        }
        entry.state.last_updated = now();
        entry.touched = Instant::now();

        // Errors only mean there are no subscribers right now.
        let _ = entry.tx.send(entry.state.clone());
    }

    /// Subscribe to an article's progress: the current snapshot plus a
    /// receiver for every subsequent update. Creates a `Queued` placeholder
    /// when no run has touched the article yet.
    pub fn subscribe(&self, article_id: i64) -> (ProgressState, broadcast::Receiver<ProgressState>) {
        let mut map = self.lock();
        let entry = map.entry(article_id).or_insert_with(|| Entry::new(article_id));
        (entry.state.clone(), entry.tx.subscribe())
    }

    /// Current snapshot, if the article is (or recently was) tracked.
    pub fn get(&self, article_id: i64) -> Option<ProgressState> {
        self.lock().get(&article_id).map(|e| e.state.clone())
    }

    /// Remove entries that are terminal, older than the retention window,
    /// and have no subscribers.
    pub fn sweep(&self) {
        let retention = self.retention;
        self.lock().retain(|_, entry| {
            !(entry.state.status.is_terminal()
                && entry.touched.elapsed() > retention
                && entry.tx.receiver_count() == 0)
        });
    }

    /// Number of tracked articles.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn the periodic sweeper. Runs until `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        cadence: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        tracing::debug!("progress sweeper cancelled");
                        return;
                    }
                    () = tokio::time::sleep(cadence) => {}
                }
                registry.sweep();
            }
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, Entry>> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn now() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}
