//! Per-user fragment buffering with a resettable silence timer and hard
//! count/window ceilings.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::config::Config;

#[derive(Debug, Clone, Copy)]
pub struct BufferSettings {
    pub silence: Duration,
    pub max_count: usize,
    pub max_window: Duration,
}

impl BufferSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            silence: Duration::from_millis(config.fragment_silence_ms),
            max_count: config.fragment_max_count.max(1),
            max_window: Duration::from_millis(config.fragment_max_window_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Silence,
    MaxCount,
    MaxWindow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Idle,
    Buffering,
}

#[derive(Debug, Clone)]
pub struct FlushedBatch {
    pub user_key: String,
    pub fragments: Vec<String>,
    pub first_seen_at: Instant,
    pub reason: FlushReason,
}

pub type FlushHandler = Arc<dyn Fn(FlushedBatch) + Send + Sync>;

struct BufferEntry {
    fragments: Vec<String>,
    first_seen_at: Instant,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

type EntryMap = Arc<Mutex<HashMap<String, BufferEntry>>>;

fn lock_entries(
    entries: &Mutex<HashMap<String, BufferEntry>>,
) -> MutexGuard<'_, HashMap<String, BufferEntry>> {
    match entries.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// At most one entry per user. Every push bumps the entry's generation; a
/// timer only flushes when its generation is still current, so a superseded
/// timer that already woke up cannot deliver twice.
pub struct FragmentBuffer {
    settings: BufferSettings,
    entries: EntryMap,
    generation: AtomicU64,
}

impl FragmentBuffer {
    pub fn new(settings: BufferSettings) -> Self {
        Self {
            settings,
            entries: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    pub fn state(&self, user_key: &str) -> BufferState {
        if lock_entries(&self.entries).contains_key(user_key) {
            BufferState::Buffering
        } else {
            BufferState::Idle
        }
    }

    pub fn pending_count(&self, user_key: &str) -> usize {
        lock_entries(&self.entries)
            .get(user_key)
            .map(|e| e.fragments.len())
            .unwrap_or(0)
    }

    /// Adds a fragment. `on_flush` runs exactly once per buffer lifetime,
    /// either inline (ceiling reached) or from the timer task.
    pub fn push(&self, user_key: &str, text: &str, on_flush: FlushHandler) {
        let now = Instant::now();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;

        let immediate = {
            let mut entries = lock_entries(&self.entries);
            let entry = entries
                .entry(user_key.to_string())
                .or_insert_with(|| BufferEntry {
                    fragments: Vec::new(),
                    first_seen_at: now,
                    generation,
                    timer: None,
                });
            entry.fragments.push(text.to_string());
            entry.generation = generation;
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }

            let reason = if entry.fragments.len() >= self.settings.max_count {
                Some(FlushReason::MaxCount)
            } else if now.duration_since(entry.first_seen_at) >= self.settings.max_window {
                Some(FlushReason::MaxWindow)
            } else {
                None
            };

            match reason {
                Some(reason) => entries.remove(user_key).map(|entry| FlushedBatch {
                    user_key: user_key.to_string(),
                    fragments: entry.fragments,
                    first_seen_at: entry.first_seen_at,
                    reason,
                }),
                None => {
                    let window_end = entry.first_seen_at + self.settings.max_window;
                    let silence_end = now + self.settings.silence;
                    let (deadline, reason) = if window_end <= silence_end {
                        (window_end, FlushReason::MaxWindow)
                    } else {
                        (silence_end, FlushReason::Silence)
                    };
                    entry.timer = Some(spawn_timer(
                        Arc::clone(&self.entries),
                        user_key.to_string(),
                        generation,
                        deadline,
                        reason,
                        Arc::clone(&on_flush),
                    ));
                    None
                }
            }
        };

        if let Some(batch) = immediate {
            debug!(
                user = %batch.user_key,
                fragments = batch.fragments.len(),
                reason = ?batch.reason,
                "fragment buffer flushed"
            );
            on_flush(batch);
        }
    }
}

fn spawn_timer(
    entries: EntryMap,
    user_key: String,
    generation: u64,
    deadline: Instant,
    reason: FlushReason,
    on_flush: FlushHandler,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep_until(deadline).await;
        let batch = {
            let mut map = lock_entries(&entries);
            let current = map
                .get(&user_key)
                .is_some_and(|entry| entry.generation == generation);
            if current {
                map.remove(&user_key).map(|entry| FlushedBatch {
                    user_key: user_key.clone(),
                    fragments: entry.fragments,
                    first_seen_at: entry.first_seen_at,
                    reason,
                })
            } else {
                None
            }
        };
        if let Some(batch) = batch {
            debug!(
                user = %batch.user_key,
                fragments = batch.fragments.len(),
                reason = ?batch.reason,
                "fragment buffer flushed"
            );
            on_flush(batch);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn settings() -> BufferSettings {
        BufferSettings {
            silence: Duration::from_secs(15),
            max_count: 16,
            max_window: Duration::from_secs(60),
        }
    }

    fn collector() -> (FlushHandler, mpsc::UnboundedReceiver<FlushedBatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: FlushHandler = Arc::new(move |batch| {
            let _ = tx.send(batch);
        });
        (handler, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fragments_within_silence_flush_once_in_order() {
        let buffer = FragmentBuffer::new(settings());
        let (handler, mut rx) = collector();

        buffer.push("messenger:1", "ซีลาย", Arc::clone(&handler));
        tokio::time::sleep(Duration::from_secs(5)).await;
        buffer.push("messenger:1", "26", Arc::clone(&handler));
        tokio::time::sleep(Duration::from_secs(14)).await;
        buffer.push("messenger:1", "เบา", Arc::clone(&handler));
        assert!(rx.try_recv().is_err());
        assert_eq!(buffer.state("messenger:1"), BufferState::Buffering);

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.fragments, vec!["ซีลาย", "26", "เบา"]);
        assert_eq!(batch.reason, FlushReason::Silence);
        assert_eq!(buffer.state("messenger:1"), BufferState::Idle);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_is_measured_from_latest_push() {
        let buffer = FragmentBuffer::new(settings());
        let (handler, mut rx) = collector();
        let start = Instant::now();

        buffer.push("u", "a", Arc::clone(&handler));
        tokio::time::sleep(Duration::from_secs(10)).await;
        buffer.push("u", "b", Arc::clone(&handler));

        let batch = rx.recv().await.unwrap();
        assert_eq!(Instant::now().duration_since(start), Duration::from_secs(25));
        assert_eq!(batch.fragments.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_count_flushes_immediately() {
        let buffer = FragmentBuffer::new(BufferSettings {
            max_count: 3,
            ..settings()
        });
        let (handler, mut rx) = collector();

        for text in ["a", "b", "c"] {
            buffer.push("u", text, Arc::clone(&handler));
        }
        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.fragments, vec!["a", "b", "c"]);
        assert_eq!(batch.reason, FlushReason::MaxCount);
        assert_eq!(buffer.state("u"), BufferState::Idle);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_caps_silence_resets() {
        let buffer = FragmentBuffer::new(settings());
        let (handler, mut rx) = collector();
        let start = Instant::now();

        buffer.push("u", "first", Arc::clone(&handler));
        tokio::time::sleep(Duration::from_secs(50)).await;
        buffer.push("u", "second", Arc::clone(&handler));

        let batch = rx.recv().await.unwrap();
        assert_eq!(Instant::now().duration_since(start), Duration::from_secs(60));
        assert_eq!(batch.reason, FlushReason::MaxWindow);
        assert_eq!(batch.fragments, vec!["first", "second"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_users_are_independent() {
        let buffer = FragmentBuffer::new(BufferSettings {
            max_count: 2,
            ..settings()
        });
        let (handler, mut rx) = collector();

        buffer.push("a", "1", Arc::clone(&handler));
        buffer.push("b", "1", Arc::clone(&handler));
        buffer.push("a", "2", Arc::clone(&handler));

        let first = rx.try_recv().unwrap();
        assert_eq!(first.user_key, "a");
        assert_eq!(buffer.state("b"), BufferState::Buffering);
        assert_eq!(buffer.pending_count("b"), 1);

        let second = rx.recv().await.unwrap();
        assert_eq!(second.user_key, "b");
        assert_eq!(second.fragments, vec!["1"]);
    }
}
