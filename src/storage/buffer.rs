//! Batch write buffer
//!
//! Accumulates validated events and writes them to the store in bulk.
//!
//! ```text
//! append → pending batch ──(size threshold | interval tick)──▶ flush
//! flush: take batch → insert_events ──fail──▶ wait, retry same batch
//!                                    └─exhausted──▶ drop, log, drop hook
//! ```
//!
//! Appends only take a short lock on the pending batch; the store write
//! happens outside it, so intake never waits on the database.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::error::{StorageError, StorageResult};
use super::store::EventStore;
use super::types::{Event, InsertReport};
use crate::retry::RetryPolicy;

/// Write buffer configuration
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Pending events that trigger an immediate flush
    pub batch_size: usize,
    /// Periodic flush regardless of size
    pub flush_interval: Duration,
    /// Retries after a failed bulk write
    pub max_retries: u32,
    /// Fixed wait between retries
    pub retry_delay: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            flush_interval: Duration::from_millis(1000),
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
        }
    }
}

/// What `append` did with the event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Buffered,
    /// The batch reached the threshold and the flusher was woken
    FlushTriggered,
}

/// Result of one flush pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was pending
    Empty,
    Written(InsertReport),
    /// Every attempt failed; the batch was discarded
    Dropped { events: usize, error: String },
}

/// Counters exposed on the health endpoint
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct BufferStats {
    pub appended: u64,
    pub flushed: u64,
    pub duplicates_ignored: u64,
    pub dropped_batches: u64,
    pub dropped_events: u64,
    pub pending: usize,
}

/// Called with the events of a batch that could not be written
pub type DropHook = Box<dyn Fn(&[Event]) + Send + Sync>;

#[derive(Default)]
struct Pending {
    events: Vec<Event>,
    closed: bool,
}

#[derive(Default)]
struct Counters {
    appended: AtomicU64,
    flushed: AtomicU64,
    duplicates_ignored: AtomicU64,
    dropped_batches: AtomicU64,
    dropped_events: AtomicU64,
}

/// Deduplicated events waiting for a bulk write
pub struct BatchWriter {
    store: Arc<dyn EventStore>,
    config: BufferConfig,
    retry: RetryPolicy,
    pending: Mutex<Pending>,
    /// Serializes flushes so batches reach the store in order
    flush_lock: Mutex<()>,
    wake: Notify,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: Counters,
    on_drop: Option<DropHook>,
}

impl BatchWriter {
    pub fn new(store: Arc<dyn EventStore>, config: BufferConfig) -> Self {
        let retry = RetryPolicy::new(config.max_retries, config.retry_delay);
        Self {
            store,
            retry,
            pending: Mutex::new(Pending {
                events: Vec::with_capacity(config.batch_size),
                closed: false,
            }),
            config,
            flush_lock: Mutex::new(()),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
            counters: Counters::default(),
            on_drop: None,
        }
    }

    /// Builder method: observe batches lost after retries are exhausted
    pub fn with_drop_hook(mut self, hook: DropHook) -> Self {
        self.on_drop = Some(hook);
        self
    }

    /// Queue an event for the next flush
    pub async fn append(&self, event: Event) -> StorageResult<AppendOutcome> {
        let len = {
            let mut pending = self.pending.lock().await;
            if pending.closed {
                return Err(StorageError::BufferClosed);
            }
            pending.events.push(event);
            pending.events.len()
        };
        self.counters.appended.fetch_add(1, Ordering::Relaxed);

        if len >= self.config.batch_size {
            tracing::debug!(pending = len, "Batch threshold reached");
            self.wake.notify_one();
            Ok(AppendOutcome::FlushTriggered)
        } else {
            Ok(AppendOutcome::Buffered)
        }
    }

    /// Detach the pending batch and write it, retrying on failure
    pub async fn flush(&self) -> FlushOutcome {
        let _guard = self.flush_lock.lock().await;

        let batch = {
            let mut pending = self.pending.lock().await;
            std::mem::take(&mut pending.events)
        };

        if batch.is_empty() {
            return FlushOutcome::Empty;
        }

        let mut retry = self.retry.start();
        loop {
            match self.store.insert_events(&batch).await {
                Ok(report) => {
                    self.counters
                        .flushed
                        .fetch_add(report.inserted as u64, Ordering::Relaxed);
                    self.counters
                        .duplicates_ignored
                        .fetch_add(report.ignored as u64, Ordering::Relaxed);
                    tracing::debug!(
                        inserted = report.inserted,
                        ignored = report.ignored,
                        attempt = retry.failures() + 1,
                        "Flushed batch"
                    );
                    return FlushOutcome::Written(report);
                }
                Err(e) => match retry.record_failure() {
                    Some(delay) => {
                        tracing::warn!(
                            error = %e,
                            attempt = retry.failures(),
                            max_attempts = self.retry.max_attempts(),
                            events = batch.len(),
                            "Batch write failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        tracing::error!(
                            error = %e,
                            attempts = retry.failures(),
                            events = batch.len(),
                            "Batch write failed after all retries, dropping batch"
                        );
                        self.counters.dropped_batches.fetch_add(1, Ordering::Relaxed);
                        self.counters
                            .dropped_events
                            .fetch_add(batch.len() as u64, Ordering::Relaxed);
                        if let Some(hook) = &self.on_drop {
                            hook(&batch);
                        }
                        return FlushOutcome::Dropped {
                            events: batch.len(),
                            error: e.to_string(),
                        };
                    }
                },
            }
        }
    }

    /// Start the background flusher
    ///
    /// Flushes on every interval tick and whenever `append` reports the
    /// threshold. Stops on `drain`.
    pub async fn start(self: &Arc<Self>) {
        let writer = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(writer.config.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = writer.cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = writer.wake.notified() => {}
                }
                writer.flush().await;
            }

            tracing::debug!("Background flush stopped");
        });

        *self.worker.lock().await = Some(handle);
    }

    /// Stop accepting events, stop the flusher and write what remains
    pub async fn drain(&self) -> FlushOutcome {
        self.pending.lock().await.closed = true;
        self.cancel.cancel();

        if let Some(handle) = self.worker.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Background flush task failed");
            }
        }

        let outcome = self.flush().await;
        tracing::info!(outcome = ?outcome, "Write buffer drained");
        outcome
    }

    /// Drain, then release the store handle
    pub async fn shutdown(&self) -> StorageResult<()> {
        self.drain().await;
        self.store.close().await
    }

    pub async fn stats(&self) -> BufferStats {
        BufferStats {
            appended: self.counters.appended.load(Ordering::Relaxed),
            flushed: self.counters.flushed.load(Ordering::Relaxed),
            duplicates_ignored: self.counters.duplicates_ignored.load(Ordering::Relaxed),
            dropped_batches: self.counters.dropped_batches.load(Ordering::Relaxed),
            dropped_events: self.counters.dropped_events.load(Ordering::Relaxed),
            pending: self.pending.lock().await.events.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStore;
    use crate::testing::{sample_event, FlakyStore};
    use std::sync::Mutex as StdMutex;

    fn config(batch_size: usize) -> BufferConfig {
        BufferConfig {
            batch_size,
            // Long enough that only the threshold can trigger a flush
            flush_interval: Duration::from_secs(3600),
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
        }
    }

    async fn wait_for_count(store: &SqliteStore, expected: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if store.count_events().await.unwrap() == expected {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("store never reached expected count");
    }

    #[tokio::test]
    async fn test_tenth_append_triggers_flush() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let writer = Arc::new(BatchWriter::new(store.clone(), config(10)));
        writer.start().await;

        for seq in 1..10 {
            let outcome = writer.append(sample_event(1, seq, 6)).await.unwrap();
            assert_eq!(outcome, AppendOutcome::Buffered);
        }
        let outcome = writer.append(sample_event(1, 10, 6)).await.unwrap();
        assert_eq!(outcome, AppendOutcome::FlushTriggered);

        wait_for_count(&store, 10).await;
        assert_eq!(writer.stats().await.pending, 0);

        writer.drain().await;
    }

    #[tokio::test]
    async fn test_interval_flushes_partial_batch() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mut cfg = config(10);
        cfg.flush_interval = Duration::from_millis(20);
        let writer = Arc::new(BatchWriter::new(store.clone(), cfg));
        writer.start().await;

        writer.append(sample_event(1, 1, 20)).await.unwrap();
        writer.append(sample_event(1, 2, 20)).await.unwrap();

        wait_for_count(&store, 2).await;
        writer.drain().await;
    }

    #[tokio::test]
    async fn test_flush_empty() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let writer = BatchWriter::new(store, config(10));
        assert_eq!(writer.flush().await, FlushOutcome::Empty);
    }

    #[tokio::test]
    async fn test_flush_counts_ignored_duplicates() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let writer = BatchWriter::new(store, config(10));

        writer.append(sample_event(1, 1, 20)).await.unwrap();
        writer.append(sample_event(1, 1, 20)).await.unwrap();
        let outcome = writer.flush().await;

        assert_eq!(
            outcome,
            FlushOutcome::Written(InsertReport {
                inserted: 1,
                ignored: 1
            })
        );
        let stats = writer.stats().await;
        assert_eq!(stats.flushed, 1);
        assert_eq!(stats.duplicates_ignored, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_retried_then_dropped() {
        let store = Arc::new(FlakyStore::always_failing());
        let dropped = Arc::new(StdMutex::new(Vec::new()));
        let dropped_clone = Arc::clone(&dropped);

        let writer = BatchWriter::new(store.clone(), config(10)).with_drop_hook(Box::new(
            move |events: &[Event]| {
                dropped_clone
                    .lock()
                    .unwrap()
                    .extend(events.iter().map(|e| e.identity()));
            },
        ));

        writer.append(sample_event(7, 1, 20)).await.unwrap();
        writer.append(sample_event(7, 2, 20)).await.unwrap();

        let started = tokio::time::Instant::now();
        let outcome = writer.flush().await;

        assert!(matches!(outcome, FlushOutcome::Dropped { events: 2, .. }));
        // Initial attempt plus three retries, all with the same batch
        let attempts = store.insert_attempts();
        assert_eq!(attempts.len(), 4);
        assert!(attempts.iter().all(|batch| batch.len() == 2));
        // Three fixed waits between the four attempts
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(dropped.lock().unwrap().len(), 2);

        // Still accepting events afterwards
        let outcome = writer.append(sample_event(7, 3, 20)).await.unwrap();
        assert_eq!(outcome, AppendOutcome::Buffered);

        let stats = writer.stats().await;
        assert_eq!(stats.dropped_batches, 1);
        assert_eq!(stats.dropped_events, 2);
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_recovers() {
        let store = Arc::new(FlakyStore::failing_first(2));
        let writer = BatchWriter::new(store.clone(), config(10));

        writer.append(sample_event(7, 1, 20)).await.unwrap();
        let outcome = writer.flush().await;

        assert!(matches!(outcome, FlushOutcome::Written(r) if r.inserted == 1));
        assert_eq!(store.insert_attempts().len(), 3);
        assert_eq!(store.inner().count_events().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_append_during_retry_waits_for_next_flush() {
        let store = Arc::new(FlakyStore::failing_first(2));
        let writer = Arc::new(BatchWriter::new(store.clone(), config(10)));
        writer.append(sample_event(7, 1, 20)).await.unwrap();

        let flushing = Arc::clone(&writer);
        let first = tokio::spawn(async move { flushing.flush().await });

        // First attempt failed; the flush is now waiting out its retry delay
        while store.insert_attempts().is_empty() {
            tokio::task::yield_now().await;
        }
        let late = sample_event(7, 2, 20);
        writer.append(late.clone()).await.unwrap();

        let outcome = first.await.unwrap();
        assert!(matches!(outcome, FlushOutcome::Written(r) if r.inserted == 1));

        let attempts = store.insert_attempts();
        assert_eq!(attempts.len(), 3);
        assert!(attempts
            .iter()
            .all(|batch| batch == &vec![sample_event(7, 1, 20).identity()]));
        assert_eq!(writer.stats().await.pending, 1);

        let outcome = writer.flush().await;
        assert!(matches!(outcome, FlushOutcome::Written(r) if r.inserted == 1));
        assert_eq!(store.insert_attempts()[3], vec![late.identity()]);
        assert_eq!(store.inner().count_events().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_drain_flushes_and_closes_intake() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let writer = Arc::new(BatchWriter::new(store.clone(), config(10)));
        writer.start().await;

        writer.append(sample_event(1, 1, 20)).await.unwrap();
        writer.append(sample_event(1, 2, 20)).await.unwrap();

        let outcome = writer.drain().await;
        assert!(matches!(outcome, FlushOutcome::Written(r) if r.inserted == 2));
        assert_eq!(store.count_events().await.unwrap(), 2);

        let result = writer.append(sample_event(1, 3, 20)).await;
        assert!(matches!(result, Err(StorageError::BufferClosed)));
    }

    #[tokio::test]
    async fn test_shutdown_releases_store() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let writer = BatchWriter::new(store.clone(), config(10));
        writer.append(sample_event(1, 1, 20)).await.unwrap();

        writer.shutdown().await.unwrap();
        assert!(matches!(
            store.count_events().await,
            Err(StorageError::Closed)
        ));
    }
}
