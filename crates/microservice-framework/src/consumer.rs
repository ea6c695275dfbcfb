//! # Broker Consumers
//!
//! A [`BrokerConsumer`] is a lifecycle component that processes batches of raw
//! records pulled from named topics under a consumer-group identity. The consumer
//! itself only implements `process_batch`; the [`ConsumerRuntime`] owns the
//! subscription and the receive loop.
//!
//! # Architecture Note
//! The receive loop runs on its own task, separate from the lifecycle step that
//! started it. It is synchronized with the lifecycle only at the boundaries:
//!
//! 1. **Start**: start the consumer, subscribe, spawn the loop.
//! 2. **Stop**: cancel, wait for the loop to exit (an in-flight batch finishes and is
//!    committed first), stop the consumer.
//!
//! The loop owns the subscription and closes it on every exit path, so a halted
//! runtime leaves its group straight away and can be restarted under the same
//! consumer id. `stop` never returns while the loop can still call `process_batch`.
//!
//! # Batch Errors
//! A failed batch is never silently dropped: it is logged, counted, retained as
//! the runtime's last batch error, and then handled per [`BatchErrorPolicy`]:
//!
//! | policy | batch committed | loop | runtime state |
//! |--------|-----------------|------|---------------|
//! | `Halt` (default) | no | exits | `Error` |
//! | `Skip` | yes | continues | unchanged |
//! | `Retry { max_attempts }` | only if a later attempt succeeds | exits when attempts run out | `Error` when attempts run out |
//!
//! Under `Halt` the uncommitted records are redelivered to whichever group member
//! owns the partitions next, provided the broker redelivers uncommitted records
//! (the in-memory broker does).

use crate::backoff::BackoffPolicy;
use crate::component::{Lifecycle, LifecycleAction, LifecycleComponent};
use crate::config::ConsumerConfig;
use crate::error::{BatchProcessingError, BoxError, BrokerError};
use crate::monitor::ProgressMonitor;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

// =============================================================================
// CONTRACT
// =============================================================================

/// One raw message pulled from a topic partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRecord {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: Option<String>,
    pub payload: Bytes,
}

/// A partition of a topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: u32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// A lifecycle component that processes batches from broker topics.
///
/// `consumer_id`, `consumer_group_id` and `source_topic_names` are read once when
/// the runtime subscribes and must not change afterwards.
#[async_trait]
pub trait BrokerConsumer: LifecycleComponent {
    fn consumer_id(&self) -> &str;

    fn consumer_group_id(&self) -> &str;

    fn source_topic_names(&self) -> Vec<String>;

    /// Processes a non-empty batch in order. An error means the batch was not fully
    /// applied.
    async fn process_batch(&self, records: &[ConsumerRecord]) -> Result<(), BatchProcessingError>;
}

/// Message broker collaborator: hands out group subscriptions.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn subscribe(
        &self,
        group_id: &str,
        consumer_id: &str,
        topics: &[String],
    ) -> Result<Box<dyn BrokerSubscription>, BrokerError>;
}

/// One member's view of a consumer group.
#[async_trait]
pub trait BrokerSubscription: Send {
    /// Waits up to `timeout` for records from the assigned partitions. Returns an
    /// empty batch when nothing arrived.
    async fn poll(&mut self, max_records: usize, timeout: Duration) -> Result<Vec<ConsumerRecord>, BrokerError>;

    /// Marks `records` as applied for the group.
    async fn commit(&mut self, records: &[ConsumerRecord]) -> Result<(), BrokerError>;

    /// Leaves the group. Partitions are handed to the remaining members.
    async fn close(&mut self) -> Result<(), BrokerError>;

    fn assignment(&self) -> Vec<TopicPartition>;
}

/// What the runtime does when `process_batch` fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum BatchErrorPolicy {
    /// Leave the batch uncommitted, stop receiving, move the runtime to `Error`.
    #[default]
    Halt,
    /// Report the error, commit the batch, keep receiving.
    Skip,
    /// Re-run the batch with backoff; `max_attempts` counts every attempt,
    /// including the first. Halts when attempts run out.
    Retry { max_attempts: u32 },
}

// =============================================================================
// RUNTIME
// =============================================================================

#[derive(Default)]
struct StatsCounters {
    batches_processed: AtomicU64,
    records_processed: AtomicU64,
    batches_failed: AtomicU64,
    batches_skipped: AtomicU64,
    retries: AtomicU64,
}

/// Receive-loop counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub batches_processed: u64,
    pub records_processed: u64,
    pub batches_failed: u64,
    pub batches_skipped: u64,
    pub retries: u64,
}

struct RunningLoop {
    cancel: CancellationToken,
    exited: CancellationToken,
    handle: JoinHandle<Result<(), BrokerError>>,
}

/// Owns a [`BrokerConsumer`], its subscription, and its receive loop.
pub struct ConsumerRuntime {
    lifecycle: Lifecycle,
    consumer: Arc<dyn BrokerConsumer>,
    broker: Arc<dyn MessageBroker>,
    settings: ConsumerConfig,
    running: Mutex<Option<RunningLoop>>,
    stats: Arc<StatsCounters>,
    last_batch_error: Arc<Mutex<Option<BatchProcessingError>>>,
    self_ref: Weak<Self>,
}

impl ConsumerRuntime {
    pub fn new<C>(consumer: Arc<C>, broker: Arc<dyn MessageBroker>, settings: ConsumerConfig) -> Arc<Self>
    where
        C: BrokerConsumer + 'static,
    {
        let logger = tracing::info_span!(
            "consumer",
            consumer_id = consumer.consumer_id(),
            group = consumer.consumer_group_id()
        );
        let runtime = Arc::new_cyclic(|me| Self {
            lifecycle: Lifecycle::with_logger(format!("{} runtime", consumer.name()), logger),
            consumer: consumer.clone(),
            broker,
            settings,
            running: Mutex::new(None),
            stats: Arc::new(StatsCounters::default()),
            last_batch_error: Arc::new(Mutex::new(None)),
            self_ref: me.clone(),
        });
        crate::component::attach_child(&runtime, consumer);
        runtime
    }

    pub fn consumer(&self) -> &Arc<dyn BrokerConsumer> {
        &self.consumer
    }

    pub fn is_receiving(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.exited.is_cancelled())
    }

    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            batches_processed: self.stats.batches_processed.load(Ordering::SeqCst),
            records_processed: self.stats.records_processed.load(Ordering::SeqCst),
            batches_failed: self.stats.batches_failed.load(Ordering::SeqCst),
            batches_skipped: self.stats.batches_skipped.load(Ordering::SeqCst),
            retries: self.stats.retries.load(Ordering::SeqCst),
        }
    }

    /// The most recent batch failure, whatever the policy did with it.
    pub fn last_batch_error(&self) -> Option<BatchProcessingError> {
        self.last_batch_error.lock().clone()
    }

    /// Waits for the receive loop to exit on its own (for example after a halt).
    /// Returns immediately if no loop is running.
    pub async fn wait_for_halt(&self) {
        let exited = self.running.lock().as_ref().map(|r| r.exited.clone());
        if let Some(exited) = exited {
            exited.cancelled().await;
        }
    }
}

#[async_trait]
impl LifecycleComponent for ConsumerRuntime {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    async fn on_initialize(&self, monitor: &ProgressMonitor) -> Result<(), BoxError> {
        self.consumer.initialize(monitor).await?;
        Ok(())
    }

    async fn on_start(&self, monitor: &ProgressMonitor) -> Result<(), BoxError> {
        // A halted loop from the previous run has already left the group.
        if let Err(e) = self.join_loop().await {
            warn!(parent: self.lifecycle.logger(), error = %e, "Previous subscription did not close cleanly");
        }
        self.consumer.start(monitor).await?;

        let topics = self.consumer.source_topic_names();
        let subscription = match self
            .broker
            .subscribe(self.consumer.consumer_group_id(), self.consumer.consumer_id(), &topics)
            .await
        {
            Ok(s) => s,
            Err(e) => {
                // Undo the consumer start before reporting the failure.
                if let Err(stop) = self.consumer.stop(monitor).await {
                    warn!(parent: self.lifecycle.logger(), error = %stop, "Consumer failed to stop after subscribe error");
                }
                return Err(e.into());
            }
        };
        info!(parent: self.lifecycle.logger(), ?topics, assignment = ?subscription.assignment(), "Subscribed");

        let cancel = CancellationToken::new();
        let exited = CancellationToken::new();
        let receive = ReceiveLoop {
            consumer: self.consumer.clone(),
            owner: self.self_ref.clone(),
            stats: self.stats.clone(),
            last_batch_error: self.last_batch_error.clone(),
            policy: self.settings.error_policy,
            retry_backoff: self.settings.retry_backoff.into(),
            max_batch_size: self.settings.max_batch_size,
            poll_timeout: self.settings.poll_timeout(),
            cancel: cancel.clone(),
            exited: exited.clone(),
        };
        let handle = tokio::spawn(receive.run(subscription).instrument(self.lifecycle.logger().clone()));
        *self.running.lock() = Some(RunningLoop {
            cancel,
            exited,
            handle,
        });
        Ok(())
    }

    async fn on_stop(&self, monitor: &ProgressMonitor) -> Result<(), BoxError> {
        let close_result = self.join_loop().await;
        self.consumer.stop(monitor).await?;
        close_result?;
        Ok(())
    }
}

impl ConsumerRuntime {
    /// Cancels the receive loop, if any, and waits for it to exit. Returns the
    /// result of closing its subscription.
    async fn join_loop(&self) -> Result<(), BrokerError> {
        let Some(RunningLoop { cancel, handle, .. }) = self.running.lock().take() else {
            return Ok(());
        };
        cancel.cancel();
        match handle.await {
            Ok(closed) => closed,
            Err(e) => {
                // The subscription was dropped during unwinding, which ends membership.
                error!(parent: self.lifecycle.logger(), error = %e, "Receive loop panicked");
                Ok(())
            }
        }
    }
}

enum BatchOutcome {
    Applied,
    Skipped,
    Halted(BatchProcessingError),
    Abandoned,
}

struct ReceiveLoop {
    consumer: Arc<dyn BrokerConsumer>,
    owner: Weak<ConsumerRuntime>,
    stats: Arc<StatsCounters>,
    last_batch_error: Arc<Mutex<Option<BatchProcessingError>>>,
    policy: BatchErrorPolicy,
    retry_backoff: BackoffPolicy,
    max_batch_size: usize,
    poll_timeout: Duration,
    cancel: CancellationToken,
    exited: CancellationToken,
}

impl ReceiveLoop {
    async fn run(self, mut subscription: Box<dyn BrokerSubscription>) -> Result<(), BrokerError> {
        let _exited = self.exited.clone().drop_guard();
        let consumer_id = self.consumer.consumer_id().to_string();
        info!(%consumer_id, policy = ?self.policy, "Receive loop started");

        loop {
            let polled = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                polled = subscription.poll(self.max_batch_size, self.poll_timeout) => polled,
            };

            let records = match polled {
                Ok(records) => records,
                Err(e) => {
                    self.halt(BatchProcessingError::new(consumer_id.as_str(), e));
                    break;
                }
            };
            if records.is_empty() {
                continue;
            }
            debug!(%consumer_id, size = records.len(), first_offset = records[0].offset, "Batch received");

            match self.apply(&consumer_id, &records).await {
                BatchOutcome::Applied | BatchOutcome::Skipped => {
                    if let Err(e) = subscription.commit(&records).await {
                        self.halt(BatchProcessingError::new(consumer_id.as_str(), e));
                        break;
                    }
                }
                BatchOutcome::Halted(e) => {
                    self.halt(e);
                    break;
                }
                BatchOutcome::Abandoned => break,
            }
        }

        let closed = subscription.close().await;
        if let Err(e) = &closed {
            warn!(%consumer_id, error = %e, "Failed to close subscription");
        }
        info!(%consumer_id, "Receive loop exited");
        closed
    }

    async fn apply(&self, consumer_id: &str, records: &[ConsumerRecord]) -> BatchOutcome {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let err = match self.consumer.process_batch(records).await {
                Ok(()) => {
                    self.stats.batches_processed.fetch_add(1, Ordering::SeqCst);
                    self.stats
                        .records_processed
                        .fetch_add(records.len() as u64, Ordering::SeqCst);
                    return BatchOutcome::Applied;
                }
                Err(e) => e,
            };

            error!(consumer_id, attempt, error = %err, "Batch processing failed");
            self.stats.batches_failed.fetch_add(1, Ordering::SeqCst);
            *self.last_batch_error.lock() = Some(err.clone());

            match self.policy {
                BatchErrorPolicy::Halt => return BatchOutcome::Halted(err),
                BatchErrorPolicy::Skip => {
                    warn!(consumer_id, size = records.len(), "Skipping failed batch");
                    self.stats.batches_skipped.fetch_add(1, Ordering::SeqCst);
                    return BatchOutcome::Skipped;
                }
                BatchErrorPolicy::Retry { max_attempts } => {
                    if attempt >= max_attempts {
                        warn!(consumer_id, attempt, "Retry attempts exhausted");
                        return BatchOutcome::Halted(err);
                    }
                    let delay = self.retry_backoff.next(attempt - 1);
                    self.stats.retries.fetch_add(1, Ordering::SeqCst);
                    tokio::select! {
                        _ = self.cancel.cancelled() => return BatchOutcome::Abandoned,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn halt(&self, err: BatchProcessingError) {
        *self.last_batch_error.lock() = Some(err.clone());
        if let Some(runtime) = self.owner.upgrade() {
            runtime.lifecycle.fail(LifecycleAction::Start, Box::new(err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::component::LifecycleState;

    struct Collector {
        lifecycle: Lifecycle,
        seen: Mutex<Vec<String>>,
        fail_payload: Option<&'static str>,
    }

    impl Collector {
        fn new(fail_payload: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                lifecycle: Lifecycle::new("collector"),
                seen: Mutex::new(Vec::new()),
                fail_payload,
            })
        }
    }

    #[async_trait]
    impl LifecycleComponent for Collector {
        fn lifecycle(&self) -> &Lifecycle {
            &self.lifecycle
        }
    }

    #[async_trait]
    impl BrokerConsumer for Collector {
        fn consumer_id(&self) -> &str {
            "collector-1"
        }

        fn consumer_group_id(&self) -> &str {
            "group-1"
        }

        fn source_topic_names(&self) -> Vec<String> {
            vec!["events".to_string()]
        }

        async fn process_batch(&self, records: &[ConsumerRecord]) -> Result<(), BatchProcessingError> {
            assert!(!records.is_empty());
            for (i, record) in records.iter().enumerate() {
                let text = String::from_utf8_lossy(&record.payload).to_string();
                if Some(text.as_str()) == self.fail_payload {
                    return Err(BatchProcessingError::at("collector-1", i, "poison message"));
                }
                self.seen.lock().push(text);
            }
            Ok(())
        }
    }

    fn settings(policy: BatchErrorPolicy) -> ConsumerConfig {
        ConsumerConfig {
            poll_timeout_ms: 20,
            error_policy: policy,
            ..ConsumerConfig::default()
        }
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_runtime_processes_and_commits() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.create_topic("events", 1);
        let consumer = Collector::new(None);
        let runtime = ConsumerRuntime::new(consumer.clone(), broker.clone(), settings(BatchErrorPolicy::Halt));
        let monitor = ProgressMonitor::new("test");

        runtime.initialize(&monitor).await.unwrap();
        runtime.start(&monitor).await.unwrap();
        assert_eq!(consumer.state(), LifecycleState::Started);

        broker.publish("events", None, "a").unwrap();
        broker.publish("events", None, "b").unwrap();
        wait_until(|| consumer.seen.lock().len() == 2).await;
        wait_until(|| broker.committed("group-1", "events", 0) == Some(2)).await;

        runtime.stop(&monitor).await.unwrap();
        assert!(!runtime.is_receiving());
        assert_eq!(consumer.state(), LifecycleState::Stopped);
        assert_eq!(runtime.stats().records_processed, 2);
        assert!(broker.members("group-1").is_empty());
    }

    #[tokio::test]
    async fn test_halt_leaves_batch_uncommitted_and_fails_runtime() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.create_topic("events", 1);
        let consumer = Collector::new(Some("bad"));
        let runtime = ConsumerRuntime::new(consumer.clone(), broker.clone(), settings(BatchErrorPolicy::Halt));
        let monitor = ProgressMonitor::new("test");

        broker.publish("events", None, "bad").unwrap();
        runtime.initialize(&monitor).await.unwrap();
        runtime.start(&monitor).await.unwrap();

        runtime.wait_for_halt().await;
        assert_eq!(runtime.state(), LifecycleState::Error);
        assert_eq!(runtime.last_batch_error().unwrap().record_index, Some(0));
        assert_eq!(broker.committed("group-1", "events", 0), None);

        runtime.stop(&monitor).await.unwrap();
        assert_eq!(runtime.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_halted_runtime_can_restart() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.create_topic("events", 1);
        let consumer = Collector::new(Some("bad"));
        let runtime = ConsumerRuntime::new(consumer.clone(), broker.clone(), settings(BatchErrorPolicy::Halt));
        let monitor = ProgressMonitor::new("test");

        broker.publish("events", None, "bad").unwrap();
        runtime.initialize(&monitor).await.unwrap();
        runtime.start(&monitor).await.unwrap();
        runtime.wait_for_halt().await;

        // The halted loop has already left the group.
        assert_eq!(runtime.state(), LifecycleState::Error);
        assert!(broker.members("group-1").is_empty());

        runtime.initialize(&monitor).await.unwrap();
        runtime.start(&monitor).await.unwrap();
        assert_eq!(runtime.state(), LifecycleState::Started);
        assert_eq!(broker.members("group-1"), vec!["collector-1".to_string()]);

        // The uncommitted record comes back and halts the new loop too.
        runtime.wait_for_halt().await;
        assert_eq!(runtime.stats().batches_failed, 2);
        assert!(broker.members("group-1").is_empty());

        runtime.stop(&monitor).await.unwrap();
        assert_eq!(runtime.state(), LifecycleState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_reattempts_then_halts() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.create_topic("events", 1);
        let consumer = Collector::new(Some("bad"));
        let runtime = ConsumerRuntime::new(
            consumer.clone(),
            broker.clone(),
            settings(BatchErrorPolicy::Retry { max_attempts: 3 }),
        );
        let monitor = ProgressMonitor::new("test");

        broker.publish("events", None, "bad").unwrap();
        runtime.initialize(&monitor).await.unwrap();
        runtime.start(&monitor).await.unwrap();
        runtime.wait_for_halt().await;

        let stats = runtime.stats();
        assert_eq!(stats.batches_failed, 3);
        assert_eq!(stats.retries, 2);
        assert_eq!(runtime.state(), LifecycleState::Error);
        runtime.stop(&monitor).await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_failure_stops_consumer() {
        let broker = Arc::new(InMemoryBroker::new());
        let consumer = Collector::new(None);
        let runtime = ConsumerRuntime::new(consumer.clone(), broker, settings(BatchErrorPolicy::Halt));
        let monitor = ProgressMonitor::new("test");

        runtime.initialize(&monitor).await.unwrap();
        let err = runtime.start(&monitor).await.unwrap_err();
        assert!(err.to_string().contains("Unknown topic"));
        assert_eq!(consumer.state(), LifecycleState::Stopped);
        assert!(!runtime.is_receiving());
    }
}
