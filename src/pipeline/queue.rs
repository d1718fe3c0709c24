//! Bounded delivery queue with a concurrency-limited dispatcher.
//!
//! One queue serves every account. [`DeliveryQueue::enqueue`] never blocks:
//! at capacity it evicts the oldest pending item. [`DeliveryQueue::run`] is
//! the dispatcher task; it pops items in FIFO order and delivers up to
//! `max_concurrent` of them at once through the [`RetryExecutor`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::retry::{CallError, RetryExecutor};
use crate::types::{DeliveryOutcome, NormalizedMessage, QueueItem};

/// Performs one delivery call for a message.
#[async_trait]
pub trait Deliver: Send + Sync {
    /// Send `message` to the backend once.
    ///
    /// # Errors
    ///
    /// Returns the classified failure of this single call.
    async fn deliver(&self, message: &NormalizedMessage) -> Result<(), CallError>;
}

/// Queue tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Ceiling on simultaneous deliveries.
    pub max_concurrent: usize,
    /// Capacity of the pending buffer.
    pub max_queue_size: usize,
    /// Pause between dispatch cycles while work remains.
    pub dispatch_delay: Duration,
    /// Time in-flight deliveries get to finish at shutdown.
    pub shutdown_grace: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_queue_size: 1000,
            dispatch_delay: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Aggregate queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Items delivered.
    pub processed: u64,
    /// Items rejected by the backend or exhausted.
    pub failed: u64,
    /// Retries performed across all items.
    pub retried: u64,
    /// Items evicted or abandoned.
    pub dropped: u64,
    /// Items waiting for dispatch.
    pub size: usize,
    /// Deliveries currently running.
    pub in_flight: usize,
}

/// Terminal outcome of one item.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    /// The item as it left the queue.
    pub item: QueueItem,
    /// What happened to it.
    pub outcome: DeliveryOutcome,
}

/// The delivery queue.
pub struct DeliveryQueue {
    config: QueueConfig,
    items: Mutex<VecDeque<QueueItem>>,
    notify: Notify,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
    in_flight: AtomicUsize,
    reports: Mutex<Vec<mpsc::UnboundedSender<DeliveryReport>>>,
}

impl std::fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryQueue")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Held by each delivery task. Decrements the in-flight count when the task
/// ends, and reports the item as dropped if the task was aborted before
/// reaching an outcome.
struct InFlight {
    queue: Arc<DeliveryQueue>,
    item: Option<QueueItem>,
}

impl InFlight {
    fn new(queue: Arc<DeliveryQueue>, item: &QueueItem) -> Self {
        queue.in_flight.fetch_add(1, Ordering::SeqCst);
        Self {
            queue,
            item: Some(item.clone()),
        }
    }

    fn complete(&mut self) {
        self.item = None;
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.queue.in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Some(item) = self.item.take() {
            warn!(item_id = %item.id, "in-flight delivery aborted");
            self.queue.finish(item, DeliveryOutcome::Dropped);
        }
    }
}

impl DeliveryQueue {
    /// Create an empty queue.
    pub fn new(config: QueueConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            config,
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            permits,
            closed: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            reports: Mutex::new(Vec::new()),
        }
    }

    /// Queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Append a message to the tail.
    ///
    /// At capacity the head item is evicted first and reported as
    /// [`DeliveryOutcome::Dropped`]. After shutdown every message is dropped.
    pub fn enqueue(&self, message: NormalizedMessage) {
        let item = QueueItem::new(message);

        let mut evicted = Vec::new();
        {
            let mut items = self.items();
            if self.closed.load(Ordering::SeqCst) {
                drop(items);
                warn!(item_id = %item.id, "queue closed, dropping message");
                self.finish(item, DeliveryOutcome::Dropped);
                return;
            }
            while items.len() >= self.config.max_queue_size.max(1) {
                match items.pop_front() {
                    Some(old) => evicted.push(old),
                    None => break,
                }
            }
            debug!(
                item_id = %item.id,
                account_id = %item.message.account_id,
                chat_id = %item.message.chat_id,
                message_id = %item.message.message_id,
                "message enqueued"
            );
            items.push_back(item);
        }

        for old in evicted {
            warn!(
                item_id = %old.id,
                account_id = %old.message.account_id,
                chat_id = %old.message.chat_id,
                message_id = %old.message.message_id,
                "queue full, dropping oldest message"
            );
            self.finish(old, DeliveryOutcome::Dropped);
        }

        self.notify.notify_one();
    }

    /// Current counters.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            processed: self.processed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            retried: self.retried.load(Ordering::SeqCst),
            dropped: self.dropped.load(Ordering::SeqCst),
            size: self.len(),
            in_flight: self.in_flight.load(Ordering::SeqCst),
        }
    }

    /// Items waiting for dispatch.
    pub fn len(&self) -> usize {
        self.items().len()
    }

    /// Whether nothing is waiting for dispatch.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the pending items, head first.
    pub fn pending(&self) -> Vec<QueueItem> {
        self.items().iter().cloned().collect()
    }

    /// Receive a [`DeliveryReport`] for every item that reaches a terminal
    /// outcome from now on.
    pub fn reports(&self) -> mpsc::UnboundedReceiver<DeliveryReport> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.reports.lock() {
            Ok(mut senders) => senders.push(tx),
            Err(poisoned) => poisoned.into_inner().push(tx),
        }
        rx
    }

    /// Dispatcher loop. Runs until `shutdown` flips to `true`.
    ///
    /// On shutdown, pending items are abandoned as dropped and in-flight
    /// deliveries get `shutdown_grace` to finish before they are aborted.
    pub async fn run(
        self: Arc<Self>,
        deliverer: Arc<dyn Deliver>,
        retry: RetryExecutor,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            max_concurrent = self.config.max_concurrent,
            max_queue_size = self.config.max_queue_size,
            "delivery dispatcher started"
        );
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            while tasks.try_join_next().is_some() {}

            let permit = tokio::select! {
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                () = shutdown_signalled(&mut shutdown) => break,
            };

            let item = loop {
                if let Some(item) = self.pop() {
                    break Some(item);
                }
                tokio::select! {
                    () = self.notify.notified() => {}
                    () = shutdown_signalled(&mut shutdown) => break None,
                }
            };
            let Some(item) = item else { break };

            let mut guard = InFlight::new(Arc::clone(&self), &item);
            let queue = Arc::clone(&self);
            let deliverer = Arc::clone(&deliverer);
            let retry = retry.clone();
            tasks.spawn(async move {
                let _permit = permit;
                queue.deliver_item(item, deliverer.as_ref(), &retry).await;
                guard.complete();
            });

            if !self.is_empty() {
                tokio::select! {
                    () = tokio::time::sleep(self.config.dispatch_delay) => {}
                    () = shutdown_signalled(&mut shutdown) => break,
                }
            }
        }

        self.drain(tasks).await;
    }

    async fn deliver_item(&self, mut item: QueueItem, deliverer: &dyn Deliver, retry: &RetryExecutor) {
        let before = item.retry_count;
        let result = {
            let message = &item.message;
            retry
                .attempt("ingest", &mut item.retry_count, || deliverer.deliver(message))
                .await
        };
        let retried = item.retry_count.saturating_sub(before);
        if retried > 0 {
            self.retried.fetch_add(u64::from(retried), Ordering::SeqCst);
        }

        match result {
            Ok(()) => {
                debug!(
                    item_id = %item.id,
                    account_id = %item.message.account_id,
                    chat_id = %item.message.chat_id,
                    message_id = %item.message.message_id,
                    retries = item.retry_count,
                    "message delivered"
                );
                self.finish(item, DeliveryOutcome::Delivered);
            }
            Err(failure) => {
                let outcome = failure.outcome();
                error!(
                    item_id = %item.id,
                    account_id = %item.message.account_id,
                    chat_id = %item.message.chat_id,
                    message_id = %item.message.message_id,
                    outcome = outcome.as_str(),
                    error = %failure,
                    "message delivery failed"
                );
                self.finish(item, outcome);
            }
        }
    }

    async fn drain(&self, mut tasks: JoinSet<()>) {
        let abandoned: Vec<QueueItem> = {
            let mut items = self.items();
            self.closed.store(true, Ordering::SeqCst);
            items.drain(..).collect()
        };
        if !abandoned.is_empty() {
            warn!(count = abandoned.len(), "abandoning pending messages at shutdown");
        }
        for item in abandoned {
            self.finish(item, DeliveryOutcome::Dropped);
        }

        let grace = self.config.shutdown_grace;
        let joined = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if joined.is_err() {
            let aborted = tasks.len();
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
            warn!(count = aborted, "aborted in-flight deliveries after grace period");
        }

        info!("delivery dispatcher stopped");
    }

    fn pop(&self) -> Option<QueueItem> {
        self.items().pop_front()
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<QueueItem>> {
        match self.items.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn finish(&self, item: QueueItem, outcome: DeliveryOutcome) {
        let counter = match outcome {
            DeliveryOutcome::Delivered => &self.processed,
            DeliveryOutcome::RejectedByBackend | DeliveryOutcome::Exhausted => &self.failed,
            DeliveryOutcome::Dropped => &self.dropped,
        };
        counter.fetch_add(1, Ordering::SeqCst);

        if let Ok(mut senders) = self.reports.lock() {
            if senders.is_empty() {
                return;
            }
            let report = DeliveryReport { item, outcome };
            senders.retain(|tx| tx.send(report.clone()).is_ok());
        }
    }
}

/// Resolves once the shutdown flag is set or its sender is gone.
pub(crate) async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
