use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::circuit::CircuitStatus;
use crate::config::EngineConfig;
use crate::error::{DispatchError, EngineError};
use crate::executor::DeliveryExecutor;
use crate::ledger::{DeliveryLedger, InMemoryLedger};
use crate::rate_limit::RateLimiterStats;
use crate::registry::SubscriptionRegistry;
use crate::telemetry::{self, metric_inc};
use crate::types::{DeliveryJob, DispatchReceipt, Event, EventId, SubscriptionId};

type Pair = (SubscriptionId, EventId);

/// Entry point of the engine.
///
/// Accepts events, fans them out to matching subscriptions and runs the
/// resulting delivery jobs on a bounded worker pool. Retries wait in a
/// delay queue owned by a single scheduler task, so no worker is held while
/// a delivery is backing off.
///
/// Each (subscription, event) pair has at most one job pending or running at
/// any time, and a job is only handed back to the workers once its previous
/// attempt has finished.
pub struct EventDispatcher {
    registry: Arc<SubscriptionRegistry>,
    executor: Arc<DeliveryExecutor>,
    ready_tx: Option<mpsc::Sender<DeliveryJob>>,
    ready_rx: Arc<Mutex<mpsc::Receiver<DeliveryJob>>>,
    is_running: Arc<AtomicBool>,
    shutdown: CancellationToken,
    worker_handles: Vec<JoinHandle<()>>,
    scheduler_handle: Option<JoinHandle<()>>,
    dispatched: Mutex<DispatchHistory>,
    in_flight: Arc<Mutex<HashSet<Pair>>>,
}

/// Receipts of recently dispatched events, evicted oldest first.
struct DispatchHistory {
    receipts: HashMap<EventId, DispatchReceipt>,
    order: VecDeque<EventId>,
    capacity: usize,
}

impl DispatchHistory {
    fn new(capacity: usize) -> Self {
        Self {
            receipts: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn get(&self, event_id: &EventId) -> Option<&DispatchReceipt> {
        self.receipts.get(event_id)
    }

    fn insert(&mut self, receipt: DispatchReceipt) {
        if self.receipts.insert(receipt.event_id.clone(), receipt.clone()).is_some() {
            return;
        }
        self.order.push_back(receipt.event_id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.receipts.remove(&oldest);
            }
        }
    }
}

/// Message from a worker back to the scheduler.
enum Report {
    Retry { job: DeliveryJob, ready_at: Instant },
    Done { pair: Pair },
}

impl EventDispatcher {
    /// Start an engine backed by an in-memory ledger and a fresh registry.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_ledger(config, Arc::new(InMemoryLedger::new()))
    }

    /// Start an engine that records attempts into `ledger`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_ledger(
        config: EngineConfig,
        ledger: Arc<dyn DeliveryLedger>,
    ) -> Result<Self, EngineError> {
        let registry = Arc::new(SubscriptionRegistry::new());
        let executor = Arc::new(DeliveryExecutor::new(&config, Arc::clone(&registry), ledger)?);

        let (ready_tx, ready_rx) = mpsc::channel(config.queue_capacity);
        let shared_ready_rx = Arc::new(Mutex::new(ready_rx));
        let (report_tx, report_rx) = mpsc::unbounded_channel();

        let shutdown = CancellationToken::new();
        let in_flight = Arc::new(Mutex::new(HashSet::new()));

        let worker_handles = (0..config.worker_count)
            .map(|_| {
                tokio::spawn(worker_loop(
                    Arc::clone(&shared_ready_rx),
                    Arc::clone(&executor),
                    report_tx.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();

        let scheduler_handle = tokio::spawn(scheduler_loop(
            ready_tx.clone(),
            report_rx,
            Arc::clone(&in_flight),
            shutdown.clone(),
        ));

        tracing::info!(workers = config.worker_count, "webhook dispatcher started");

        Ok(Self {
            registry,
            executor,
            ready_tx: Some(ready_tx),
            ready_rx: shared_ready_rx,
            is_running: Arc::new(AtomicBool::new(true)),
            shutdown,
            worker_handles,
            scheduler_handle: Some(scheduler_handle),
            dispatched: Mutex::new(DispatchHistory::new(config.dedup_capacity)),
            in_flight,
        })
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> Arc<dyn DeliveryLedger> {
        Arc::clone(self.executor.ledger())
    }

    /// Fan `event` out to every active subscription for its type.
    ///
    /// Returns once the jobs are queued, not once they are delivered.
    /// Dispatching an event id seen before is a no-op that returns the
    /// original receipt.
    pub async fn dispatch(&self, event: Event) -> Result<DispatchReceipt, DispatchError> {
        self.ensure_running()?;
        validate_event(&event)?;

        let event = Arc::new(event);
        let (receipt, jobs) = {
            let mut dispatched = self.dispatched.lock().await;
            if let Some(receipt) = dispatched.get(&event.id) {
                tracing::debug!(event_id = %event.id, "duplicate dispatch ignored");
                metric_inc(telemetry::DISPATCH_DUPLICATE);
                return Ok(receipt.clone());
            }

            let jobs = self.create_jobs(&event).await;
            let receipt = DispatchReceipt {
                event_id: event.id.clone(),
                delivery_ids: jobs.iter().map(|job| job.delivery_id).collect(),
            };
            dispatched.insert(receipt.clone());
            (receipt, jobs)
        };

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            deliveries = jobs.len(),
            "event dispatched"
        );
        self.enqueue(jobs).await?;
        Ok(receipt)
    }

    /// Start a fresh delivery sequence for an event, bypassing deduplication.
    ///
    /// Used by operators to retry abandoned deliveries. Subscriptions that
    /// still have a job pending or running for this event are skipped.
    pub async fn redispatch(&self, event: Event) -> Result<DispatchReceipt, DispatchError> {
        self.ensure_running()?;
        validate_event(&event)?;

        let event = Arc::new(event);
        let jobs = self.create_jobs(&event).await;
        let receipt = DispatchReceipt {
            event_id: event.id.clone(),
            delivery_ids: jobs.iter().map(|job| job.delivery_id).collect(),
        };

        self.dispatched.lock().await.insert(receipt.clone());
        tracing::info!(event_id = %event.id, deliveries = jobs.len(), "event redispatched");
        self.enqueue(jobs).await?;
        Ok(receipt)
    }

    pub async fn circuit_status(&self, subscription_id: SubscriptionId) -> Option<CircuitStatus> {
        self.executor.circuit().status(subscription_id).await
    }

    pub async fn rate_limiter_stats(&self) -> HashMap<SubscriptionId, RateLimiterStats> {
        self.executor.rate_limiter().stats().await
    }

    /// Number of (subscription, event) pairs with a job pending or running.
    pub async fn pending_jobs(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Stop accepting events, let in-flight attempts finish and drop every
    /// job that has not started: retries in the delay queue and jobs still
    /// waiting in the ready queue. Afterwards `pending_jobs()` is zero.
    pub async fn shutdown(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.ready_tx.take();
        self.shutdown.cancel();

        if let Some(handle) = self.scheduler_handle.take() {
            let _ = handle.await;
        }

        for handle in self.worker_handles.drain(..) {
            let _ = handle.await;
        }

        let mut queued = 0usize;
        {
            let mut ready_rx = self.ready_rx.lock().await;
            ready_rx.close();
            while ready_rx.try_recv().is_ok() {
                queued += 1;
            }
        }
        if queued > 0 {
            tracing::warn!(dropped = queued, "dropping queued deliveries on shutdown");
        }
        self.in_flight.lock().await.clear();

        tracing::info!("webhook dispatcher stopped");
    }

    fn ensure_running(&self) -> Result<(), DispatchError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(DispatchError::Shutdown)
        }
    }

    /// One attempt-1 job per active subscriber without a job already under
    /// way for this event. Claims the pair before returning.
    async fn create_jobs(&self, event: &Arc<Event>) -> Vec<DeliveryJob> {
        let subscribers = self.registry.find_active_subscribers(&event.event_type).await;

        let mut in_flight = self.in_flight.lock().await;
        let mut jobs = Vec::with_capacity(subscribers.len());
        for subscription in subscribers {
            if !in_flight.insert((subscription.id, event.id.clone())) {
                tracing::debug!(
                    event_id = %event.id,
                    subscription_id = %subscription.id,
                    "delivery already in progress, skipping"
                );
                continue;
            }
            jobs.push(DeliveryJob::first(subscription.id, Arc::clone(event)));
        }
        jobs
    }

    async fn enqueue(&self, jobs: Vec<DeliveryJob>) -> Result<(), DispatchError> {
        let ready_tx = self.ready_tx.as_ref().ok_or(DispatchError::Shutdown)?;

        let mut jobs = jobs.into_iter();
        while let Some(job) = jobs.next() {
            if let Err(mpsc::error::SendError(job)) = ready_tx.send(job).await {
                // Release every claimed pair that never made it into the queue.
                let mut in_flight = self.in_flight.lock().await;
                in_flight.remove(&job.pair());
                for job in jobs {
                    in_flight.remove(&job.pair());
                }
                return Err(DispatchError::Shutdown);
            }
            metric_inc(telemetry::DISPATCH_ENQUEUED);
        }
        Ok(())
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn validate_event(event: &Event) -> Result<(), DispatchError> {
    if event.id.0.trim().is_empty() {
        return Err(DispatchError::InvalidEvent { reason: "event id is empty" });
    }
    if event.event_type.trim().is_empty() {
        return Err(DispatchError::InvalidEvent { reason: "event type is empty" });
    }
    Ok(())
}

/// Main worker loop.
///
/// Each worker pulls one job at a time, runs it to completion and reports
/// back to the scheduler. Workers never sleep on a retry delay.
async fn worker_loop(
    rx: Arc<Mutex<mpsc::Receiver<DeliveryJob>>>,
    executor: Arc<DeliveryExecutor>,
    report_tx: mpsc::UnboundedSender<Report>,
    shutdown: CancellationToken,
) {
    loop {
        let job = {
            let mut guard = rx.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                job = guard.recv() => job,
            }
        };

        let Some(job) = job else { break };

        let pair = job.pair();
        let result = executor.attempt(job).await;
        let report = match result.retry {
            Some(retry) => Report::Retry { job: retry.job, ready_at: retry.ready_at },
            None => Report::Done { pair },
        };

        if report_tx.send(report).is_err() {
            break;
        }
    }
}

/// Owns the delay queue. Moves due retries into the ready queue and releases
/// pairs whose delivery finished.
async fn scheduler_loop(
    ready_tx: mpsc::Sender<DeliveryJob>,
    mut report_rx: mpsc::UnboundedReceiver<Report>,
    in_flight: Arc<Mutex<HashSet<Pair>>>,
    shutdown: CancellationToken,
) {
    let mut delay_heap: BinaryHeap<TimedJob> = BinaryHeap::new();

    loop {
        let now = Instant::now();
        while delay_heap.peek().is_some_and(|timed| timed.ready_at <= now) {
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::warn!(dropped = delay_heap.len(), "dropping pending retries on shutdown");
                    return;
                }
                permit = ready_tx.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };
            if let Some(timed) = delay_heap.pop() {
                permit.send(timed.job);
            }
        }

        let next_ready = delay_heap.peek().map(|timed| timed.ready_at);

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                if !delay_heap.is_empty() {
                    tracing::warn!(dropped = delay_heap.len(), "dropping pending retries on shutdown");
                }
                return;
            }
            report = report_rx.recv() => match report {
                Some(Report::Retry { job, ready_at }) => {
                    delay_heap.push(TimedJob { ready_at, job });
                }
                Some(Report::Done { pair }) => {
                    in_flight.lock().await.remove(&pair);
                }
                None => return,
            },
            _ = sleep_until(next_ready.unwrap_or(now)), if next_ready.is_some() => {}
        }
    }
}

#[derive(Debug)]
struct TimedJob {
    ready_at: Instant,
    job: DeliveryJob,
}

impl Eq for TimedJob {}

impl PartialEq for TimedJob {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at.eq(&other.ready_at)
    }
}

impl Ord for TimedJob {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse for min-heap behavior
        other.ready_at.cmp(&self.ready_at)
    }
}

impl PartialOrd for TimedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
