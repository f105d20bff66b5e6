//! Persistent-shape, retryable job store for scheduled, delayed, batched and
//! rate-limited sends.
//!
//! Jobs wait in a time index until due, then drain through a priority heap:
//! due first, HIGH before MEDIUM before LOW, FIFO within a priority. Retry
//! state is explicit (`attempts` + `next_eligible_at`) so backoff is
//! deterministic under an injected clock, and exhausted jobs surface on an
//! operator failure channel instead of disappearing.

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{DeliveryError, DeliveryResult};
use crate::metrics;
use crate::models::{DeliveryLedger, Envelope, Priority};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A queued send. Owned by the queue until acked, failed out, or cancelled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub job_id: Uuid,
    pub envelope: Envelope,
    pub run_at: DateTime<Utc>,
    pub priority: Priority,
    pub batch_key: Option<String>,
    pub attempts: u32,
    /// `run_at` initially; pushed out by retry backoff and backpressure.
    pub next_eligible_at: DateTime<Utc>,
    /// Whether the payload already wraps coalesced batch members.
    #[serde(default)]
    pub coalesced: bool,
    seq: u64,
}

/// Report emitted on the operator channel when a job exhausts its retries.
#[derive(Debug, Clone)]
pub struct FailedJobReport {
    pub job_id: Uuid,
    pub envelope_id: Uuid,
    pub attempts: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub waiting: usize,
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
}

struct ReadyEntry {
    priority: Priority,
    seq: u64,
    job_id: Uuid,
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for ReadyEntry {}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first; FIFO (lower sequence) within a priority.
        match self.priority.cmp(&other.priority) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueInner {
    /// Waiting jobs by id.
    jobs: HashMap<Uuid, QueuedJob>,
    /// Eligibility index: (next_eligible_at, seq) -> job id.
    by_time: BTreeMap<(DateTime<Utc>, u64), Uuid>,
    /// Dequeued jobs awaiting ack/fail.
    active: HashMap<Uuid, QueuedJob>,
    /// Waiting job currently absorbing each batch key.
    batch_index: HashMap<String, Uuid>,
    seq: u64,
    completed: u64,
    failed: u64,
}

impl QueueInner {
    fn insert_waiting(&mut self, job: QueuedJob) {
        self.by_time
            .insert((job.next_eligible_at, job.seq), job.job_id);
        if let Some(key) = &job.batch_key {
            self.batch_index.insert(key.clone(), job.job_id);
        }
        self.jobs.insert(job.job_id, job);
    }

    fn remove_waiting(&mut self, job_id: Uuid) -> Option<QueuedJob> {
        let job = self.jobs.remove(&job_id)?;
        self.by_time.remove(&(job.next_eligible_at, job.seq));
        if let Some(key) = &job.batch_key {
            if self.batch_index.get(key) == Some(&job_id) {
                self.batch_index.remove(key);
            }
        }
        Some(job)
    }

    fn depth(&self) -> QueueDepth {
        QueueDepth {
            waiting: self.jobs.len(),
            active: self.active.len(),
            completed: self.completed,
            failed: self.failed,
        }
    }
}

pub struct DeliveryQueue {
    inner: Mutex<QueueInner>,
    ledger: Arc<DeliveryLedger>,
    clock: Arc<dyn Clock>,
    batch_window: Duration,
    max_in_flight_per_user: usize,
    max_attempts: u32,
    retry_backoff: Duration,
    backpressure_delay: Duration,
    failures: UnboundedSender<FailedJobReport>,
}

impl DeliveryQueue {
    pub fn new(
        config: &Config,
        ledger: Arc<DeliveryLedger>,
        clock: Arc<dyn Clock>,
    ) -> (Arc<Self>, UnboundedReceiver<FailedJobReport>) {
        let (failures, failure_rx) = unbounded_channel();
        let queue = Arc::new(Self {
            inner: Mutex::new(QueueInner::default()),
            ledger,
            clock,
            batch_window: Duration::milliseconds(config.batch_window_ms as i64),
            max_in_flight_per_user: config.max_in_flight_per_user,
            max_attempts: config.max_attempts.max(1),
            retry_backoff: Duration::milliseconds(config.retry_backoff_ms as i64),
            backpressure_delay: Duration::milliseconds(config.backpressure_delay_ms as i64),
            failures,
        });
        (queue, failure_rx)
    }

    /// Enqueues a send. When a waiting job shares the batch key and its slot
    /// is within the coalescing window, the new envelope is merged into it
    /// (one outbound envelope instead of N) and the absorbed envelope's
    /// delivery records are re-keyed under the surviving one. Returns the id
    /// of the job that will carry the send.
    pub fn enqueue(
        &self,
        envelope: Envelope,
        run_at: DateTime<Utc>,
        batch_key: Option<String>,
    ) -> Uuid {
        let mut inner = self.inner.lock().expect("queue lock poisoned");

        if let Some(key) = &batch_key {
            if let Some(&absorbing_id) = inner.batch_index.get(key) {
                if let Some(absorbing) = inner.jobs.get_mut(&absorbing_id) {
                    if (run_at - absorbing.run_at).abs() <= self.batch_window {
                        let absorbed_id = envelope.id;
                        if absorbing.coalesced {
                            if let Some(members) = absorbing.envelope.payload.as_array_mut() {
                                members.push(envelope.payload);
                            }
                        } else {
                            absorbing.envelope.payload = serde_json::Value::Array(vec![
                                absorbing.envelope.payload.take(),
                                envelope.payload,
                            ]);
                            absorbing.coalesced = true;
                        }
                        absorbing.priority = absorbing.priority.max(envelope.priority);
                        absorbing.envelope.expires_at =
                            match (absorbing.envelope.expires_at, envelope.expires_at) {
                                (Some(a), Some(b)) => Some(a.max(b)),
                                _ => None,
                            };
                        let survivor = absorbing.envelope.id;
                        // Re-key under the queue lock: once it is released
                        // the pump may dequeue and ack the surviving job,
                        // and records remapped after that have no job left
                        // to carry them.
                        let moved = self.ledger.remap_envelope(absorbed_id, survivor);
                        drop(inner);
                        debug!(%absorbed_id, %survivor, moved, "batch job coalesced");
                        self.update_metrics();
                        return absorbing_id;
                    }
                }
            }
        }

        let job_id = Uuid::new_v4();
        inner.seq += 1;
        let job = QueuedJob {
            job_id,
            priority: envelope.priority,
            envelope,
            run_at,
            batch_key,
            attempts: 0,
            next_eligible_at: run_at,
            coalesced: false,
            seq: inner.seq,
        };
        inner.insert_waiting(job);
        let depth = inner.depth();
        drop(inner);
        debug!(%job_id, waiting = depth.waiting, "job enqueued");
        self.update_metrics();
        job_id
    }

    /// Returns every job eligible at `now`, ordered by priority then
    /// enqueue order. Jobs whose envelope has expired are terminated here
    /// (records to EXPIRED, never sent); jobs held back by per-user
    /// backpressure are deferred, not dropped. Returned jobs are `active`
    /// until acked or failed.
    pub fn dequeue_due(&self, now: DateTime<Utc>) -> Vec<QueuedJob> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");

        let due_ids: Vec<Uuid> = inner
            .by_time
            .range(..=(now, u64::MAX))
            .map(|(_, id)| *id)
            .collect();

        let mut ready = BinaryHeap::new();
        for id in due_ids {
            if let Some(job) = inner.jobs.get(&id) {
                ready.push(ReadyEntry {
                    priority: job.priority,
                    seq: job.seq,
                    job_id: id,
                });
            }
        }

        let mut dispatched = Vec::new();
        let mut expired = Vec::new();
        let mut deferred = Vec::new();

        while let Some(entry) = ready.pop() {
            let Some(job) = inner.remove_waiting(entry.job_id) else {
                continue;
            };

            if job.envelope.is_expired(now) {
                expired.push(job);
                continue;
            }

            let over_limit = self
                .ledger
                .recipients_of(job.envelope.id)
                .into_iter()
                .any(|user| self.ledger.in_flight_count(user) >= self.max_in_flight_per_user);
            if over_limit {
                deferred.push(job);
                continue;
            }

            inner.active.insert(job.job_id, job.clone());
            dispatched.push(job);
        }

        // Expired terminals count toward completed depth; per-record state
        // still distinguishes them.
        inner.completed += expired.len() as u64;
        for mut job in deferred {
            job.next_eligible_at = now + self.backpressure_delay;
            // Deferral is backpressure, not failure: no attempt consumed.
            inner.insert_waiting(job);
        }
        drop(inner);

        for job in expired {
            let moved = self.ledger.expire_pending(job.envelope.id, now);
            info!(job_id = %job.job_id, envelope_id = %job.envelope.id, records = moved,
                "job expired before dispatch");
            metrics::DELIVERY_TRANSITIONS
                .with_label_values(&["expired"])
                .inc_by(moved as u64);
        }
        self.update_metrics();
        dispatched
    }

    /// Acknowledges successful dispatch of an in-flight job.
    pub fn ack(&self, job_id: Uuid) -> DeliveryResult<()> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if inner.active.remove(&job_id).is_none() {
            return Err(DeliveryError::JobNotFound(job_id));
        }
        inner.completed += 1;
        drop(inner);
        self.update_metrics();
        Ok(())
    }

    /// Marks an in-flight job as failed. Retries with exponential backoff
    /// until the attempt budget is spent, then moves the job to FAILED,
    /// fails its pending records, reports on the operator channel and
    /// returns `QueueJobFailed` to the caller.
    pub fn fail(&self, job_id: Uuid, reason: &str) -> DeliveryResult<()> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let mut job = inner
            .active
            .remove(&job_id)
            .ok_or(DeliveryError::JobNotFound(job_id))?;
        job.attempts += 1;

        if job.attempts >= self.max_attempts {
            inner.failed += 1;
            drop(inner);
            let moved = self.ledger.fail_pending(job.envelope.id, now);
            warn!(%job_id, envelope_id = %job.envelope.id, attempts = job.attempts, records = moved,
                reason, "job failed permanently");
            metrics::DELIVERY_TRANSITIONS
                .with_label_values(&["failed"])
                .inc_by(moved as u64);
            let _ = self.failures.send(FailedJobReport {
                job_id,
                envelope_id: job.envelope.id,
                attempts: job.attempts,
                reason: reason.to_string(),
            });
            self.update_metrics();
            return Err(DeliveryError::QueueJobFailed {
                job_id,
                attempts: job.attempts,
                reason: reason.to_string(),
            });
        } else {
            let shift = (job.attempts - 1).min(16);
            let backoff = self.retry_backoff * (1 << shift);
            job.next_eligible_at = now + backoff;
            // Retrying jobs stop absorbing batch members.
            job.batch_key = None;
            debug!(%job_id, attempts = job.attempts, next_eligible_at = %job.next_eligible_at,
                reason, "job scheduled for retry");
            inner.insert_waiting(job);
            drop(inner);
        }
        self.update_metrics();
        Ok(())
    }

    /// Cancels a waiting job. Returns `Ok(true)` when the job was removed
    /// before dispatch; `Ok(false)` when it is already in flight and may
    /// still be delivered (at-least-once, not at-most-once).
    pub fn cancel(&self, job_id: Uuid) -> DeliveryResult<bool> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if inner.remove_waiting(job_id).is_some() {
            drop(inner);
            self.update_metrics();
            return Ok(true);
        }
        if inner.active.contains_key(&job_id) {
            return Ok(false);
        }
        Err(DeliveryError::JobNotFound(job_id))
    }

    pub fn depth(&self) -> QueueDepth {
        self.inner.lock().expect("queue lock poisoned").depth()
    }

    fn update_metrics(&self) {
        let depth = self.depth();
        metrics::set_queue_depth(depth.waiting, depth.active, depth.completed, depth.failed);
    }
}
