//! Worker-pool dispatcher
//!
//! Watch handlers call [`Dispatcher::enqueue`], which never blocks. A fixed
//! pool of workers pulls keys off the channel and runs the reconciler for the
//! key's kind. A key is queued at most once and never reconciled by two
//! workers at the same time; a key that changes while being reconciled is
//! run again afterwards.
//!
//! Each key's lifecycle lives in a single map entry, and every transition
//! happens under that entry's lock.

use super::{ContextRef, ReconcileOutcome, ReconcilerRef, ResourceKey, ResourceKind};
use crate::error::{Error, ErrorAction, Result};
use crate::state::{RetryDecision, RetryTracker};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyState {
    /// Sitting in the channel
    Queued,
    /// A worker is reconciling it
    Active,
    /// Enqueued again while a worker was reconciling it
    Dirty,
}

pub struct Dispatcher {
    ctx: ContextRef,
    reconcilers: HashMap<ResourceKind, ReconcilerRef>,
    sender: mpsc::UnboundedSender<ResourceKey>,
    receiver: Mutex<mpsc::UnboundedReceiver<ResourceKey>>,
    /// Keys that are queued or running
    keys: DashMap<ResourceKey, KeyState>,
    /// Queued keys per kind
    depth: DashMap<ResourceKind, usize>,
    retries: RetryTracker,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(ctx: ContextRef, reconcilers: Vec<ReconcilerRef>) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let retries = RetryTracker::new(ctx.config.backoff_policy());
        Arc::new(Self {
            reconcilers: reconcilers.into_iter().map(|r| (r.kind(), r)).collect(),
            ctx,
            sender,
            receiver: Mutex::new(receiver),
            keys: DashMap::new(),
            depth: DashMap::new(),
            retries,
            cancel: CancellationToken::new(),
        })
    }

    /// Queue `key` unless it is already waiting
    pub fn enqueue(&self, key: ResourceKey) {
        if self.cancel.is_cancelled() {
            return;
        }
        match self.keys.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if *entry.get() == KeyState::Active {
                    entry.insert(KeyState::Dirty);
                }
            }
            Entry::Vacant(entry) => {
                if self.sender.send(key.clone()).is_ok() {
                    entry.insert(KeyState::Queued);
                    self.adjust_depth(key.kind, 1);
                }
            }
        }
    }

    /// Queue `key` once `delay` has passed
    pub fn enqueue_after(self: &Arc<Self>, key: ResourceKey, delay: Duration) {
        if delay.is_zero() {
            self.enqueue(key);
            return;
        }
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = dispatcher.cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => dispatcher.enqueue(key),
            }
        });
    }

    /// Spawn `workers` tasks that run until [`Dispatcher::shutdown`]
    pub fn start(self: &Arc<Self>, workers: usize) -> Vec<JoinHandle<()>> {
        info!(workers, "Starting reconcile workers");
        (0..workers)
            .map(|worker| {
                let dispatcher = Arc::clone(self);
                tokio::spawn(async move { dispatcher.worker_loop(worker).await })
            })
            .collect()
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        loop {
            let next = {
                let mut receiver = self.receiver.lock().await;
                tokio::select! {
                    _ = self.cancel.cancelled() => None,
                    key = receiver.recv() => key,
                }
            };
            let Some(key) = next else {
                debug!(worker, "Reconcile worker stopped");
                return;
            };
            self.process(key).await;
        }
    }

    /// Reconcile one key and schedule whatever follows from the result
    pub async fn process(self: &Arc<Self>, key: ResourceKey) {
        if !self.claim(&key) {
            return;
        }
        let result = self.reconcile(&key).await;
        self.release(&key);

        let retry_key = key.to_string();
        let kind = key.kind.to_string();
        match result {
            Ok(outcome) => {
                self.ctx.metrics.record_reconcile(&kind, true);
                self.retries.reset(&retry_key);
                if let ReconcileOutcome::RequeueAfter(delay) = outcome {
                    self.enqueue_after(key, delay);
                }
            }
            Err(err) => {
                self.ctx.metrics.record_reconcile(&kind, false);
                match err.action() {
                    ErrorAction::RequeueAfter(delay) => {
                        debug!(key = %key, error = %err, retry_in = ?delay, "Reconcile deferred");
                        self.enqueue_after(key, delay);
                    }
                    ErrorAction::RequeueWithBackoff => {
                        match self.retries.record_failure(&retry_key, err.is_outcome_unknown()) {
                            RetryDecision::RetryAfter(delay) => {
                                warn!(key = %key, error = %err, retry_in = ?delay, "Reconcile failed, will retry");
                                self.enqueue_after(key, delay);
                            }
                            RetryDecision::Exhausted { failures } => {
                                error!(key = %key, error = %err, failures, "Reconcile keeps failing, waiting for the next change");
                                self.retries.reset(&retry_key);
                            }
                        }
                    }
                    ErrorAction::NoRequeue => {
                        warn!(key = %key, error = %err, "Reconcile failed");
                    }
                }
            }
        }
    }

    /// Mark `key` active; false when another worker already runs it
    fn claim(&self, key: &ResourceKey) -> bool {
        match self.keys.entry(key.clone()) {
            Entry::Occupied(mut entry) => match *entry.get() {
                KeyState::Queued => {
                    entry.insert(KeyState::Active);
                    self.adjust_depth(key.kind, -1);
                    true
                }
                KeyState::Active | KeyState::Dirty => {
                    entry.insert(KeyState::Dirty);
                    false
                }
            },
            Entry::Vacant(entry) => {
                entry.insert(KeyState::Active);
                true
            }
        }
    }

    /// Finish a run of `key`, queueing it again if it changed meanwhile
    fn release(&self, key: &ResourceKey) {
        if let Entry::Occupied(mut entry) = self.keys.entry(key.clone()) {
            let rerun = *entry.get() == KeyState::Dirty
                && !self.cancel.is_cancelled()
                && self.sender.send(key.clone()).is_ok();
            if rerun {
                entry.insert(KeyState::Queued);
                self.adjust_depth(key.kind, 1);
            } else {
                entry.remove();
            }
        }
    }

    /// Run the reconciler for `key` once, outside the worker pool
    pub async fn reconcile(&self, key: &ResourceKey) -> Result<ReconcileOutcome> {
        let reconciler = self
            .reconcilers
            .get(&key.kind)
            .ok_or_else(|| Error::Internal(format!("no reconciler registered for {}", key.kind)))?;
        reconciler.reconcile(&key.name).await
    }

    /// Stop the workers and drop pending delayed requeues
    pub fn shutdown(&self) {
        info!("Stopping reconcile workers");
        self.cancel.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Keys waiting for a worker
    pub fn pending_len(&self) -> usize {
        self.depth.iter().map(|d| *d.value()).sum()
    }

    fn adjust_depth(&self, kind: ResourceKind, delta: isize) {
        let mut depth = self.depth.entry(kind).or_insert(0);
        *depth = depth.saturating_add_signed(delta);
        self.ctx.metrics.set_queue_depth(&kind.to_string(), *depth);
    }
}
