//! Per-resource operation queues
//!
//! Every resource name owns a FIFO of pending state-transition requests and
//! a flag marking the request currently executing. Only the worker that
//! obtained a request from `try_lock` (or a follow-up from `unlock`) may run
//! provisioner calls for that resource.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::trace;

// =============================================================================
// Operation Request
// =============================================================================

/// Target transition of a queued request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Create,
    Expand,
    Delete,
    Attach,
    Detach,
    UpdateRole,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Create => write!(f, "create"),
            OperationKind::Expand => write!(f, "expand"),
            OperationKind::Delete => write!(f, "delete"),
            OperationKind::Attach => write!(f, "attach"),
            OperationKind::Detach => write!(f, "detach"),
            OperationKind::UpdateRole => write!(f, "update-role"),
        }
    }
}

/// A queued transition request
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub kind: OperationKind,
    pub enqueued_at: Instant,
}

impl OperationRequest {
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            enqueued_at: Instant::now(),
        }
    }
}

// =============================================================================
// Operation Queue
// =============================================================================

/// Ordered pending requests plus the one currently executing
#[derive(Debug, Default)]
pub struct OperationQueue {
    pending: VecDeque<OperationRequest>,
    active: Option<OperationKind>,
}

impl OperationQueue {
    /// Append unless a request with the same target is already pending
    fn push(&mut self, request: OperationRequest) -> bool {
        if self.pending.iter().any(|r| r.kind == request.kind) {
            return false;
        }
        self.pending.push_back(request);
        true
    }

    fn is_idle(&self) -> bool {
        self.active.is_none() && self.pending.is_empty()
    }
}

/// Mutex-guarded queue for one resource
#[derive(Debug, Default)]
pub struct LockableEntry {
    queue: Mutex<OperationQueue>,
}

// =============================================================================
// Queue Statistics
// =============================================================================

#[derive(Debug, Default)]
pub struct QueueStats {
    pub enqueued: AtomicU64,
    pub deduplicated: AtomicU64,
    pub started: AtomicU64,
}

/// Snapshot of queue statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatsSnapshot {
    pub enqueued: u64,
    pub deduplicated: u64,
    pub started: u64,
}

// =============================================================================
// Operation Queues
// =============================================================================

/// Registry of per-resource queues for one resource kind
#[derive(Debug, Default)]
pub struct OperationQueues {
    entries: DashMap<String, LockableEntry>,
    stats: QueueStats,
}

impl OperationQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request; returns false when an identical one was already pending
    pub fn enqueue(&self, name: &str, kind: OperationKind) -> bool {
        let entry = self.entries.entry(name.to_string()).or_default();
        let added = entry.queue.lock().push(OperationRequest::new(kind));
        if added {
            self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
            trace!(resource = %name, operation = %kind, "Operation enqueued");
        } else {
            self.stats.deduplicated.fetch_add(1, Ordering::Relaxed);
        }
        added
    }

    /// Take exclusive execution rights and the first pending request.
    ///
    /// Returns None if another worker holds the resource or nothing is pending.
    pub fn try_lock(&self, name: &str) -> Option<OperationRequest> {
        let entry = self.entries.get(name)?;
        let mut queue = entry.queue.lock();
        if queue.active.is_some() {
            return None;
        }
        let next = queue.pending.pop_front()?;
        queue.active = Some(next.kind);
        self.stats.started.fetch_add(1, Ordering::Relaxed);
        Some(next)
    }

    /// Finish the active request and hand over the next pending one, if any.
    ///
    /// When a request is returned the caller still holds the resource.
    pub fn unlock(&self, name: &str) -> Option<OperationRequest> {
        let entry = self.entries.get(name)?;
        let mut queue = entry.queue.lock();
        match queue.pending.pop_front() {
            Some(next) => {
                queue.active = Some(next.kind);
                self.stats.started.fetch_add(1, Ordering::Relaxed);
                Some(next)
            }
            None => {
                queue.active = None;
                None
            }
        }
    }

    /// Give up execution rights without starting the next request.
    ///
    /// Used when the active request failed; pending requests stay queued for
    /// the next reconcile pass.
    pub fn release(&self, name: &str) {
        if let Some(entry) = self.entries.get(name) {
            entry.queue.lock().active = None;
        }
    }

    /// Drop the tracking entry of a deleted resource.
    ///
    /// An entry whose request is still executing is kept; its worker drains
    /// and releases it.
    pub fn remove_queue(&self, name: &str) -> bool {
        self.entries
            .remove_if(name, |_, entry| entry.queue.lock().active.is_none())
            .is_some()
    }

    /// Whether a worker currently holds the resource
    pub fn is_active(&self, name: &str) -> bool {
        self.entries
            .get(name)
            .map(|e| e.queue.lock().active.is_some())
            .unwrap_or(false)
    }

    /// Whether any entry (active or pending) exists for the resource
    pub fn contains(&self, name: &str) -> bool {
        self.entries
            .get(name)
            .map(|e| !e.queue.lock().is_idle())
            .unwrap_or(false)
    }

    pub fn pending_len(&self, name: &str) -> usize {
        self.entries
            .get(name)
            .map(|e| e.queue.lock().pending.len())
            .unwrap_or(0)
    }

    /// Pending requests across all resources
    pub fn total_pending(&self) -> usize {
        self.entries
            .iter()
            .map(|e| e.queue.lock().pending.len())
            .sum()
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            enqueued: self.stats.enqueued.load(Ordering::Relaxed),
            deduplicated: self.stats.deduplicated.load(Ordering::Relaxed),
            started: self.stats.started.load(Ordering::Relaxed),
        }
    }
}
