// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-job fan-out of job snapshots to live listeners.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::types::Job;

/// Callback invoked with every new snapshot of a job.
pub type Listener = Arc<dyn Fn(&Job) + Send + Sync>;

/// Process-wide so a stale subscription from an earlier run of a job can
/// never remove a listener registered for a later run.
static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Listeners of one active job, in registration order.
#[derive(Default)]
pub struct Broadcaster {
    listeners: BTreeMap<u64, Listener>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener`, returning its id.
    pub fn add(&mut self, listener: Listener) -> u64 {
        let id = NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed);
        self.listeners.insert(id, listener);
        id
    }

    pub fn remove(&mut self, id: u64) -> bool {
        self.listeners.remove(&id).is_some()
    }

    /// Snapshot of the current listeners, for dispatch outside the lock.
    pub fn listeners(&self) -> Vec<Listener> {
        self.listeners.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

/// Call every listener with `job`. A panicking listener is logged and
/// does not stop the others.
pub fn dispatch(listeners: &[Listener], job: &Job) {
    for listener in listeners {
        if panic::catch_unwind(AssertUnwindSafe(|| listener(job))).is_err() {
            tracing::error!(job_id = %job.id, "Progress listener panicked");
        }
    }
}

/// Handle for a registered listener. Dropping it unsubscribes.
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new<F>(release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A subscription that was never attached to anything.
    pub fn inert() -> Self {
        Self { release: None }
    }

    /// False for inert subscriptions and after unsubscribing.
    pub fn is_active(&self) -> bool {
        self.release.is_some()
    }

    pub fn unsubscribe(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}
