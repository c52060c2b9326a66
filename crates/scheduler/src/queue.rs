//! Per-source request queue.
//!
//! Every live request sits in one of two lists: `canceled`, drained first so
//! that listeners learn about cancellation promptly, and `pending`, kept
//! sorted by dispatch order with the next request at the end. Any change to
//! the live set marks the queue dirty; a dirty queue hands out nothing until
//! a worker validates it.
//!
//! Validation sorts outside the lock. While one thread is sorting, pops
//! return `None` and other validators either wait or give up, depending on
//! whether they have anything better to do.

use crate::prioritizer::{sort_for_dispatch, Prioritizer};
use crate::request::{FetchRequest, RequestId};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::trace;

#[derive(Default)]
struct QueueState {
    live: HashMap<RequestId, Arc<FetchRequest>>,
    canceled: VecDeque<Arc<FetchRequest>>,
    pending: Vec<Arc<FetchRequest>>,
    prioritizer: Option<Arc<dyn Prioritizer>>,
    dirty: bool,
    validating: bool,
    // Bumped by `abort`, so an in-flight validation knows its result is stale.
    epoch: u64,
}

impl QueueState {
    fn is_ordered(&self) -> bool {
        !self.dirty
            && !self.validating
            && self.pending.len() + self.canceled.len() == self.live.len()
    }
}

/// Ordered set of live requests for one source.
#[derive(Default)]
pub struct RequestQueue {
    state: Mutex<QueueState>,
    validated: Condvar,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `request` and adopt `prioritizer` for the next ordering pass.
    pub fn push(&self, request: Arc<FetchRequest>, prioritizer: Option<Arc<dyn Prioritizer>>) {
        let mut state = self.state.lock();
        state.live.insert(request.id(), request);
        state.prioritizer = prioritizer;
        state.dirty = true;
    }

    /// Replace the prioritizer; takes effect at the next validation.
    pub fn set_prioritizer(&self, prioritizer: Option<Arc<dyn Prioritizer>>) {
        let mut state = self.state.lock();
        state.prioritizer = prioritizer;
        state.dirty = true;
    }

    /// Remove and return the next request to dispatch.
    ///
    /// Returns `None` if the queue is empty or needs validation first.
    pub fn pop(&self) -> Option<Arc<FetchRequest>> {
        let mut state = self.state.lock();
        if state.live.is_empty() || !state.is_ordered() {
            return None;
        }

        let oldest_canceled = state
            .pending
            .iter()
            .enumerate()
            .filter(|(_, request)| request.is_canceled())
            .min_by_key(|(_, request)| request.id())
            .map(|(index, _)| index);

        let request = if let Some(request) = state.canceled.pop_front() {
            request
        } else if let Some(index) = oldest_canceled {
            // Canceled since the last sort.
            state.pending.remove(index)
        } else {
            state.pending.pop()?
        };

        state.live.remove(&request.id());
        Some(request)
    }

    /// Re-establish dispatch order if the queue is dirty.
    ///
    /// Returns `false` only when another thread is validating and `block` is
    /// `false`. With `block`, waits for that validation to finish instead.
    pub fn validate(&self, block: bool) -> bool {
        let (mut pending, prioritizer, epoch) = {
            let mut state = self.state.lock();
            while state.validating {
                if !block {
                    return false;
                }
                self.validated.wait(&mut state);
            }
            if !state.dirty {
                return true;
            }

            state.dirty = false;
            state.validating = true;

            let mut canceled = Vec::new();
            let mut pending = Vec::with_capacity(state.live.len());
            for request in state.live.values() {
                if request.is_canceled() {
                    canceled.push(request.clone());
                } else {
                    pending.push(request.clone());
                }
            }
            canceled.sort_by_key(|r| r.id());
            state.canceled = canceled.into();
            state.pending.clear();

            (pending, state.prioritizer.clone(), state.epoch)
        };

        sort_for_dispatch(&mut pending, prioritizer.as_deref());

        let mut state = self.state.lock();
        state.validating = false;
        if state.epoch == epoch {
            trace!(
                pending = pending.len(),
                canceled = state.canceled.len(),
                "request queue validated"
            );
            state.pending = pending;
        }
        self.validated.notify_all();
        true
    }

    /// Cancel and remove every live request. Returns how many were removed.
    pub fn abort(&self) -> usize {
        let victims: Vec<_> = {
            let mut state = self.state.lock();
            state.canceled.clear();
            state.pending.clear();
            state.dirty = true;
            state.epoch += 1;
            state.live.drain().map(|(_, request)| request).collect()
        };

        for request in &victims {
            request.cancel();
        }
        victims.len()
    }

    /// Cancel live requests matching `filter`; they stay queued and drain
    /// ahead of pending work. Returns how many this call canceled.
    pub fn cancel_matching(&self, filter: impl Fn(&FetchRequest) -> bool) -> usize {
        let snapshot = self.snapshot();
        self.cancel_among(snapshot, filter)
    }

    /// The live requests, in no particular order.
    pub(crate) fn snapshot(&self) -> Vec<Arc<FetchRequest>> {
        self.state.lock().live.values().cloned().collect()
    }

    /// Cancel those of `candidates` that match `filter`, then mark the queue
    /// for re-sorting. Requests that already left the queue are canceled
    /// all the same.
    pub(crate) fn cancel_among(
        &self,
        candidates: Vec<Arc<FetchRequest>>,
        filter: impl Fn(&FetchRequest) -> bool,
    ) -> usize {
        let canceled = candidates
            .iter()
            .filter(|request| !request.is_canceled() && filter(request))
            .filter(|request| request.cancel())
            .count();
        if canceled > 0 {
            self.state.lock().dirty = true;
        }
        canceled
    }

    /// Number of live requests.
    pub fn len(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().live.is_empty()
    }

    /// Returns `true` if the queue must be validated before it can pop.
    pub fn needs_validation(&self) -> bool {
        self.state.lock().dirty
    }
}
