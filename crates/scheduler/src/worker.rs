//! Fetch worker threads.
//!
//! Each worker repeatedly picks the oldest queue head across all sources,
//! executes it outside the scheduler lock, and meanwhile validates at most
//! one queue that could not produce a head. A pool with nothing to do waits
//! for the idle timeout and then retires; the next submission restarts it.

use crate::queue::RequestQueue;
use crate::request::{FetchRequest, Outcome};
use crate::scheduler::{SchedulerState, Shared};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Pixel buffer owned by one worker and reused across requests.
#[derive(Debug, Default)]
pub(crate) struct ScratchBuffer {
    data: Vec<u8>,
}

impl ScratchBuffer {
    /// A slice of exactly `len` bytes; the allocation only ever grows.
    pub(crate) fn slice(&mut self, len: usize) -> &mut [u8] {
        if self.data.len() < len {
            self.data.resize(len, 0);
        }
        &mut self.data[..len]
    }

    #[cfg(test)]
    fn capacity(&self) -> usize {
        self.data.capacity()
    }
}

/// Worker thread body. `generation` is the pool generation the worker was
/// spawned for; a shutdown bumps it and the worker exits.
pub(crate) fn run(shared: Arc<Shared>, generation: u64) {
    let mut scratch = ScratchBuffer::default();
    let mut finished: Option<(Arc<FetchRequest>, Outcome)> = None;
    debug!(generation, "fetch worker started");

    loop {
        let mut state = shared.state.lock();

        if let Some((request, outcome)) = finished.take() {
            state.executing.remove(&request.key());
            state.stats.record(outcome);
            if state.is_idle() {
                shared.drained.notify_all();
            }
        }

        if state.generation != generation {
            state.running_workers -= 1;
            break;
        }

        if !state.has_queued_work() {
            if state.retiring {
                state.running_workers -= 1;
                break;
            }
            match shared.config.idle_timeout {
                Some(timeout) => {
                    let timed_out = shared.work_available.wait_for(&mut state, timeout).timed_out();
                    if timed_out
                        && !state.retiring
                        && !state.has_queued_work()
                        && state.generation == generation
                    {
                        debug!(
                            workers = state.running_workers,
                            "fetch pool idle, retiring workers"
                        );
                        state.retiring = true;
                        shared.work_available.notify_all();
                    }
                }
                None => shared.work_available.wait(&mut state),
            }
            continue;
        }

        let (task, validate) = select_task(&mut state);
        if let Some(request) = &task {
            state.executing.insert(request.key(), request.clone());
        }
        drop(state);

        if let Some(request) = task {
            trace!(
                request = request.id(),
                source = %request.source_key(),
                level = request.level(),
                "executing fetch"
            );
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| request.execute(&mut scratch)))
                .unwrap_or_else(|_| {
                    error!(request = request.id(), "fetch listener panicked");
                    panic::catch_unwind(AssertUnwindSafe(|| request.fail_after_panic()))
                        .unwrap_or(Outcome::Failed)
                });
            finished = Some((request, outcome));
        }

        if let Some(queue) = validate {
            queue.validate(finished.is_none());
        }
    }

    debug!(generation, "fetch worker exiting");
}

/// Refill queue heads, then take the head with the lowest id.
///
/// Also returns a queue to validate: one that could not produce a head, or
/// failing that the queue of the chosen task. A queue that is being
/// validated by another worker is returned too, so that an idle worker waits
/// for it instead of spinning.
fn select_task(state: &mut SchedulerState) -> (Option<Arc<FetchRequest>>, Option<Arc<RequestQueue>>) {
    let SchedulerState { queues, heads, .. } = state;
    let mut validate = None;

    for (key, queue) in queues.iter() {
        if heads.contains_key(key) {
            continue;
        }
        match queue.pop() {
            Some(request) => {
                heads.insert(*key, request);
            }
            None => {
                if validate.is_none() && !queue.is_empty() {
                    validate = Some(queue.clone());
                }
            }
        }
    }
    queues.retain(|_, queue| !queue.is_empty());

    let next = heads
        .iter()
        .min_by_key(|(key, request)| (request.id(), **key))
        .map(|(key, _)| *key);
    let task = next.and_then(|key| heads.remove(&key));

    if validate.is_none() {
        if let Some(request) = &task {
            validate = queues.get(&request.source_key()).cloned();
        }
    }

    (task, validate)
}
