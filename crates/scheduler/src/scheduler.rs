//! The fetch scheduler.
//!
//! [`IoScheduler`] owns one [`RequestQueue`] per active source, the current
//! head request of each source, the set of requests being executed, and a
//! lazily started pool of worker threads. All of that is guarded by a single
//! scheduler lock; request notifications and source reads always happen
//! outside it.

use crate::config::SchedulerConfig;
use crate::error::{FetchError, FetchResult};
use crate::handle::{SourceHandle, SourceKey};
use crate::listener::{listener_key, FetchListener};
use crate::prioritizer::Prioritizer;
use crate::queue::RequestQueue;
use crate::request::{FetchRequest, Outcome, RequestId, RequestKey};
use crate::worker;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Scheduler counters and a snapshot of current load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// Requests accepted by [`IoScheduler::submit`]
    pub submitted: u64,

    /// Requests that delivered `completed`
    pub completed: u64,

    /// Requests that ended canceled, including those flushed unexecuted
    pub canceled: u64,

    /// Requests that delivered `error`
    pub failed: u64,

    /// Requests queued or selected as a head
    pub pending: usize,

    /// Requests being executed by a worker
    pub executing: usize,

    /// Live worker threads
    pub running_workers: usize,
}

impl SchedulerStats {
    /// Requests submitted but not yet finished.
    pub fn outstanding(&self) -> u64 {
        self.submitted
            .saturating_sub(self.completed + self.canceled + self.failed)
    }

    pub(crate) fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Completed => self.completed += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Canceled | Outcome::Flushed => self.canceled += 1,
        }
    }
}

/// Which requests of a source [`IoScheduler::abort_all`] cancels.
pub enum AbortFilter<'a> {
    /// Every request, queued or in flight.
    All,
    /// The request with this id.
    Request(RequestId),
    /// Every request reporting to this listener.
    Listener(&'a Arc<dyn FetchListener>),
    /// Every request the predicate accepts.
    Matching(&'a (dyn Fn(&FetchRequest) -> bool + Sync)),
}

impl AbortFilter<'_> {
    fn matches(&self, request: &FetchRequest) -> bool {
        match self {
            AbortFilter::All => true,
            AbortFilter::Request(id) => request.id() == *id,
            AbortFilter::Listener(listener) => request.has_listener_key(listener_key(listener)),
            AbortFilter::Matching(predicate) => predicate(request),
        }
    }
}

impl fmt::Debug for AbortFilter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortFilter::All => write!(f, "All"),
            AbortFilter::Request(id) => write!(f, "Request({})", id),
            AbortFilter::Listener(listener) => write!(f, "Listener({:#x})", listener_key(listener)),
            AbortFilter::Matching(_) => write!(f, "Matching(..)"),
        }
    }
}

pub(crate) struct Shared {
    pub(crate) config: SchedulerConfig,
    pub(crate) state: Mutex<SchedulerState>,
    /// Signalled when work is queued, or when the pool starts retiring.
    pub(crate) work_available: Condvar,
    /// Signalled when nothing is queued or executing.
    pub(crate) drained: Condvar,
}

#[derive(Default)]
pub(crate) struct SchedulerState {
    pub(crate) queues: HashMap<SourceKey, Arc<RequestQueue>>,
    pub(crate) prioritizers: HashMap<SourceKey, Arc<dyn Prioritizer>>,
    pub(crate) heads: HashMap<SourceKey, Arc<FetchRequest>>,
    pub(crate) executing: HashMap<RequestKey, Arc<FetchRequest>>,
    pub(crate) workers: Vec<JoinHandle<()>>,
    pub(crate) running_workers: usize,
    pub(crate) next_worker: usize,
    pub(crate) retiring: bool,
    pub(crate) generation: u64,
    pub(crate) stats: SchedulerStats,
}

impl SchedulerState {
    pub(crate) fn has_queued_work(&self) -> bool {
        !self.queues.is_empty() || !self.heads.is_empty()
    }

    pub(crate) fn is_idle(&self) -> bool {
        !self.has_queued_work() && self.executing.is_empty()
    }

    fn pending(&self) -> usize {
        self.queues.values().map(|queue| queue.len()).sum::<usize>() + self.heads.len()
    }
}

/// Asynchronous tile fetch scheduler.
///
/// Requests are ordered per source, and sources share the worker pool in
/// rough submission order. Workers start on the first submission, exit after
/// the idle timeout, and restart on demand.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use tilefetch_raster::{Extent, PixelFormat, ReadError, Region, TileSource};
/// use tilefetch_scheduler::{listener_fn, FetchEvent, FetchRequest, IoScheduler, SourceHandle};
///
/// struct Gray;
///
/// impl TileSource for Gray {
///     fn width(&self) -> i64 { 1024 }
///     fn height(&self) -> i64 { 768 }
///     fn tile_width(&self) -> i64 { 256 }
///     fn tile_height(&self) -> i64 { 256 }
///     fn pixel_format(&self) -> PixelFormat { PixelFormat::Monochrome }
///     fn read(&self, _: Region, _: Extent, buf: &mut [u8]) -> Result<(), ReadError> {
///         buf.fill(128);
///         Ok(())
///     }
/// }
///
/// let scheduler = IoScheduler::new();
/// let source = SourceHandle::new(Arc::new(Gray));
/// let listener = listener_fn(|event| {
///     if let FetchEvent::Updated { tile, .. } = event {
///         assert!(tile.data.iter().all(|b| *b == 128));
///     }
/// });
///
/// let request = FetchRequest::for_tile(&source, 2, 0, 0, listener).unwrap();
/// scheduler.submit(&request).unwrap();
/// scheduler.wait_until_idle(Duration::from_secs(5)).unwrap();
/// assert_eq!(scheduler.stats().completed, 1);
/// ```
pub struct IoScheduler {
    shared: Arc<Shared>,
}

impl IoScheduler {
    /// Create a scheduler with the default configuration. No threads are
    /// started until the first submission.
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// Create a scheduler with `config`. A `worker_count` of zero is raised
    /// to one.
    pub fn with_config(mut config: SchedulerConfig) -> Self {
        config.worker_count = config.worker_count.max(1);
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(SchedulerState::default()),
                work_available: Condvar::new(),
                drained: Condvar::new(),
            }),
        }
    }

    /// Process-wide scheduler, configured from the environment on first use.
    pub fn global() -> &'static IoScheduler {
        static GLOBAL: OnceLock<IoScheduler> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            let config = SchedulerConfig::from_env().unwrap_or_else(|error| {
                warn!(%error, "ignoring fetch scheduler environment");
                SchedulerConfig::default()
            });
            IoScheduler::with_config(config)
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Queue `request` for execution.
    ///
    /// The listener receives `created` before this returns. Starts or tops up
    /// the worker pool as needed.
    ///
    /// # Errors
    /// [`FetchError::IllegalState`] if the request was already submitted, and
    /// [`FetchError::WorkerSpawn`] if no worker could be started; the request
    /// is then canceled.
    pub fn submit(&self, request: &Arc<FetchRequest>) -> FetchResult<()> {
        request.mark_queued()?;
        request.notify_created();

        let mut state = self.shared.state.lock();
        state.retiring = false;
        if let Err(error) = self.spawn_workers(&mut state) {
            if state.running_workers == 0 {
                drop(state);
                warn!(request = request.id(), %error, "no fetch worker available");
                request.cancel();
                return Err(error);
            }
            warn!(
                %error,
                running = state.running_workers,
                "fetch pool running below its configured size"
            );
        }

        let key = request.source_key();
        let prioritizer = state.prioritizers.get(&key).cloned();
        let queue = state
            .queues
            .entry(key)
            .or_insert_with(|| Arc::new(RequestQueue::new()))
            .clone();
        queue.push(request.clone(), prioritizer);
        state.stats.submitted += 1;
        drop(state);

        debug!(
            request = request.id(),
            source = %key,
            level = request.level(),
            "fetch submitted"
        );
        self.shared.work_available.notify_one();
        Ok(())
    }

    fn spawn_workers(&self, state: &mut SchedulerState) -> FetchResult<()> {
        let (finished, alive): (Vec<_>, Vec<_>) = state
            .workers
            .drain(..)
            .partition(|handle| handle.is_finished());
        state.workers = alive;
        for handle in finished {
            let _ = handle.join();
        }

        let config = &self.shared.config;
        if state.running_workers == 0 {
            info!(workers = config.worker_count, "starting fetch worker pool");
        }
        while state.running_workers < config.worker_count {
            let shared = Arc::clone(&self.shared);
            let generation = state.generation;
            let handle = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name, state.next_worker))
                .spawn(move || worker::run(shared, generation))
                .map_err(FetchError::WorkerSpawn)?;
            state.next_worker += 1;
            state.running_workers += 1;
            state.workers.push(handle);
        }
        Ok(())
    }

    /// Cancel requests of `source` selected by `filter`, whether queued,
    /// selected as the source's head or being read. Returns how many requests
    /// this call canceled.
    pub fn abort_all(&self, source: &SourceHandle, filter: AbortFilter<'_>) -> usize {
        let key = source.key();
        let (queue, queued, in_flight) = {
            let mut state = self.shared.state.lock();
            let queue = match filter {
                AbortFilter::All => state.queues.remove(&key),
                _ => state.queues.get(&key).cloned(),
            };
            // Workers only pop under this lock, so every live request is
            // either in the snapshot or in `in_flight`.
            let queued = match (&queue, &filter) {
                (Some(_), AbortFilter::All) | (None, _) => Vec::new(),
                (Some(queue), _) => queue.snapshot(),
            };
            let in_flight: Vec<_> = state
                .heads
                .get(&key)
                .into_iter()
                .chain(
                    state
                        .executing
                        .values()
                        .filter(|request| request.source_key() == key),
                )
                .cloned()
                .collect();
            (queue, queued, in_flight)
        };

        let mut count = 0;
        if let Some(queue) = queue {
            count += match filter {
                AbortFilter::All => {
                    let removed = queue.abort();
                    let mut state = self.shared.state.lock();
                    state.stats.canceled += removed as u64;
                    if state.is_idle() {
                        self.shared.drained.notify_all();
                    }
                    removed
                }
                _ => queue.cancel_among(queued, |request| filter.matches(request)),
            };
        }
        for request in in_flight {
            if filter.matches(&request) && request.cancel() {
                count += 1;
            }
        }

        debug!(source = %key, ?filter, count, "aborted fetches");
        count
    }

    /// Install (or with `None`, remove) a prioritizer for `source`'s queue.
    pub fn set_prioritizer(&self, source: &SourceHandle, prioritizer: Option<Arc<dyn Prioritizer>>) {
        let key = source.key();
        let mut state = self.shared.state.lock();
        match &prioritizer {
            Some(prioritizer) => {
                state.prioritizers.insert(key, prioritizer.clone());
            }
            None => {
                state.prioritizers.remove(&key);
            }
        }
        if let Some(queue) = state.queues.get(&key) {
            queue.set_prioritizer(prioritizer);
        }
    }

    /// Block until nothing is queued or executing, or `timeout` passes.
    pub fn wait_until_idle(&self, timeout: Duration) -> FetchResult<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while !state.is_idle() {
            if self
                .shared
                .drained
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return if state.is_idle() {
                    Ok(())
                } else {
                    Err(FetchError::Timeout)
                };
            }
        }
        Ok(())
    }

    /// Cancel everything and stop the worker pool.
    ///
    /// Every queued, selected or executing request is canceled, and worker
    /// threads are joined. The scheduler stays usable; the next submission
    /// starts a fresh pool.
    pub fn shutdown(&self) {
        let (queues, in_flight, workers) = {
            let mut state = self.shared.state.lock();
            state.generation += 1;
            state.retiring = false;

            let queues: Vec<_> = state.queues.drain().map(|(_, queue)| queue).collect();
            let heads: Vec<_> = state.heads.drain().map(|(_, request)| request).collect();
            state.stats.canceled += heads.len() as u64;
            let in_flight: Vec<_> = heads
                .into_iter()
                .chain(state.executing.values().cloned())
                .collect();
            let workers: Vec<_> = state.workers.drain(..).collect();
            (queues, in_flight, workers)
        };
        self.shared.work_available.notify_all();

        let mut removed = 0;
        for queue in queues {
            removed += queue.abort();
        }
        for request in &in_flight {
            request.cancel();
        }
        {
            let mut state = self.shared.state.lock();
            state.stats.canceled += removed as u64;
        }

        let current = thread::current().id();
        let joined = workers.len();
        for handle in workers {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        self.shared.drained.notify_all();
        debug!(workers = joined, canceled = removed, "fetch scheduler shut down");
    }

    /// Live worker threads.
    pub fn running_workers(&self) -> usize {
        self.shared.state.lock().running_workers
    }

    /// Requests queued or selected as a head, not yet executing.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().pending()
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.shared.state.lock();
        SchedulerStats {
            pending: state.pending(),
            executing: state.executing.len(),
            running_workers: state.running_workers,
            ..state.stats.clone()
        }
    }
}

impl Default for IoScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IoScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for IoScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoScheduler")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}
