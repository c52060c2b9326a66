mod common;

use common::{tagged, Event, Gate, Recorder, TestSource, WAIT};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;
use tilefetch_scheduler::{
    FetchRequest, IoScheduler, Prioritizer, SchedulerConfig, SourceHandle,
};

/// Single worker scheduler whose worker is parked inside a read of `x = 32768`
/// on `handle`'s source until the gate opens.
struct Parked {
    scheduler: IoScheduler,
    gate: Arc<Gate>,
    source: Arc<TestSource>,
    handle: SourceHandle,
    recorder: Arc<Recorder>,
}

impl Parked {
    fn new(source: TestSource, gate: Arc<Gate>) -> Self {
        let scheduler = IoScheduler::with_config(SchedulerConfig::new(1).without_idle_timeout());
        let source = Arc::new(source);
        let handle = SourceHandle::new(source.clone());
        let recorder = Recorder::new();

        let blocker = FetchRequest::for_region(
            &handle,
            tilefetch_raster::Region::new(1 << 15, 0, 4, 4),
            tilefetch_raster::Extent::new(4, 4),
            9,
            recorder.clone(),
        )
        .unwrap();
        scheduler.submit(&blocker).unwrap();
        source.wait_for_reads(1);

        Self {
            scheduler,
            gate,
            source,
            handle,
            recorder,
        }
    }

    fn submit(&self, x: i64, level: u32) -> Arc<FetchRequest> {
        submit_to(&self.scheduler, &self.handle, &self.recorder, x, level)
    }

    /// Release the worker and return the tags read after the blocker.
    fn finish(&self) -> Vec<i64> {
        self.gate.open();
        self.scheduler.wait_until_idle(WAIT).unwrap();
        self.source.reads().into_iter().skip(1).collect()
    }
}

fn submit_to(
    scheduler: &IoScheduler,
    handle: &SourceHandle,
    recorder: &Arc<Recorder>,
    x: i64,
    level: u32,
) -> Arc<FetchRequest> {
    let (region, dest) = tagged(x);
    let request =
        FetchRequest::for_region(handle, region, dest, level, recorder.clone()).unwrap();
    scheduler.submit(&request).unwrap();
    request
}

#[test]
fn coarser_levels_are_read_first() {
    let gate = Gate::closed();
    let parked = Parked::new(TestSource::new("a").gated(&gate), gate);

    parked.submit(0, 0);
    parked.submit(2, 2);
    parked.submit(1, 1);

    assert_eq!(parked.finish(), vec![2, 1, 0]);
}

#[test]
fn same_level_is_read_oldest_first() {
    let gate = Gate::closed();
    let parked = Parked::new(TestSource::new("a").gated(&gate), gate);

    for x in [10, 11, 12, 13] {
        parked.submit(x, 3);
    }

    assert_eq!(parked.finish(), vec![10, 11, 12, 13]);
}

#[test]
fn canceled_requests_are_flushed_not_read() {
    let gate = Gate::closed();
    let parked = Parked::new(TestSource::new("a").gated(&gate), gate);

    let a = parked.submit(0, 0);
    let b = parked.submit(3, 3);
    let c = parked.submit(1, 1);
    assert!(c.cancel());

    assert_eq!(parked.finish(), vec![3, 0]);
    assert!(!a.is_canceled());
    assert!(!b.is_canceled());
    assert_eq!(
        parked.recorder.events_for(c.id()),
        vec![Event::Created(c.id()), Event::Canceled(c.id())]
    );
}

#[test]
fn custom_prioritizer_overrides_level_order() {
    let gate = Gate::closed();
    let parked = Parked::new(TestSource::new("a").gated(&gate), gate);

    let finest_first: Arc<dyn Prioritizer> =
        Arc::new(|a: &FetchRequest, b: &FetchRequest| a.level() < b.level());
    parked
        .scheduler
        .set_prioritizer(&parked.handle, Some(finest_first));

    parked.submit(0, 0);
    parked.submit(2, 2);
    parked.submit(1, 1);

    assert_eq!(parked.finish(), vec![0, 1, 2]);
}

#[test]
fn removing_prioritizer_restores_default_order() {
    let gate = Gate::closed();
    let parked = Parked::new(TestSource::new("a").gated(&gate), gate);

    let finest_first: Arc<dyn Prioritizer> =
        Arc::new(|a: &FetchRequest, b: &FetchRequest| a.level() < b.level());
    parked
        .scheduler
        .set_prioritizer(&parked.handle, Some(finest_first));
    parked.submit(0, 0);
    parked.submit(2, 2);
    parked.scheduler.set_prioritizer(&parked.handle, None);

    assert_eq!(parked.finish(), vec![2, 0]);
}

#[test]
fn shuffled_submissions_follow_dispatch_order() {
    let gate = Gate::closed();
    let parked = Parked::new(TestSource::new("a").gated(&gate), gate);

    // x encodes (level, submission index) so the expected order can be
    // computed from the tags alone.
    let mut levels: Vec<u32> = (0..6).flat_map(|level| [level; 5]).collect();
    levels.shuffle(&mut StdRng::seed_from_u64(0x5eed));

    let mut expected = Vec::new();
    for (index, level) in levels.iter().enumerate() {
        let x = (*level as i64) * 100 + index as i64;
        parked.submit(x, *level);
        expected.push((*level, index, x));
    }
    expected.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

    let expected: Vec<i64> = expected.into_iter().map(|(_, _, x)| x).collect();
    assert_eq!(parked.finish(), expected);
}

#[test]
fn sources_share_workers_by_request_age() {
    let gate = Gate::closed();
    let log = Arc::new(Mutex::new(Vec::new()));
    let parked = Parked::new(
        TestSource::new("a").gated(&gate).sharing_log(&log),
        gate.clone(),
    );

    let other = Arc::new(TestSource::new("b").gated(&gate).sharing_log(&log));
    let other_handle = SourceHandle::new(other.clone());

    for x in 1..4 {
        parked.submit(x, 0);
        submit_to(&parked.scheduler, &other_handle, &parked.recorder, x, 0);
    }
    parked.finish();

    let order: Vec<(&str, i64)> = log.lock().iter().skip(1).copied().collect();
    let position = |entry: (&str, i64)| order.iter().position(|e| *e == entry).unwrap();

    assert_eq!(order.len(), 6);
    // Neither source waits for the other to drain.
    assert!(position(("b", 1)) < position(("a", 3)));
    assert!(position(("a", 2)) < position(("b", 3)));
    // Each source keeps its own order.
    assert!(position(("a", 2)) < position(("a", 3)));
    assert!(position(("b", 1)) < position(("b", 2)));
    assert!(position(("b", 2)) < position(("b", 3)));
}
