#![allow(dead_code)]

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tilefetch_raster::{Extent, PixelFormat, ReadError, Region, TileSource};
use tilefetch_scheduler::{FetchListener, RequestId, TileData};

pub const WAIT: Duration = Duration::from_secs(10);

/// Gate shared by sources so a test can hold every read until it is ready.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    changed: Condvar,
}

impl Gate {
    pub fn closed() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        *self.open.lock() = true;
        self.changed.notify_all();
    }
}

/// A source that logs every read as `(name, region.x)` and can be held at a
/// gate, fail on request or abort on demand.
pub struct TestSource {
    name: &'static str,
    size: i64,
    tile: i64,
    gate: Option<Arc<Gate>>,
    fail_at: Option<i64>,
    panic_at: Option<i64>,
    ignore_aborts: bool,
    log: Arc<Mutex<Vec<(&'static str, i64)>>>,
    entered: Mutex<usize>,
    entered_changed: Condvar,
    aborted: Mutex<bool>,
    aborts: AtomicUsize,
}

impl TestSource {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            size: 1 << 16,
            tile: 256,
            gate: None,
            fail_at: None,
            panic_at: None,
            ignore_aborts: false,
            log: Arc::default(),
            entered: Mutex::new(0),
            entered_changed: Condvar::new(),
            aborted: Mutex::new(false),
            aborts: AtomicUsize::new(0),
        }
    }

    pub fn gated(mut self, gate: &Arc<Gate>) -> Self {
        self.gate = Some(gate.clone());
        self
    }

    pub fn failing_at(mut self, x: i64) -> Self {
        self.fail_at = Some(x);
        self
    }

    pub fn panicking_at(mut self, x: i64) -> Self {
        self.panic_at = Some(x);
        self
    }

    /// Count abort hints but keep reading to the end.
    pub fn ignoring_aborts(mut self) -> Self {
        self.ignore_aborts = true;
        self
    }

    pub fn sharing_log(mut self, log: &Arc<Mutex<Vec<(&'static str, i64)>>>) -> Self {
        self.log = log.clone();
        self
    }

    /// Region x of every completed or attempted read, in order.
    pub fn reads(&self) -> Vec<i64> {
        self.log
            .lock()
            .iter()
            .filter(|(name, _)| *name == self.name)
            .map(|(_, x)| *x)
            .collect()
    }

    pub fn aborts(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    /// Wait until `count` reads have started.
    pub fn wait_for_reads(&self, count: usize) {
        let deadline = Instant::now() + WAIT;
        let mut entered = self.entered.lock();
        while *entered < count {
            assert!(
                !self
                    .entered_changed
                    .wait_until(&mut entered, deadline)
                    .timed_out(),
                "timed out waiting for {} reads",
                count
            );
        }
    }
}

impl TileSource for TestSource {
    fn width(&self) -> i64 {
        self.size
    }

    fn height(&self) -> i64 {
        self.size
    }

    fn tile_width(&self) -> i64 {
        self.tile
    }

    fn tile_height(&self) -> i64 {
        self.tile
    }

    fn pixel_format(&self) -> PixelFormat {
        PixelFormat::Monochrome
    }

    fn read(&self, region: Region, _dest: Extent, buf: &mut [u8]) -> Result<(), ReadError> {
        self.log.lock().push((self.name, region.x));
        *self.entered.lock() += 1;
        self.entered_changed.notify_all();

        if let Some(gate) = &self.gate {
            let mut open = gate.open.lock();
            while !*open {
                if *self.aborted.lock() {
                    break;
                }
                gate.changed.wait_for(&mut open, Duration::from_millis(5));
            }
        }
        if std::mem::take(&mut *self.aborted.lock()) {
            return Err(ReadError::Aborted);
        }
        if self.panic_at == Some(region.x) {
            panic!("decoder crashed at {}", region.x);
        }
        if self.fail_at == Some(region.x) {
            return Err(ReadError::failed(42, format!("bad tile at {}", region.x)));
        }

        buf.fill(region.x as u8);
        Ok(())
    }

    fn abort_current_read(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        if !self.ignore_aborts {
            *self.aborted.lock() = true;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Created(RequestId),
    Started(RequestId),
    Updated(RequestId, Vec<u8>),
    Completed(RequestId),
    Canceled(RequestId),
    Error(RequestId, i32, String),
}

/// Listener that records every notification and lets tests wait for
/// terminal ones.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
    changed: Condvar,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn events_for(&self, id: RequestId) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|event| event_id(event) == id)
            .collect()
    }

    /// Wait until `count` terminal notifications have been delivered.
    pub fn wait_terminal(&self, count: usize) {
        let deadline = Instant::now() + WAIT;
        let mut events = self.events.lock();
        while events.iter().filter(|e| is_terminal(e)).count() < count {
            assert!(
                !self.changed.wait_until(&mut events, deadline).timed_out(),
                "timed out waiting for {} terminal events, got {:?}",
                count,
                *events
            );
        }
    }

    fn push(&self, event: Event) {
        self.events.lock().push(event);
        self.changed.notify_all();
    }
}

fn event_id(event: &Event) -> RequestId {
    match event {
        Event::Created(id)
        | Event::Started(id)
        | Event::Updated(id, _)
        | Event::Completed(id)
        | Event::Canceled(id)
        | Event::Error(id, _, _) => *id,
    }
}

fn is_terminal(event: &Event) -> bool {
    matches!(
        event,
        Event::Completed(_) | Event::Canceled(_) | Event::Error(..)
    )
}

impl FetchListener for Recorder {
    fn created(&self, id: RequestId) {
        self.push(Event::Created(id));
    }

    fn started(&self, id: RequestId) {
        self.push(Event::Started(id));
    }

    fn updated(&self, id: RequestId, tile: &TileData<'_>) {
        self.push(Event::Updated(id, tile.data.to_vec()));
    }

    fn completed(&self, id: RequestId) {
        self.push(Event::Completed(id));
    }

    fn canceled(&self, id: RequestId) {
        self.push(Event::Canceled(id));
    }

    fn error(&self, id: RequestId, code: i32, message: &str) {
        self.push(Event::Error(id, code, message.to_string()));
    }
}

/// A 4x4-pixel region whose x coordinate tags the read in the source log.
pub fn tagged(x: i64) -> (Region, Extent) {
    (Region::new(x, 0, 4, 4), Extent::new(4, 4))
}
