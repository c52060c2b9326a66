//! Sources and listeners shared by unit tests.

use crate::listener::{FetchListener, TileData};
use crate::request::RequestId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tilefetch_raster::{Extent, PixelFormat, ReadError, Region, TileSource};

/// Synthetic RGB source that fills every pixel with the low byte of its x
/// coordinate and counts reads.
pub(crate) struct MockSource {
    width: i64,
    height: i64,
    tile: i64,
    failure: Option<(i32, String)>,
    panics: bool,
    reads: AtomicUsize,
}

impl MockSource {
    pub(crate) fn new(width: i64, height: i64, tile: i64) -> Self {
        Self {
            width,
            height,
            tile,
            failure: None,
            panics: false,
            reads: AtomicUsize::new(0),
        }
    }

    pub(crate) fn failing(mut self, code: i32, message: &str) -> Self {
        self.failure = Some((code, message.to_string()));
        self
    }

    pub(crate) fn panicking(mut self) -> Self {
        self.panics = true;
        self
    }

    pub(crate) fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl TileSource for MockSource {
    fn width(&self) -> i64 {
        self.width
    }

    fn height(&self) -> i64 {
        self.height
    }

    fn tile_width(&self) -> i64 {
        self.tile
    }

    fn tile_height(&self) -> i64 {
        self.tile
    }

    fn pixel_format(&self) -> PixelFormat {
        PixelFormat::Rgb24
    }

    fn read(&self, region: Region, dest: Extent, buf: &mut [u8]) -> Result<(), ReadError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.panics {
            panic!("decoder blew up at {:?}", region);
        }
        if let Some((code, message)) = &self.failure {
            return Err(ReadError::failed(*code, message.clone()));
        }
        for (i, pixel) in buf.chunks_exact_mut(3).enumerate() {
            let x = region.x as usize + i % dest.width.max(1);
            pixel.fill(x as u8);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Created(RequestId),
    Started(RequestId),
    Updated(RequestId, usize),
    Completed(RequestId),
    Canceled(RequestId),
    Error(RequestId, i32, String),
}

/// Listener that records every notification in order.
#[derive(Default)]
pub(crate) struct RecordingListener {
    events: Mutex<Vec<Event>>,
}

impl RecordingListener {
    pub(crate) fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

impl FetchListener for RecordingListener {
    fn created(&self, id: RequestId) {
        self.events.lock().push(Event::Created(id));
    }

    fn started(&self, id: RequestId) {
        self.events.lock().push(Event::Started(id));
    }

    fn updated(&self, id: RequestId, tile: &TileData<'_>) {
        self.events.lock().push(Event::Updated(id, tile.data.len()));
    }

    fn completed(&self, id: RequestId) {
        self.events.lock().push(Event::Completed(id));
    }

    fn canceled(&self, id: RequestId) {
        self.events.lock().push(Event::Canceled(id));
    }

    fn error(&self, id: RequestId, code: i32, message: &str) {
        self.events
            .lock()
            .push(Event::Error(id, code, message.to_string()));
    }
}
