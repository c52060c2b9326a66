//! Registered tile sources.
//!
//! A [`SourceHandle`] wraps a [`TileSource`] with the bookkeeping the
//! scheduler needs: a stable key for its request queue, a request id
//! counter, and a read lock so that at most one read per source runs at a
//! time. Requests only keep a weak reference to it; once every handle is
//! dropped, pending requests for the source end as canceled.

use crate::error::{FetchError, FetchResult};
use crate::listener::PANIC_ERROR_CODE;
use crate::request::{FetchRequest, RequestId};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tilefetch_raster::{Extent, ReadError, Region, TileSource, MAX_LEVEL};
use tracing::{debug, error};

/// Largest pixel buffer a single read may need, in bytes.
pub const MAX_TRANSFER_SIZE: usize = 1 << 30;

static NEXT_SOURCE_KEY: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a registered source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SourceKey(u64);

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source-{}", self.0)
    }
}

pub(crate) struct SourceShared {
    key: SourceKey,
    source: Arc<dyn TileSource>,
    next_request_id: AtomicU64,
    read_lock: Mutex<()>,
    // Id of the request inside `TileSource::read`, 0 when idle.
    reading: AtomicU64,
    valid: AtomicBool,
}

impl SourceShared {
    pub(crate) fn source(&self) -> &dyn TileSource {
        self.source.as_ref()
    }

    /// Read `request` into `buf` under the source's read lock.
    ///
    /// Returns `Ok(true)` when pixels were read and `Ok(false)` for an empty
    /// request, which completes without touching the source. A panicking
    /// source fails the request with [`PANIC_ERROR_CODE`].
    pub(crate) fn fill(&self, request: &FetchRequest, buf: &mut [u8]) -> Result<bool, ReadError> {
        let _read = self.read_lock.lock();

        self.reading.store(request.id(), Ordering::SeqCst);
        let result = if !self.valid.load(Ordering::SeqCst) || request.is_canceled() {
            Err(ReadError::Aborted)
        } else if request.region().is_empty() || request.dest().is_empty() {
            Ok(false)
        } else {
            panic::catch_unwind(AssertUnwindSafe(|| {
                self.source.read(request.region(), request.dest(), buf)
            }))
            .unwrap_or_else(|_| {
                error!(request = request.id(), source = %self.key, "tile source panicked");
                Err(ReadError::failed(PANIC_ERROR_CODE, "tile source panicked"))
            })
            .map(|()| true)
        };
        self.reading.store(0, Ordering::SeqCst);

        result
    }

    /// Bytes needed to read into `dest`.
    pub(crate) fn transfer_size(&self, dest: Extent) -> FetchResult<usize> {
        match self.source.transfer_size(dest) {
            Some(size) if size <= MAX_TRANSFER_SIZE => Ok(size),
            _ => Err(FetchError::InvalidArgument(format!(
                "destination {}x{} exceeds {} bytes",
                dest.width, dest.height, MAX_TRANSFER_SIZE
            ))),
        }
    }

    /// Ask the source to stop the read for `id`, if that read is running.
    pub(crate) fn abort_read(&self, id: RequestId) {
        if self.reading.load(Ordering::SeqCst) == id {
            self.source.abort_current_read();
        }
    }
}

/// Cloneable handle to a tile source registered with the scheduler.
#[derive(Clone)]
pub struct SourceHandle {
    shared: Arc<SourceShared>,
}

impl SourceHandle {
    pub fn new(source: Arc<dyn TileSource>) -> Self {
        let key = SourceKey(NEXT_SOURCE_KEY.fetch_add(1, Ordering::Relaxed));
        debug!(source = %key, "registered tile source");
        Self {
            shared: Arc::new(SourceShared {
                key,
                source,
                next_request_id: AtomicU64::new(1),
                read_lock: Mutex::new(()),
                reading: AtomicU64::new(0),
                valid: AtomicBool::new(true),
            }),
        }
    }

    pub fn key(&self) -> SourceKey {
        self.shared.key
    }

    pub fn source(&self) -> &Arc<dyn TileSource> {
        &self.shared.source
    }

    /// Returns `false` once [`dispose`](Self::dispose) has been called.
    pub fn is_valid(&self) -> bool {
        self.shared.valid.load(Ordering::SeqCst)
    }

    /// Mark the source unusable.
    ///
    /// Requests that have not read yet end as canceled, and a read in
    /// progress is asked to abort. Requests still queued should also be
    /// removed with [`IoScheduler::abort_all`](crate::IoScheduler::abort_all).
    pub fn dispose(&self) {
        if self.shared.valid.swap(false, Ordering::SeqCst) {
            debug!(source = %self.shared.key, "disposing tile source");
            if self.shared.reading.load(Ordering::SeqCst) != 0 {
                self.shared.source.abort_current_read();
            }
        }
    }

    /// Read one tile synchronously on the calling thread.
    ///
    /// The read is serialized with scheduled reads on the same source.
    pub fn read_tile(&self, level: u32, column: i64, row: i64) -> FetchResult<Vec<u8>> {
        let geometry = self.shared.source.geometry()?;
        let region = geometry.source_region_for_tile(level, column, row)?;
        let dest = geometry.tile_extent(level, column, row)?;
        self.read_into(region, dest)
    }

    /// Read `region` (native resolution pixels) scaled to `dest`
    /// synchronously on the calling thread.
    pub fn read_region(&self, region: Region, dest: Extent) -> FetchResult<Vec<u8>> {
        check_region(region)?;
        self.read_into(region, dest)
    }

    /// Content version of a tile, as reported by the source.
    pub fn tile_version(&self, level: u32, column: i64, row: i64) -> FetchResult<i64> {
        self.shared
            .source
            .geometry()?
            .source_region_for_tile(level, column, row)?;
        Ok(self.shared.source.tile_version(level, column, row))
    }

    fn read_into(&self, region: Region, dest: Extent) -> FetchResult<Vec<u8>> {
        let size = self.shared.transfer_size(dest)?;
        let mut data = vec![0u8; size];
        let _read = self.shared.read_lock.lock();
        if !self.is_valid() {
            return Err(FetchError::IllegalState(format!(
                "{} has been disposed",
                self.shared.key
            )));
        }
        if size > 0 && !region.is_empty() {
            self.shared.source.read(region, dest, &mut data)?;
        }
        Ok(data)
    }

    pub(crate) fn transfer_size(&self, dest: Extent) -> FetchResult<usize> {
        self.shared.transfer_size(dest)
    }

    pub(crate) fn next_request_id(&self) -> RequestId {
        self.shared.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn downgrade(&self) -> Weak<SourceShared> {
        Arc::downgrade(&self.shared)
    }
}

/// Reject regions with a negative origin or size, or whose far edge does not
/// fit in an `i64`.
pub(crate) fn check_region(region: Region) -> FetchResult<()> {
    if region.x < 0 || region.y < 0 {
        return Err(FetchError::InvalidArgument(format!(
            "region origin ({}, {}) is negative",
            region.x, region.y
        )));
    }
    if region.width < 0 || region.height < 0 {
        return Err(FetchError::InvalidArgument(format!(
            "region size {}x{} is negative",
            region.width, region.height
        )));
    }
    if region.x.checked_add(region.width).is_none() || region.y.checked_add(region.height).is_none()
    {
        return Err(FetchError::InvalidArgument(
            "region extends past the addressable range".to_string(),
        ));
    }
    Ok(())
}

/// Reject levels past [`MAX_LEVEL`].
pub(crate) fn check_level(level: u32) -> FetchResult<()> {
    if level > MAX_LEVEL {
        return Err(FetchError::InvalidArgument(format!(
            "level {} exceeds the maximum level {}",
            level, MAX_LEVEL
        )));
    }
    Ok(())
}

impl fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceHandle")
            .field("key", &self.shared.key)
            .field("width", &self.shared.source.width())
            .field("height", &self.shared.source.height())
            .field("valid", &self.is_valid())
            .finish()
    }
}
