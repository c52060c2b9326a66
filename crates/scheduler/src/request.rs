//! Fetch requests and their lifecycle.
//!
//! A [`FetchRequest`] reads one source region, scaled to a destination size,
//! and reports to a single [`FetchListener`]. The request moves through
//! `Created -> Queued -> Servicing` and ends in exactly one of `Completed`,
//! `Canceled` or `Failed`. Cancellation may happen at any point and from any
//! thread.
//!
//! Notifications for a request are delivered while holding the request's
//! reentrant lock, so a listener may cancel the request it is being notified
//! about without deadlocking, and a cancel racing with a worker never
//! interleaves with the worker's own notifications.

use crate::error::{FetchError, FetchResult};
use crate::handle::{check_level, check_region, SourceHandle, SourceKey, SourceShared};
use crate::listener::{listener_key, FetchListener, TileData, PANIC_ERROR_CODE};
use crate::worker::ScratchBuffer;
use parking_lot::ReentrantMutex;
use serde::Serialize;
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tilefetch_raster::{Extent, ReadError, Region};
use tracing::{trace, warn};

/// Identifier of a request, unique per source and increasing with creation
/// order.
pub type RequestId = u64;

pub(crate) type RequestKey = (SourceKey, RequestId);

/// Tile address of a request built with [`FetchRequest::for_tile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TileCoord {
    pub column: i64,
    pub row: i64,
}

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RequestStatus {
    Created,
    Queued,
    Servicing,
    Completed,
    Canceled,
    Failed,
}

impl RequestStatus {
    /// Returns `true` once no further notification will be delivered.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Canceled | RequestStatus::Failed
        )
    }
}

/// How a worker's attempt at a request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Completed,
    Failed,
    /// Canceled while servicing, or the source went away.
    Canceled,
    /// Already canceled before a worker reached it; nothing was delivered.
    Flushed,
}

struct RequestState {
    listener: Option<Arc<dyn FetchListener>>,
    status: RequestStatus,
    servicing: bool,
}

/// A request to read one region of a tile source.
pub struct FetchRequest {
    id: RequestId,
    source_key: SourceKey,
    source: Weak<SourceShared>,
    region: Region,
    dest: Extent,
    level: u32,
    tile: Option<TileCoord>,
    transfer_size: usize,
    listener_key: usize,
    canceled: AtomicBool,
    state: ReentrantMutex<RefCell<RequestState>>,
}

impl FetchRequest {
    /// Request `region` of the source (native resolution pixels) scaled to
    /// `dest`, tagged with pyramid `level`.
    ///
    /// # Errors
    /// Returns [`FetchError::InvalidArgument`] for a negative origin or size,
    /// a level above [`MAX_LEVEL`](tilefetch_raster::MAX_LEVEL), or a
    /// destination larger than [`MAX_TRANSFER_SIZE`](crate::MAX_TRANSFER_SIZE) bytes.
    pub fn for_region(
        source: &SourceHandle,
        region: Region,
        dest: Extent,
        level: u32,
        listener: Arc<dyn FetchListener>,
    ) -> FetchResult<Arc<Self>> {
        check_region(region)?;
        check_level(level)?;

        Self::build(source, region, dest, level, None, listener)
    }

    /// Request tile (`column`, `row`) of pyramid `level`, using the source's
    /// geometry to derive the region and destination size.
    pub fn for_tile(
        source: &SourceHandle,
        level: u32,
        column: i64,
        row: i64,
        listener: Arc<dyn FetchListener>,
    ) -> FetchResult<Arc<Self>> {
        let geometry = source.source().geometry()?;
        let region = geometry.source_region_for_tile(level, column, row)?;
        let dest = geometry.tile_extent(level, column, row)?;

        Self::build(
            source,
            region,
            dest,
            level,
            Some(TileCoord { column, row }),
            listener,
        )
    }

    fn build(
        source: &SourceHandle,
        region: Region,
        dest: Extent,
        level: u32,
        tile: Option<TileCoord>,
        listener: Arc<dyn FetchListener>,
    ) -> FetchResult<Arc<Self>> {
        let transfer_size = source.transfer_size(dest)?;

        Ok(Arc::new(Self {
            id: source.next_request_id(),
            source_key: source.key(),
            source: source.downgrade(),
            region,
            dest,
            level,
            tile,
            transfer_size,
            listener_key: listener_key(&listener),
            canceled: AtomicBool::new(false),
            state: ReentrantMutex::new(RefCell::new(RequestState {
                listener: Some(listener),
                status: RequestStatus::Created,
                servicing: false,
            })),
        }))
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn source_key(&self) -> SourceKey {
        self.source_key
    }

    /// Source region in native resolution pixels.
    pub fn region(&self) -> Region {
        self.region
    }

    /// Size of the pixels delivered to the listener.
    pub fn dest(&self) -> Extent {
        self.dest
    }

    /// Pyramid level; 0 is native resolution.
    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn tile(&self) -> Option<TileCoord> {
        self.tile
    }

    /// Bytes delivered by the `updated` notification.
    pub fn transfer_size(&self) -> usize {
        self.transfer_size
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Returns `true` while a worker is executing the request.
    pub fn is_servicing(&self) -> bool {
        self.state.lock().borrow().servicing
    }

    pub fn status(&self) -> RequestStatus {
        self.state.lock().borrow().status
    }

    pub(crate) fn key(&self) -> RequestKey {
        (self.source_key, self.id)
    }

    pub(crate) fn has_listener_key(&self, key: usize) -> bool {
        self.listener_key == key
    }

    /// Cancel the request.
    ///
    /// The listener receives `canceled` unless the request already reached a
    /// terminal state; later calls do nothing. If a worker is reading the
    /// request, the source is asked to abort the read. Returns `true` if
    /// this call canceled the request.
    pub fn cancel(&self) -> bool {
        let guard = self.state.lock();
        if guard.borrow().status.is_terminal() || self.canceled.swap(true, Ordering::SeqCst) {
            return false;
        }

        let (listener, servicing) = {
            let mut state = guard.borrow_mut();
            let listener = state.listener.take();
            if listener.is_some() {
                state.status = RequestStatus::Canceled;
            }
            (listener, state.servicing)
        };

        let Some(listener) = listener else {
            return false;
        };
        trace!(request = self.id, source = %self.source_key, "request canceled");
        listener.canceled(self.id);

        if servicing {
            if let Some(source) = self.source.upgrade() {
                source.abort_read(self.id);
            }
        }
        true
    }

    /// Move from `Created` to `Queued`.
    pub(crate) fn mark_queued(&self) -> FetchResult<()> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        if state.status != RequestStatus::Created {
            return Err(FetchError::IllegalState(format!(
                "request {} of {} is {:?}, not Created",
                self.id, self.source_key, state.status
            )));
        }
        state.status = RequestStatus::Queued;
        Ok(())
    }

    pub(crate) fn notify_created(&self) {
        let guard = self.state.lock();
        let listener = guard.borrow().listener.clone();
        if let Some(listener) = listener {
            listener.created(self.id);
        }
    }

    /// Read the request on the calling worker and deliver the result.
    pub(crate) fn execute(&self, scratch: &mut ScratchBuffer) -> Outcome {
        {
            let guard = self.state.lock();
            let listener = {
                let mut state = guard.borrow_mut();
                let Some(listener) = state.listener.clone() else {
                    return Outcome::Flushed;
                };
                state.servicing = true;
                state.status = RequestStatus::Servicing;
                listener
            };
            listener.started(self.id);
        }

        let result = match self.source.upgrade() {
            Some(source) => {
                let buf = scratch.slice(self.transfer_size);
                match source.fill(self, buf) {
                    Ok(true) => {
                        let tile = TileData {
                            data: &*buf,
                            extent: self.dest,
                            format: source.source().pixel_format(),
                        };
                        self.notify_updated(&tile);
                        Ok(())
                    }
                    Ok(false) => Ok(()),
                    Err(error) => Err(error),
                }
            }
            None => Err(ReadError::Aborted),
        };

        self.finish(result)
    }

    /// End a request whose execution panicked in a listener callback. The
    /// listener gets `error` unless it already had its terminal notification.
    pub(crate) fn fail_after_panic(&self) -> Outcome {
        self.finish(Err(ReadError::failed(
            PANIC_ERROR_CODE,
            "fetch listener panicked",
        )));
        Outcome::Failed
    }

    fn notify_updated(&self, tile: &TileData<'_>) {
        let guard = self.state.lock();
        let listener = guard.borrow().listener.clone();
        if let Some(listener) = listener {
            listener.updated(self.id, tile);
        }
    }

    fn finish(&self, result: Result<(), ReadError>) -> Outcome {
        let guard = self.state.lock();
        let listener = {
            let mut state = guard.borrow_mut();
            state.servicing = false;
            let listener = state.listener.take();
            if listener.is_some() {
                state.status = match &result {
                    Ok(()) => RequestStatus::Completed,
                    Err(ReadError::Aborted) => RequestStatus::Canceled,
                    Err(ReadError::Failed { .. }) => RequestStatus::Failed,
                };
            }
            listener
        };

        // Canceled while reading; `cancel` already notified.
        let Some(listener) = listener else {
            return Outcome::Canceled;
        };

        match result {
            Ok(()) => {
                listener.completed(self.id);
                Outcome::Completed
            }
            Err(ReadError::Aborted) => {
                self.canceled.store(true, Ordering::SeqCst);
                listener.canceled(self.id);
                Outcome::Canceled
            }
            Err(ReadError::Failed { code, message }) => {
                warn!(
                    request = self.id,
                    source = %self.source_key,
                    code,
                    %message,
                    "tile read failed"
                );
                listener.error(self.id, code, &message);
                Outcome::Failed
            }
        }
    }
}

impl fmt::Debug for FetchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchRequest")
            .field("id", &self.id)
            .field("source", &self.source_key)
            .field("region", &self.region)
            .field("dest", &self.dest)
            .field("level", &self.level)
            .field("tile", &self.tile)
            .field("canceled", &self.is_canceled())
            .finish()
    }
}
