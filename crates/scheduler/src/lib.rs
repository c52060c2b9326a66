//! Tilefetch Scheduler Library
//!
//! Asynchronous fetch scheduler for tiled, multi-resolution rasters.
//!
//! Callers wrap a [`TileSource`](tilefetch_raster::TileSource) in a
//! [`SourceHandle`], build [`FetchRequest`]s for regions or pyramid tiles, and
//! submit them to an [`IoScheduler`]. A pool of worker threads reads the
//! requests from their sources, one read per source at a time, and reports
//! progress through each request's [`FetchListener`].
//!
//! Within a source, canceled requests are flushed first, then requests are
//! read coarsest level first and oldest first within a level, unless a
//! [`Prioritizer`] says otherwise. Across sources the oldest ready request
//! wins.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tilefetch_raster::{Extent, PixelFormat, ReadError, Region, TileSource};
//! use tilefetch_scheduler::{
//!     listener_fn, AbortFilter, FetchEvent, FetchRequest, IoScheduler, SchedulerConfig,
//!     SourceHandle,
//! };
//!
//! struct Checker;
//!
//! impl TileSource for Checker {
//!     fn width(&self) -> i64 { 2048 }
//!     fn height(&self) -> i64 { 2048 }
//!     fn tile_width(&self) -> i64 { 256 }
//!     fn tile_height(&self) -> i64 { 256 }
//!     fn pixel_format(&self) -> PixelFormat { PixelFormat::Rgba32 }
//!     fn read(&self, region: Region, _: Extent, buf: &mut [u8]) -> Result<(), ReadError> {
//!         let shade = if (region.x / 256 + region.y / 256) % 2 == 0 { 0 } else { 255 };
//!         buf.fill(shade);
//!         Ok(())
//!     }
//! }
//!
//! let scheduler = IoScheduler::with_config(SchedulerConfig::new(2));
//! let source = SourceHandle::new(Arc::new(Checker));
//!
//! let listener = listener_fn(|event| match event {
//!     FetchEvent::Updated { id, tile } => println!("request {}: {} bytes", id, tile.data.len()),
//!     FetchEvent::Error { id, message, .. } => eprintln!("request {} failed: {}", id, message),
//!     _ => {}
//! });
//!
//! // Coarsest level first: one overview tile, then the four tiles below it.
//! for (level, columns) in [(3, 1), (2, 2)] {
//!     for column in 0..columns {
//!         for row in 0..columns {
//!             let request =
//!                 FetchRequest::for_tile(&source, level, column, row, listener.clone()).unwrap();
//!             scheduler.submit(&request).unwrap();
//!         }
//!     }
//! }
//!
//! scheduler.wait_until_idle(Duration::from_secs(5)).unwrap();
//!
//! // The user scrolled away; drop anything still outstanding.
//! scheduler.abort_all(&source, AbortFilter::Listener(&listener));
//! ```

mod config;
mod error;
mod handle;
mod listener;
mod prioritizer;
mod queue;
mod request;
mod scheduler;
mod worker;

#[cfg(test)]
mod test_support;

// Re-export public API
pub use config::{ConfigError, SchedulerConfig, IDLE_TIMEOUT_ENV, WORKERS_ENV};
pub use error::{FetchError, FetchResult};
pub use handle::{SourceHandle, SourceKey, MAX_TRANSFER_SIZE};
pub use listener::{
    listener_fn, FetchEvent, FetchListener, FnListener, TileData, PANIC_ERROR_CODE,
};
pub use prioritizer::{dispatch_order, DefaultPrioritizer, Prioritizer};
pub use queue::RequestQueue;
pub use request::{FetchRequest, RequestId, RequestStatus, TileCoord};
pub use scheduler::{AbortFilter, IoScheduler, SchedulerStats};
