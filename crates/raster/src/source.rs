//! Tile source contract
//!
//! A [`TileSource`] is the synchronous, potentially slow decoder behind a
//! raster. The fetch scheduler never decodes pixels itself; it calls
//! [`TileSource::read`] from a worker thread and forwards the result.

use crate::format::PixelFormat;
use crate::pyramid::{Extent, PyramidError, PyramidGeometry, Region};

/// Errors a source may report from [`TileSource::read`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    /// The read stopped early after [`TileSource::abort_current_read`].
    #[error("read aborted")]
    Aborted,

    /// The read failed; `code` and `message` are passed through untouched.
    #[error("source read failed (code {code}): {message}")]
    Failed { code: i32, message: String },
}

impl ReadError {
    /// Create a failure with a source specific code.
    pub fn failed(code: i32, message: impl Into<String>) -> Self {
        ReadError::Failed {
            code,
            message: message.into(),
        }
    }
}

/// Tiled, multi-resolution raster data.
///
/// One instance may be shared by many outstanding fetches. Implementations
/// must be thread-safe, but reads on a single source are never issued
/// concurrently by the scheduler.
pub trait TileSource: Send + Sync {
    /// Width of the image at native resolution.
    fn width(&self) -> i64;

    /// Height of the image at native resolution.
    fn height(&self) -> i64;

    /// Nominal tile width.
    fn tile_width(&self) -> i64;

    /// Nominal tile height.
    fn tile_height(&self) -> i64;

    /// Layout of the pixels written by [`read`](Self::read).
    fn pixel_format(&self) -> PixelFormat;

    /// Read `region` (native resolution pixels) scaled to `dest` into `buf`.
    ///
    /// `buf` is exactly [`transfer_size(dest)`](Self::transfer_size) bytes.
    fn read(&self, region: Region, dest: Extent, buf: &mut [u8]) -> Result<(), ReadError>;

    /// Hint that the read currently in progress should stop as soon as
    /// possible. Sources that cannot abort ignore it.
    fn abort_current_read(&self) {}

    /// Returns `true` if the source can decode reduced resolutions directly
    /// instead of subsampling the native level.
    fn is_multi_resolution(&self) -> bool {
        false
    }

    /// Version of the tile's content. Sources whose tiles change over time
    /// bump it so that cached copies can be invalidated; static sources keep
    /// the default of 0.
    fn tile_version(&self, _level: u32, _column: i64, _row: i64) -> i64 {
        0
    }

    /// Pyramid geometry of this source.
    fn geometry(&self) -> Result<PyramidGeometry, PyramidError> {
        PyramidGeometry::new(
            self.width(),
            self.height(),
            self.tile_width(),
            self.tile_height(),
        )
    }

    /// Width of the image at `level`.
    fn level_width(&self, level: u32) -> Result<i64, PyramidError> {
        self.geometry()?.level_width(level)
    }

    /// Height of the image at `level`.
    fn level_height(&self, level: u32) -> Result<i64, PyramidError> {
        self.geometry()?.level_height(level)
    }

    /// Number of resolution levels available from this source.
    fn resolution_level_count(&self) -> Result<u32, PyramidError> {
        Ok(self.geometry()?.resolution_level_count())
    }

    /// Bytes needed for a read into `dest`, or `None` on overflow.
    fn transfer_size(&self, dest: Extent) -> Option<usize> {
        self.pixel_format().transfer_size(dest)
    }
}
