//! Resolution pyramid arithmetic
//!
//! Maps `(level, column, row)` tile addresses to rectangles in the
//! full-resolution (level 0) source image. Each level halves the previous
//! one, rounding up, so the coarsest level always has a 1x1 tile grid and
//! the tiles of any level cover the full source extent exactly.
//!
//! All arithmetic is integer and ceiling-based; there is no floating point
//! anywhere in this module.

use serde::Serialize;

/// Highest pyramid level accepted by the geometry functions.
pub const MAX_LEVEL: u32 = 32;

/// A rectangle in full-resolution source pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct Region {
    /// Left edge (inclusive)
    pub x: i64,

    /// Top edge (inclusive)
    pub y: i64,

    /// Width in source pixels
    pub width: i64,

    /// Height in source pixels
    pub height: i64,
}

impl Region {
    /// Create a new region
    pub fn new(x: i64, y: i64, width: i64, height: i64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Returns `true` if the region covers no pixels.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Right edge (exclusive)
    pub fn right(&self) -> i64 {
        self.x + self.width
    }

    /// Bottom edge (exclusive)
    pub fn bottom(&self) -> i64 {
        self.y + self.height
    }
}

/// Output dimensions of a read, in destination pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct Extent {
    pub width: usize,
    pub height: usize,
}

impl Extent {
    /// Create a new extent
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    /// Returns `true` if the extent covers no pixels.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Number of pixels, or `None` on overflow.
    pub fn pixel_count(&self) -> Option<usize> {
        self.width.checked_mul(self.height)
    }
}

/// Number of tile columns and rows at one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TileCount {
    pub columns: i64,
    pub rows: i64,
}

impl TileCount {
    /// Total number of tiles in the grid
    pub fn total(&self) -> i64 {
        self.columns * self.rows
    }
}

/// Errors produced by pyramid arithmetic
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PyramidError {
    #[error("invalid raster geometry {width}x{height} with {tile_width}x{tile_height} tiles")]
    InvalidDimensions {
        width: i64,
        height: i64,
        tile_width: i64,
        tile_height: i64,
    },

    #[error("level {level} exceeds the maximum level {max}")]
    LevelOutOfRange { level: u32, max: u32 },

    #[error("tile ({column}, {row}) is outside the {columns}x{rows} grid at level {level}")]
    TileOutOfRange {
        level: u32,
        column: i64,
        row: i64,
        columns: i64,
        rows: i64,
    },

    #[error("source coordinate {0} is negative")]
    NegativeCoordinate(i64),
}

/// Full-resolution size and nominal tile size of a tiled raster.
///
/// Level `0` is the native resolution; level `n` is the native resolution
/// halved `n` times (rounding up).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PyramidGeometry {
    width: i64,
    height: i64,
    tile_width: i64,
    tile_height: i64,
}

impl PyramidGeometry {
    /// Create a geometry. All dimensions must be strictly positive.
    pub fn new(
        width: i64,
        height: i64,
        tile_width: i64,
        tile_height: i64,
    ) -> Result<Self, PyramidError> {
        if width <= 0 || height <= 0 || tile_width <= 0 || tile_height <= 0 {
            return Err(PyramidError::InvalidDimensions {
                width,
                height,
                tile_width,
                tile_height,
            });
        }

        Ok(Self {
            width,
            height,
            tile_width,
            tile_height,
        })
    }

    /// Full-resolution width
    pub fn width(&self) -> i64 {
        self.width
    }

    /// Full-resolution height
    pub fn height(&self) -> i64 {
        self.height
    }

    /// Nominal tile width
    pub fn tile_width(&self) -> i64 {
        self.tile_width
    }

    /// Nominal tile height
    pub fn tile_height(&self) -> i64 {
        self.tile_height
    }

    /// Width of the image at `level`.
    pub fn level_width(&self, level: u32) -> Result<i64, PyramidError> {
        check_level(level)?;
        Ok(ceil_shift(self.width, level))
    }

    /// Height of the image at `level`.
    pub fn level_height(&self, level: u32) -> Result<i64, PyramidError> {
        check_level(level)?;
        Ok(ceil_shift(self.height, level))
    }

    /// Number of tile columns and rows at `level`.
    pub fn tile_count(&self, level: u32) -> Result<TileCount, PyramidError> {
        Ok(TileCount {
            columns: div_ceil(self.level_width(level)?, self.tile_width),
            rows: div_ceil(self.level_height(level)?, self.tile_height),
        })
    }

    /// Source (level 0) rectangle covered by a tile.
    ///
    /// Tiles in the last column or row are clipped to the image edge and may
    /// be smaller than the nominal `tile size << level`.
    pub fn source_region_for_tile(
        &self,
        level: u32,
        column: i64,
        row: i64,
    ) -> Result<Region, PyramidError> {
        self.check_tile(level, column, row)?;

        let span_x = source_span(self.tile_width, level);
        let span_y = source_span(self.tile_height, level);
        let x = column * span_x;
        let y = row * span_y;

        Ok(Region {
            x,
            y,
            width: span_x.min(self.width - x),
            height: span_y.min(self.height - y),
        })
    }

    /// Output size of a tile at its own level.
    pub fn tile_extent(&self, level: u32, column: i64, row: i64) -> Result<Extent, PyramidError> {
        self.check_tile(level, column, row)?;

        let width = self
            .tile_width
            .min(self.level_width(level)? - column * self.tile_width);
        let height = self
            .tile_height
            .min(self.level_height(level)? - row * self.tile_height);

        Ok(Extent::new(width as usize, height as usize))
    }

    /// Tile column containing the source x-coordinate `src_x` at `level`.
    pub fn tile_column(&self, level: u32, src_x: i64) -> Result<i64, PyramidError> {
        check_level(level)?;
        if src_x < 0 {
            return Err(PyramidError::NegativeCoordinate(src_x));
        }
        Ok(src_x / source_span(self.tile_width, level))
    }

    /// Tile row containing the source y-coordinate `src_y` at `level`.
    pub fn tile_row(&self, level: u32, src_y: i64) -> Result<i64, PyramidError> {
        check_level(level)?;
        if src_y < 0 {
            return Err(PyramidError::NegativeCoordinate(src_y));
        }
        Ok(src_y / source_span(self.tile_height, level))
    }

    /// Number of levels until the whole image fits in a single tile.
    pub fn resolution_level_count(&self) -> u32 {
        resolution_level_count(self.width, self.height, self.tile_width, self.tile_height)
    }

    fn check_tile(&self, level: u32, column: i64, row: i64) -> Result<(), PyramidError> {
        let count = self.tile_count(level)?;
        if column < 0 || row < 0 || column >= count.columns || row >= count.rows {
            return Err(PyramidError::TileOutOfRange {
                level,
                column,
                row,
                columns: count.columns,
                rows: count.rows,
            });
        }
        Ok(())
    }
}

/// Number of resolution levels for an image of `width x height` cut into
/// `tile_width x tile_height` tiles.
///
/// Width and height are halved (rounding up) until both fit within one tile;
/// the returned count includes the native level. Degenerate inputs (any
/// dimension `<= 0`) have a single level.
pub fn resolution_level_count(width: i64, height: i64, tile_width: i64, tile_height: i64) -> u32 {
    if width <= 0 || height <= 0 || tile_width <= 0 || tile_height <= 0 {
        return 1;
    }

    let mut levels = 1;
    let (mut w, mut h) = (width, height);
    while div_ceil(w, tile_width) > 1 || div_ceil(h, tile_height) > 1 {
        w = ceil_shift(w, 1);
        h = ceil_shift(h, 1);
        levels += 1;
    }
    levels
}

fn check_level(level: u32) -> Result<(), PyramidError> {
    if level > MAX_LEVEL {
        return Err(PyramidError::LevelOutOfRange {
            level,
            max: MAX_LEVEL,
        });
    }
    Ok(())
}

/// `ceil(value / 2^level)`, never below 1. `value` must be positive.
fn ceil_shift(value: i64, level: u32) -> i64 {
    ((value - 1) >> level) + 1
}

/// Ceiling division of positive integers.
fn div_ceil(numerator: i64, denominator: i64) -> i64 {
    numerator / denominator + i64::from(numerator % denominator != 0)
}

/// Source pixels spanned by one nominal tile at `level`.
fn source_span(tile_size: i64, level: u32) -> i64 {
    tile_size.saturating_mul(1i64 << level)
}
