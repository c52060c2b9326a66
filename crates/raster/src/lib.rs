//! Tile Fetch Raster Library
//!
//! Geometry and collaborator contracts for tiled, multi-resolution rasters.
//!
//! This crate holds everything the fetch scheduler needs to know about a
//! raster without knowing how its pixels are decoded: the pyramid arithmetic
//! that maps `(level, column, row)` to source rectangles, the pixel formats a
//! source may deliver, and the [`TileSource`] trait that format-specific
//! readers implement.
//!
//! # Example
//!
//! ```
//! use tilefetch_raster::{resolution_level_count, PyramidGeometry};
//!
//! let geometry = PyramidGeometry::new(1000, 1000, 256, 256).unwrap();
//! assert_eq!(geometry.tile_count(0).unwrap().columns, 4);
//! assert_eq!(resolution_level_count(1000, 1000, 256, 256), 3);
//!
//! let region = geometry.source_region_for_tile(0, 3, 3).unwrap();
//! assert_eq!((region.x, region.width), (768, 232));
//! ```

mod format;
mod pyramid;
mod source;

pub use format::PixelFormat;
pub use pyramid::{
    resolution_level_count, Extent, PyramidError, PyramidGeometry, Region, TileCount, MAX_LEVEL,
};
pub use source::{ReadError, TileSource};
