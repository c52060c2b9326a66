use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tilefetch_raster::{Extent, PixelFormat, PyramidGeometry, ReadError, Region, TileSource};
use tilefetch_scheduler::{
    FetchListener, FetchRequest, IoScheduler, RequestId, SchedulerConfig, SourceHandle, TileData,
};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "tilefetch-cli")]
#[command(about = "Tile pyramid and fetch scheduler CLI")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct RasterArgs {
    /// Full resolution width in pixels.
    #[arg(long)]
    width: i64,
    /// Full resolution height in pixels.
    #[arg(long)]
    height: i64,
    /// Tile width (and height, unless --tile-height is given).
    #[arg(long, default_value_t = 256)]
    tile: i64,
    #[arg(long)]
    tile_height: Option<i64>,
}

impl RasterArgs {
    fn geometry(&self) -> Result<PyramidGeometry> {
        PyramidGeometry::new(
            self.width,
            self.height,
            self.tile,
            self.tile_height.unwrap_or(self.tile),
        )
        .context("invalid raster geometry")
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the resolution pyramid of a raster as JSON.
    Levels {
        #[command(flatten)]
        raster: RasterArgs,
    },
    /// Fetch every tile of a synthetic raster through the scheduler and
    /// print a JSON report.
    Fetch {
        #[command(flatten)]
        raster: RasterArgs,
        /// Only fetch this level; all levels, coarsest first, by default.
        #[arg(long)]
        level: Option<u32>,
        /// Worker pool size (overrides TILEFETCH_WORKERS).
        #[arg(long)]
        workers: Option<usize>,
        /// Idle timeout in milliseconds, 0 to disable (overrides
        /// TILEFETCH_IDLE_TIMEOUT_MS).
        #[arg(long)]
        idle_ms: Option<u64>,
        /// Make every Nth read fail.
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        fail_every: Option<u64>,
        /// Give up if the fetch has not drained after this many milliseconds.
        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,
        /// Write the report to this file instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print CLI version.
    Version,
}

#[derive(Debug, Serialize)]
struct LevelsOutput {
    width: i64,
    height: i64,
    tile_width: i64,
    tile_height: i64,
    level_count: u32,
    levels: Vec<LevelOutput>,
}

#[derive(Debug, Serialize)]
struct LevelOutput {
    level: u32,
    width: i64,
    height: i64,
    columns: i64,
    rows: i64,
}

#[derive(Debug, Serialize)]
struct FetchReport {
    levels: Vec<u32>,
    tiles: u64,
    workers: usize,
    completed: u64,
    canceled: u64,
    failed: u64,
    bytes: u64,
    elapsed_ms: u128,
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);

    match cli.command {
        Commands::Levels { raster } => run_levels(&raster),
        Commands::Fetch { raster, level, workers, idle_ms, fail_every, timeout_ms, output } => {
            let mut config =
                SchedulerConfig::from_env().context("invalid scheduler environment")?;
            if let Some(workers) = workers {
                config.worker_count = workers.max(1);
            }
            if let Some(idle_ms) = idle_ms {
                config.idle_timeout = (idle_ms > 0).then(|| Duration::from_millis(idle_ms));
            }
            run_fetch(
                &raster,
                level,
                config,
                fail_every,
                Duration::from_millis(timeout_ms),
                output.as_deref(),
            )
        }
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn run_levels(raster: &RasterArgs) -> Result<()> {
    let geometry = raster.geometry()?;
    let level_count = geometry.resolution_level_count();

    let levels = (0..level_count)
        .map(|level| -> Result<LevelOutput> {
            let tiles = geometry.tile_count(level)?;
            Ok(LevelOutput {
                level,
                width: geometry.level_width(level)?,
                height: geometry.level_height(level)?,
                columns: tiles.columns,
                rows: tiles.rows,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let payload = LevelsOutput {
        width: geometry.width(),
        height: geometry.height(),
        tile_width: geometry.tile_width(),
        tile_height: geometry.tile_height(),
        level_count,
        levels,
    };

    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn run_fetch(
    raster: &RasterArgs,
    level: Option<u32>,
    config: SchedulerConfig,
    fail_every: Option<u64>,
    timeout: Duration,
    output: Option<&Path>,
) -> Result<()> {
    let geometry = raster.geometry()?;
    let level_count = geometry.resolution_level_count();
    let levels: Vec<u32> = match level {
        Some(level) if level >= level_count => {
            anyhow::bail!("level {level} is beyond the coarsest level {}", level_count - 1)
        }
        Some(level) => vec![level],
        None => (0..level_count).rev().collect(),
    };

    let workers = config.worker_count;
    let scheduler = IoScheduler::with_config(config);
    let handle = SourceHandle::new(Arc::new(SyntheticSource::new(geometry, fail_every)));
    let tally = Arc::new(Tally::default());
    let started = Instant::now();

    let mut tiles = 0;
    for level in &levels {
        let count = geometry.tile_count(*level)?;
        for row in 0..count.rows {
            for column in 0..count.columns {
                let request = FetchRequest::for_tile(&handle, *level, column, row, tally.clone())?;
                scheduler.submit(&request)?;
                tiles += 1;
            }
        }
    }

    scheduler.wait_until_idle(timeout).context("fetch did not drain in time")?;

    let stats = scheduler.stats();
    let report = FetchReport {
        levels,
        tiles,
        workers,
        completed: stats.completed,
        canceled: stats.canceled,
        failed: stats.failed,
        bytes: tally.bytes.load(Ordering::Relaxed),
        elapsed_ms: started.elapsed().as_millis(),
    };
    info!(tiles, completed = report.completed, failed = report.failed, "fetch finished");

    let json = serde_json::to_string_pretty(&report)?;
    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, json)
                .with_context(|| format!("failed to write report to {}", path.display()))?;
            println!("{}", path.display());
        }
        None => println!("{json}"),
    }

    Ok(())
}

/// Counts bytes delivered to the fetch listener.
#[derive(Default)]
struct Tally {
    bytes: AtomicU64,
}

impl FetchListener for Tally {
    fn updated(&self, _id: RequestId, tile: &TileData<'_>) {
        self.bytes.fetch_add(tile.data.len() as u64, Ordering::Relaxed);
    }
}

/// An RGB gradient that costs nothing to decode.
struct SyntheticSource {
    geometry: PyramidGeometry,
    fail_every: Option<u64>,
    reads: AtomicU64,
}

impl SyntheticSource {
    fn new(geometry: PyramidGeometry, fail_every: Option<u64>) -> Self {
        Self { geometry, fail_every, reads: AtomicU64::new(0) }
    }
}

impl TileSource for SyntheticSource {
    fn width(&self) -> i64 {
        self.geometry.width()
    }

    fn height(&self) -> i64 {
        self.geometry.height()
    }

    fn tile_width(&self) -> i64 {
        self.geometry.tile_width()
    }

    fn tile_height(&self) -> i64 {
        self.geometry.tile_height()
    }

    fn pixel_format(&self) -> PixelFormat {
        PixelFormat::Rgb24
    }

    fn read(&self, region: Region, dest: Extent, buf: &mut [u8]) -> Result<(), ReadError> {
        let read = self.reads.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(every) = self.fail_every {
            if read % every == 0 {
                return Err(ReadError::failed(-1, format!("synthetic failure on read {read}")));
            }
        }

        let width = dest.width.max(1);
        for (index, pixel) in buf.chunks_exact_mut(3).enumerate() {
            let x = region.x as usize + (index % width) * region.width as usize / width;
            let y = region.y as usize + (index / width) * region.height as usize / dest.height.max(1);
            pixel[0] = (x * 255 / self.geometry.width().max(1) as usize) as u8;
            pixel[1] = (y * 255 / self.geometry.height().max(1) as usize) as u8;
            pixel[2] = 128;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_source_gradient() {
        let geometry = PyramidGeometry::new(256, 256, 256, 256).unwrap();
        let source = SyntheticSource::new(geometry, None);
        let mut buf = vec![0u8; 2 * 2 * 3];
        source.read(Region::new(0, 0, 256, 256), Extent::new(2, 2), &mut buf).unwrap();

        assert_eq!(&buf[0..3], &[0, 0, 128]);
        // Second column samples x = 128.
        assert_eq!(buf[3], 127);
        // Second row samples y = 128.
        assert_eq!(buf[7], 127);
    }

    #[test]
    fn test_synthetic_source_fails_every_nth_read() {
        let geometry = PyramidGeometry::new(64, 64, 32, 32).unwrap();
        let source = SyntheticSource::new(geometry, Some(2));
        let mut buf = vec![0u8; 3];
        let region = Region::new(0, 0, 1, 1);
        let dest = Extent::new(1, 1);

        assert!(source.read(region, dest, &mut buf).is_ok());
        assert!(matches!(
            source.read(region, dest, &mut buf),
            Err(ReadError::Failed { code: -1, .. })
        ));
        assert!(source.read(region, dest, &mut buf).is_ok());
    }
}
