//! Per-task pixel extraction.
//!
//! A task addresses one raster and a list of query geometries. Each
//! geometry is reprojected into the raster CRS, located in pixel space,
//! read through a window and reduced to per-band mean / standard
//! deviation over the samples that are valid in every requested band.

use crate::core::planner::ExtractionTask;
use crate::io::crs::CrsTransformer;
use crate::io::raster::{RasterOpener, RasterSource};
use crate::types::{Crs, GeoTransform, ProfileError, ProfileResult, RequestId, Shape};
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

/// Pixel window inside a raster: offset and size in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelWindow {
    pub x_off: usize,
    pub y_off: usize,
    pub size_x: usize,
    pub size_y: usize,
}

impl PixelWindow {
    pub fn sample_count(&self) -> usize {
        self.size_x * self.size_y
    }

    /// Upper-left and lower-right pixel (inclusive)
    pub fn corners(&self) -> ((usize, usize), (usize, usize)) {
        (
            (self.x_off, self.y_off),
            (
                self.x_off + self.size_x.saturating_sub(1),
                self.y_off + self.size_y.saturating_sub(1),
            ),
        )
    }
}

/// Where a geometry falls in a raster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLocation {
    /// No pixel in common with the raster
    OutOfImage,
    Window(PixelWindow),
}

/// Outcome for one geometry of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SlotResult {
    OutOfImage,
    AllNoData,
    Values {
        mean: Vec<f64>,
        std: Vec<f64>,
        /// Window the statistics were computed from
        window: PixelWindow,
        /// Number of samples valid in every band
        valid_samples: usize,
    },
}

impl SlotResult {
    /// True for outcomes that mark the acquisition as no-data
    pub fn is_nodata(&self) -> bool {
        !matches!(self, SlotResult::Values { .. })
    }
}

/// Result of one extraction task, echoing the task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task: ExtractionTask,
    pub request: RequestId,
    /// One slot per task geometry
    pub slots: Vec<SlotResult>,
    /// Band indices actually read (clamped, deduplicated)
    pub bands: Vec<usize>,
    pub crs: Option<Crs>,
    pub geo_transform: Option<GeoTransform>,
    pub no_data: Vec<Option<f64>>,
    /// Description of the error that failed the task
    pub error: Option<String>,
}

impl TaskResult {
    fn failed(task: &ExtractionTask, request: RequestId, error: String) -> Self {
        Self {
            task: task.clone(),
            request,
            slots: vec![SlotResult::OutOfImage; task.geometries.len()],
            bands: Vec::new(),
            crs: None,
            geo_transform: None,
            no_data: Vec::new(),
            error: Some(error),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Drop out-of-range band indices, keep first occurrences in order.
pub fn clamp_bands(bands: &[usize], band_count: usize) -> Vec<usize> {
    let mut seen = vec![false; band_count];
    bands
        .iter()
        .copied()
        .filter(|&b| b < band_count && !std::mem::replace(&mut seen[b], true))
        .collect()
}

/// Locate a shape, given in raster map coordinates, in pixel space.
///
/// Points select the pixel containing them; the far raster edges belong
/// to the last column / line. Rectangles select every pixel they
/// overlap, clamped to the raster.
pub fn locate(shape: &Shape, gt: &GeoTransform, samples: usize, lines: usize) -> PixelLocation {
    match *shape {
        Shape::Point { x, y } => {
            let (px, py) = gt.map_to_pixel(x, y);
            match (pixel_index(px, samples), pixel_index(py, lines)) {
                (Some(col), Some(row)) => PixelLocation::Window(PixelWindow {
                    x_off: col,
                    y_off: row,
                    size_x: 1,
                    size_y: 1,
                }),
                _ => PixelLocation::OutOfImage,
            }
        }
        Shape::Rectangle { x_min, y_min, x_max, y_max } => {
            let ul = gt.map_to_pixel(x_min, y_max);
            let lr = gt.map_to_pixel(x_max, y_min);
            if ![ul.0, ul.1, lr.0, lr.1].iter().all(|v| v.is_finite()) {
                return PixelLocation::OutOfImage;
            }
            let cols = pixel_span(ul.0, lr.0);
            let rows = pixel_span(ul.1, lr.1);
            // touching an edge shares no pixel with the raster
            if cols.1 <= 0.0 || cols.0 >= samples as f64 || rows.1 <= 0.0 || rows.0 >= lines as f64 {
                return PixelLocation::OutOfImage;
            }
            let clamp = |v: f64, n: usize| v.max(0.0).min(n as f64) as usize;
            let (c0, c1) = (clamp(cols.0, samples), clamp(cols.1, samples));
            let (r0, r1) = (clamp(rows.0, lines), clamp(rows.1, lines));
            if c1 <= c0 || r1 <= r0 {
                return PixelLocation::OutOfImage;
            }
            PixelLocation::Window(PixelWindow {
                x_off: c0,
                y_off: r0,
                size_x: c1 - c0,
                size_y: r1 - r0,
            })
        }
    }
}

fn pixel_index(p: f64, n: usize) -> Option<usize> {
    if !p.is_finite() || p < 0.0 || p > n as f64 || n == 0 {
        return None;
    }
    Some((p.floor() as usize).min(n - 1))
}

/// Half-open pixel span `[floor(lo), ceil(hi))` covered by two edges.
fn pixel_span(a: f64, b: f64) -> (f64, f64) {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let start = lo.floor();
    let end = hi.ceil();
    if end == start {
        // zero-width rectangle lying inside a pixel
        (start, start + 1.0)
    } else {
        (start, end)
    }
}

/// Per-band mean and population standard deviation over the sample
/// columns that are valid in every row. `None` when no column is valid.
pub fn summarize(samples: &Array2<f64>, no_data: &[Option<f64>]) -> Option<(Vec<f64>, Vec<f64>, usize)> {
    let valid: Vec<usize> = samples
        .axis_iter(Axis(1))
        .enumerate()
        .filter(|(_, column)| {
            column
                .iter()
                .zip(no_data)
                .all(|(v, nd)| !v.is_nan() && *nd != Some(*v))
        })
        .map(|(i, _)| i)
        .collect();
    if valid.is_empty() {
        return None;
    }
    let selected = samples.select(Axis(1), &valid);
    let mean = selected.mean_axis(Axis(1))?;
    let std = selected.std_axis(Axis(1), 0.0);
    Some((mean.to_vec(), std.to_vec(), valid.len()))
}

/// Run one task. Failures are captured in the result, never returned.
pub fn run_task(
    task: &ExtractionTask,
    request: RequestId,
    opener: &dyn RasterOpener,
    transformer: &dyn CrsTransformer,
) -> TaskResult {
    match try_run_task(task, request, opener, transformer) {
        Ok(result) => result,
        Err(e) => {
            log::warn!("Extraction from {} failed: {}", task.uri, e);
            TaskResult::failed(task, request, e.to_string())
        }
    }
}

fn try_run_task(
    task: &ExtractionTask,
    request: RequestId,
    opener: &dyn RasterOpener,
    transformer: &dyn CrsTransformer,
) -> ProfileResult<TaskResult> {
    let source = opener.open(&task.uri)?;
    let (samples, lines) = source.size();
    let band_count = source.band_count();
    let gt = source.geo_transform();
    let crs = source.crs();
    let bands = clamp_bands(&task.bands, band_count);
    let no_data: Vec<Option<f64>> = (0..band_count).map(|b| source.no_data(b)).collect();

    log::debug!(
        "Task {}: {} geometries, bands {:?}, raster {}x{}x{}",
        task.uri,
        task.geometries.len(),
        bands,
        samples,
        lines,
        band_count
    );

    let mut locations = Vec::with_capacity(task.geometries.len());
    for geometry in &task.geometries {
        let projected = transformer.transform_geometry(geometry, &crs)?;
        locations.push(locate(&projected.shape, &gt, samples, lines));
    }

    let all_bands = !bands.is_empty() && bands.len() == band_count && bands.iter().enumerate().all(|(i, b)| i == *b);
    let band_no_data: Vec<Option<f64>> = bands.iter().map(|&b| no_data[b]).collect();

    let mut slots = Vec::with_capacity(locations.len());
    for location in &locations {
        let slot = match location {
            PixelLocation::OutOfImage => SlotResult::OutOfImage,
            PixelLocation::Window(window) if bands.is_empty() || window.sample_count() == 0 => {
                SlotResult::AllNoData
            }
            PixelLocation::Window(window) => {
                let matrix = if all_bands {
                    read_all_bands(source.as_ref(), window)?
                } else {
                    read_band_subset(source.as_ref(), &bands, window)?
                };
                match summarize(&matrix, &band_no_data) {
                    Some((mean, std, valid_samples)) => SlotResult::Values {
                        mean,
                        std,
                        window: *window,
                        valid_samples,
                    },
                    None => SlotResult::AllNoData,
                }
            }
        };
        slots.push(slot);
    }

    Ok(TaskResult {
        task: task.clone(),
        request,
        slots,
        bands,
        crs: Some(crs),
        geo_transform: Some(gt),
        no_data,
        error: None,
    })
}

/// Read a window from all bands at once as `(nb, size_y * size_x)`.
fn read_all_bands(source: &dyn RasterSource, window: &PixelWindow) -> ProfileResult<Array2<f64>> {
    let block = source.read_block((window.x_off, window.y_off), (window.size_x, window.size_y))?;
    let nb = block.dim().0;
    let flat: Vec<f64> = block.iter().copied().collect();
    Array2::from_shape_vec((nb, window.sample_count()), flat)
        .map_err(|e| ProfileError::Raster(format!("Failed to reshape block: {}", e)))
}

/// Read a window band by band and stack as `(len(bands), size_y * size_x)`.
fn read_band_subset(source: &dyn RasterSource, bands: &[usize], window: &PixelWindow) -> ProfileResult<Array2<f64>> {
    let n = window.sample_count();
    let mut matrix = Array2::zeros((bands.len(), n));
    for (row, &band) in bands.iter().enumerate() {
        let data = source.read_window(band, (window.x_off, window.y_off), (window.size_x, window.size_y))?;
        matrix
            .row_mut(row)
            .iter_mut()
            .zip(data.iter())
            .for_each(|(dst, src)| *dst = *src);
    }
    Ok(matrix)
}
