//! GDAL-backed raster reader and OSR coordinate transformer.

use crate::io::crs::CrsTransformer;
use crate::io::raster::{RasterOpener, RasterSource};
use crate::types::{Crs, GeoTransform, ProfileError, ProfileResult};
use gdal::spatial_ref::{CoordTransform, SpatialRef};
use gdal::Dataset;
use ndarray::Array2;

/// Describe a GDAL spatial reference as a [`Crs`].
pub fn crs_from_spatial_ref(srs: &SpatialRef) -> ProfileResult<Crs> {
    let geographic = srs.is_geographic();
    if let (Ok(name), Ok(code)) = (srs.auth_name(), srs.auth_code()) {
        if name.eq_ignore_ascii_case("EPSG") {
            return Ok(Crs::new(format!("EPSG:{}", code), geographic));
        }
    }
    Ok(Crs::new(srs.to_wkt()?, geographic))
}

fn spatial_ref_for(crs: &Crs) -> ProfileResult<SpatialRef> {
    let srs = match crs.epsg_code() {
        Some(code) => SpatialRef::from_epsg(code)?,
        None => SpatialRef::from_definition(crs.definition())?,
    };
    // x = easting/longitude regardless of the authority axis order
    srs.set_axis_mapping_strategy(gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);
    Ok(srs)
}

/// A raster opened through GDAL; closed when dropped.
pub struct GdalRaster {
    uri: String,
    dataset: Dataset,
    crs: Crs,
    geo_transform: GeoTransform,
}

impl GdalRaster {
    pub fn open(uri: &str) -> ProfileResult<Self> {
        log::debug!("Opening raster with GDAL: {}", uri);
        let dataset = Dataset::open(uri)?;
        let geo_transform = GeoTransform::from_gdal(dataset.geo_transform()?);
        let crs = match dataset.spatial_ref() {
            Ok(srs) => crs_from_spatial_ref(&srs)?,
            Err(_) => Crs::new(dataset.projection(), false),
        };
        Ok(Self {
            uri: uri.to_string(),
            dataset,
            crs,
            geo_transform,
        })
    }
}

impl RasterSource for GdalRaster {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn size(&self) -> (usize, usize) {
        self.dataset.raster_size()
    }

    fn band_count(&self) -> usize {
        self.dataset.raster_count().max(0) as usize
    }

    fn geo_transform(&self) -> GeoTransform {
        self.geo_transform
    }

    fn crs(&self) -> Crs {
        self.crs.clone()
    }

    fn no_data(&self, band: usize) -> Option<f64> {
        self.dataset
            .rasterband(band as isize + 1)
            .ok()
            .and_then(|b| b.no_data_value())
    }

    fn read_window(
        &self,
        band: usize,
        (x_off, y_off): (usize, usize),
        (size_x, size_y): (usize, usize),
    ) -> ProfileResult<Array2<f64>> {
        let rasterband = self.dataset.rasterband(band as isize + 1)?;
        let buffer = rasterband.read_as::<f64>(
            (x_off as isize, y_off as isize),
            (size_x, size_y),
            (size_x, size_y),
            None,
        )?;
        Array2::from_shape_vec((size_y, size_x), buffer.data)
            .map_err(|e| ProfileError::Raster(format!("Failed to reshape window: {}", e)))
    }
}

/// Opens any GDAL-readable uri
#[derive(Debug, Default, Clone, Copy)]
pub struct GdalRasterOpener;

impl RasterOpener for GdalRasterOpener {
    fn open(&self, uri: &str) -> ProfileResult<Box<dyn RasterSource>> {
        Ok(Box::new(GdalRaster::open(uri)?))
    }
}

/// OSR-backed transformer
#[derive(Debug, Default, Clone, Copy)]
pub struct GdalTransformer;

impl CrsTransformer for GdalTransformer {
    fn transform_point(&self, from: &Crs, to: &Crs, x: f64, y: f64) -> ProfileResult<(f64, f64)> {
        if from == to {
            return Ok((x, y));
        }
        let source = spatial_ref_for(from)?;
        let target = spatial_ref_for(to)?;
        let transform = CoordTransform::new(&source, &target)
            .map_err(|e| ProfileError::Transform(format!("{} -> {}: {}", from, to, e)))?;
        let mut xs = [x];
        let mut ys = [y];
        let mut zs = [0.0];
        transform
            .transform_coords(&mut xs, &mut ys, &mut zs)
            .map_err(|e| ProfileError::Transform(format!("({}, {}): {}", x, y, e)))?;
        if !xs[0].is_finite() || !ys[0].is_finite() {
            return Err(ProfileError::Transform(format!(
                "({}, {}) has no finite image in {}",
                x, y, to
            )));
        }
        Ok((xs[0], ys[0]))
    }
}
