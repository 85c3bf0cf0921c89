use crate::types::{Crs, GeoTransform, ProfileError, ProfileResult};
use ndarray::{Array2, Array3, Axis};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// An opened raster, read-only.
///
/// Band indices are 0-based. Windows are addressed by pixel offset
/// `(x_off, y_off)` and size `(size_x, size_y)` and come back shaped
/// `(size_y, size_x)`.
pub trait RasterSource {
    fn uri(&self) -> &str;

    /// Raster size as (samples, lines)
    fn size(&self) -> (usize, usize);

    fn band_count(&self) -> usize;

    fn geo_transform(&self) -> GeoTransform;

    fn crs(&self) -> Crs;

    /// Declared no-data value of a band, if any
    fn no_data(&self, band: usize) -> Option<f64>;

    fn read_window(
        &self,
        band: usize,
        offset: (usize, usize),
        size: (usize, usize),
    ) -> ProfileResult<Array2<f64>>;

    /// Read the same window from every band as `(nb, size_y, size_x)`.
    fn read_block(&self, offset: (usize, usize), size: (usize, usize)) -> ProfileResult<Array3<f64>> {
        let planes = (0..self.band_count())
            .map(|band| self.read_window(band, offset, size))
            .collect::<ProfileResult<Vec<_>>>()?;
        let views: Vec<_> = planes.iter().map(|p| p.view()).collect();
        if views.is_empty() {
            return Ok(Array3::zeros((0, size.1, size.0)));
        }
        ndarray::stack(Axis(0), &views)
            .map_err(|e| ProfileError::Raster(format!("Failed to stack band windows: {}", e)))
    }
}

/// Opens raster sources by uri. Shared with the worker thread.
pub trait RasterOpener: Send + Sync {
    fn open(&self, uri: &str) -> ProfileResult<Box<dyn RasterSource>>;
}

/// Static description of a raster, used when registering acquisitions
#[derive(Debug, Clone, PartialEq)]
pub struct RasterInfo {
    pub uri: String,
    pub samples: usize,
    pub lines: usize,
    pub bands: usize,
    pub geo_transform: GeoTransform,
    pub crs: Crs,
    pub no_data: Vec<Option<f64>>,
}

impl RasterInfo {
    pub fn read(opener: &dyn RasterOpener, uri: &str) -> ProfileResult<Self> {
        let source = opener.open(uri)?;
        let (samples, lines) = source.size();
        let bands = source.band_count();
        Ok(Self {
            uri: uri.to_string(),
            samples,
            lines,
            bands,
            geo_transform: source.geo_transform(),
            crs: source.crs(),
            no_data: (0..bands).map(|b| source.no_data(b)).collect(),
        })
    }
}

/// Raster held in memory as a `(nb, nl, ns)` cube.
#[derive(Debug, Clone)]
pub struct MemoryRaster {
    uri: String,
    data: Array3<f64>,
    geo_transform: GeoTransform,
    crs: Crs,
    no_data: Vec<Option<f64>>,
}

impl MemoryRaster {
    pub fn new(uri: impl Into<String>, data: Array3<f64>, geo_transform: GeoTransform, crs: Crs) -> Self {
        let nb = data.dim().0;
        Self {
            uri: uri.into(),
            data,
            geo_transform,
            crs,
            no_data: vec![None; nb],
        }
    }

    /// Raster whose every band is filled with a constant.
    pub fn filled(
        uri: impl Into<String>,
        band_values: &[f64],
        (ns, nl): (usize, usize),
        geo_transform: GeoTransform,
        crs: Crs,
    ) -> Self {
        let mut data = Array3::zeros((band_values.len(), nl, ns));
        for (band, value) in band_values.iter().enumerate() {
            data.index_axis_mut(Axis(0), band).fill(*value);
        }
        Self::new(uri, data, geo_transform, crs)
    }

    pub fn with_no_data(mut self, band: usize, value: f64) -> Self {
        if let Some(slot) = self.no_data.get_mut(band) {
            *slot = Some(value);
        }
        self
    }

    pub fn data_mut(&mut self) -> &mut Array3<f64> {
        &mut self.data
    }
}

impl RasterSource for MemoryRaster {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn size(&self) -> (usize, usize) {
        let (_, nl, ns) = self.data.dim();
        (ns, nl)
    }

    fn band_count(&self) -> usize {
        self.data.dim().0
    }

    fn geo_transform(&self) -> GeoTransform {
        self.geo_transform
    }

    fn crs(&self) -> Crs {
        self.crs.clone()
    }

    fn no_data(&self, band: usize) -> Option<f64> {
        self.no_data.get(band).copied().flatten()
    }

    fn read_window(
        &self,
        band: usize,
        (x_off, y_off): (usize, usize),
        (size_x, size_y): (usize, usize),
    ) -> ProfileResult<Array2<f64>> {
        let (nb, nl, ns) = self.data.dim();
        if band >= nb {
            return Err(ProfileError::Raster(format!(
                "{}: band {} out of range (nb={})",
                self.uri, band, nb
            )));
        }
        if x_off + size_x > ns || y_off + size_y > nl {
            return Err(ProfileError::Raster(format!(
                "{}: window {}x{}+{}+{} exceeds raster {}x{}",
                self.uri, size_x, size_y, x_off, y_off, ns, nl
            )));
        }
        let plane = self.data.index_axis(Axis(0), band);
        Ok(plane
            .slice(ndarray::s![y_off..y_off + size_y, x_off..x_off + size_x])
            .to_owned())
    }
}

/// Handle returned by the catalog; shares the raster with the catalog.
struct SharedRaster(Arc<MemoryRaster>);

impl RasterSource for SharedRaster {
    fn uri(&self) -> &str {
        self.0.uri()
    }
    fn size(&self) -> (usize, usize) {
        self.0.size()
    }
    fn band_count(&self) -> usize {
        self.0.band_count()
    }
    fn geo_transform(&self) -> GeoTransform {
        self.0.geo_transform()
    }
    fn crs(&self) -> Crs {
        self.0.crs()
    }
    fn no_data(&self, band: usize) -> Option<f64> {
        self.0.no_data(band)
    }
    fn read_window(
        &self,
        band: usize,
        offset: (usize, usize),
        size: (usize, usize),
    ) -> ProfileResult<Array2<f64>> {
        self.0.read_window(band, offset, size)
    }
}

/// In-memory rasters addressed by uri
#[derive(Default)]
pub struct MemoryRasterCatalog {
    rasters: RwLock<HashMap<String, Arc<MemoryRaster>>>,
}

impl MemoryRasterCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, raster: MemoryRaster) {
        if let Ok(mut rasters) = self.rasters.write() {
            rasters.insert(raster.uri.clone(), Arc::new(raster));
        }
    }

    pub fn remove(&self, uri: &str) -> bool {
        self.rasters
            .write()
            .map(|mut rasters| rasters.remove(uri).is_some())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.rasters.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RasterOpener for MemoryRasterCatalog {
    fn open(&self, uri: &str) -> ProfileResult<Box<dyn RasterSource>> {
        let rasters = self
            .rasters
            .read()
            .map_err(|_| ProfileError::Raster("raster catalog lock poisoned".to_string()))?;
        rasters
            .get(uri)
            .map(|r| Box::new(SharedRaster(Arc::clone(r))) as Box<dyn RasterSource>)
            .ok_or_else(|| ProfileError::Raster(format!("Unable to open raster: {}", uri)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_raster() -> MemoryRaster {
        let mut raster = MemoryRaster::filled(
            "mem://sample",
            &[1.0, 2.0],
            (4, 3),
            GeoTransform::north_up(0.0, 3.0, 1.0, 1.0),
            Crs::epsg(32633),
        );
        raster.data_mut()[[1, 2, 3]] = 9.0;
        raster
    }

    #[test]
    fn test_read_window_shape() {
        let raster = sample_raster();
        let window = raster.read_window(1, (2, 1), (2, 2)).unwrap();
        assert_eq!(window.dim(), (2, 2));
        assert_eq!(window[[1, 1]], 9.0);
        assert_eq!(window[[0, 0]], 2.0);
    }

    #[test]
    fn test_read_window_out_of_bounds() {
        let raster = sample_raster();
        assert!(raster.read_window(0, (3, 0), (2, 1)).is_err());
        assert!(raster.read_window(2, (0, 0), (1, 1)).is_err());
    }

    #[test]
    fn test_read_block_stacks_bands() {
        let raster = sample_raster();
        let block = raster.read_block((0, 0), (4, 3)).unwrap();
        assert_eq!(block.dim(), (2, 3, 4));
        assert_eq!(block[[0, 0, 0]], 1.0);
        assert_eq!(block[[1, 2, 3]], 9.0);
    }

    #[test]
    fn test_catalog_open() {
        let catalog = MemoryRasterCatalog::new();
        catalog.insert(sample_raster());
        let info = RasterInfo::read(&catalog, "mem://sample").unwrap();
        assert_eq!((info.samples, info.lines, info.bands), (4, 3, 2));
        assert!(catalog.open("mem://missing").is_err());
        assert!(catalog.remove("mem://sample"));
        assert!(catalog.is_empty());
    }
}
