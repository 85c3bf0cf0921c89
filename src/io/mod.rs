//! Raster, vector layer and coordinate transformation access

pub mod raster;
pub mod crs;
pub mod layer;
#[cfg(feature = "gdal")]
pub mod gdal_raster;

pub use raster::{MemoryRaster, MemoryRasterCatalog, RasterInfo, RasterOpener, RasterSource};
pub use crs::{BuiltinTransformer, CrsTransformer};
pub use layer::{AttributeValue, Feature, FieldDef, FieldType, MemoryLayer, VectorLayer};
#[cfg(feature = "gdal")]
pub use gdal_raster::{GdalRaster, GdalRasterOpener, GdalTransformer};
