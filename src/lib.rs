//! eotsv-profiles: temporal profile extraction for EO time series
//!
//! Pixel values of registered locations are read from a stack of dated
//! rasters on a background worker, stored per profile and acquisition,
//! and projected to plottable series through band expressions.

pub mod types;
pub mod config;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{Crs, GeoTransform, Geometry, ProfileError, ProfileId, ProfileResult, RequestId, Shape};
pub use config::CoreConfig;
pub use io::{BuiltinTransformer, CrsTransformer, MemoryLayer, MemoryRaster, MemoryRasterCatalog, RasterOpener, VectorLayer};
pub use core::{
    BandPolicy, BandSelection, DateAxis, ExtractionRequest, ExpressionEvaluator, ProfileSession, ProfileStore,
    TimeSeries, WorkerEvent,
};
