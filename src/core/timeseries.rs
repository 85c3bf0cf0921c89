use crate::io::raster::{RasterInfo, RasterOpener};
use crate::types::{Crs, GeoTransform, ProfileError, ProfileResult};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Pixel sizes are compared at micro-unit resolution
const PIXEL_SIZE_SCALE: f64 = 1e6;

/// Sensor identity: band count and pixel size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SensorId {
    pub bands: usize,
    px_x: i64,
    px_y: i64,
}

impl SensorId {
    pub fn new(bands: usize, pixel_size_x: f64, pixel_size_y: f64) -> Self {
        Self {
            bands,
            px_x: (pixel_size_x.abs() * PIXEL_SIZE_SCALE).round() as i64,
            px_y: (pixel_size_y.abs() * PIXEL_SIZE_SCALE).round() as i64,
        }
    }

    pub fn pixel_size(&self) -> (f64, f64) {
        (
            self.px_x as f64 / PIXEL_SIZE_SCALE,
            self.px_y as f64 / PIXEL_SIZE_SCALE,
        )
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (x, y) = self.pixel_size();
        write!(f, "{}bands@{}x{}", self.bands, x, y)
    }
}

/// Equivalence class of acquisitions sharing band count and pixel size
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    pub id: SensorId,
    pub name: String,
    /// Per-band center wavelengths
    pub wavelengths: Option<Vec<f64>>,
    pub wavelength_unit: Option<String>,
}

impl Sensor {
    fn new(id: SensorId) -> Self {
        let (x, _) = id.pixel_size();
        Self {
            id,
            name: format!("{}bands@{}m", id.bands, x),
            wavelengths: None,
            wavelength_unit: None,
        }
    }

    pub fn band_count(&self) -> usize {
        self.id.bands
    }
}

/// A single raster observation at a given date
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acquisition {
    pub uri: String,
    pub sensor: SensorId,
    pub date: NaiveDate,
    pub crs: Crs,
    pub geo_transform: GeoTransform,
    pub samples: usize,
    pub lines: usize,
    pub visible: bool,
}

impl Acquisition {
    pub fn band_count(&self) -> usize {
        self.sensor.bands
    }
}

/// Acquisitions in ascending (date, uri) order plus their sensors.
#[derive(Debug, Clone, Default)]
pub struct TimeSeries {
    sensors: BTreeMap<SensorId, Sensor>,
    acquisitions: Vec<Acquisition>,
}

impl TimeSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `uri` and register it as an acquisition taken on `date`.
    pub fn add_source(&mut self, opener: &dyn RasterOpener, uri: &str, date: NaiveDate) -> ProfileResult<SensorId> {
        let info = RasterInfo::read(opener, uri)?;
        self.add_raster(&info, date)
    }

    /// Register a described raster; returns the sensor it was classified as.
    pub fn add_raster(&mut self, info: &RasterInfo, date: NaiveDate) -> ProfileResult<SensorId> {
        if info.bands == 0 {
            return Err(ProfileError::InvalidInput(format!("{} has no bands", info.uri)));
        }
        if self.acquisition(&info.uri).is_some() {
            return Err(ProfileError::InvalidInput(format!("{} is already part of the time series", info.uri)));
        }
        let (px_x, px_y) = info.geo_transform.pixel_size();
        let sensor = SensorId::new(info.bands, px_x, px_y);
        if !self.sensors.contains_key(&sensor) {
            log::info!("New sensor detected: {}", sensor);
            self.sensors.insert(sensor, Sensor::new(sensor));
        }
        let acquisition = Acquisition {
            uri: info.uri.clone(),
            sensor,
            date,
            crs: info.crs.clone(),
            geo_transform: info.geo_transform,
            samples: info.samples,
            lines: info.lines,
            visible: true,
        };
        let pos = self
            .acquisitions
            .partition_point(|a| (a.date, a.uri.as_str()) < (date, info.uri.as_str()));
        self.acquisitions.insert(pos, acquisition);
        Ok(sensor)
    }

    /// Remove acquisitions; sensors without acquisitions disappear too.
    pub fn remove_sources(&mut self, uris: &[&str]) -> usize {
        let before = self.acquisitions.len();
        self.acquisitions.retain(|a| !uris.contains(&a.uri.as_str()));
        let acquisitions = &self.acquisitions;
        self.sensors
            .retain(|id, _| acquisitions.iter().any(|a| a.sensor == *id));
        before - self.acquisitions.len()
    }

    pub fn acquisitions(&self) -> &[Acquisition] {
        &self.acquisitions
    }

    pub fn acquisition(&self, uri: &str) -> Option<&Acquisition> {
        self.acquisitions.iter().find(|a| a.uri == uri)
    }

    pub fn acquisitions_on(&self, date: NaiveDate) -> impl Iterator<Item = &Acquisition> {
        self.acquisitions.iter().filter(move |a| a.date == date)
    }

    /// Acquisitions of one sensor in ascending date order
    pub fn acquisitions_of(&self, sensor: SensorId) -> impl Iterator<Item = &Acquisition> {
        self.acquisitions.iter().filter(move |a| a.sensor == sensor)
    }

    pub fn sensors(&self) -> impl Iterator<Item = &Sensor> {
        self.sensors.values()
    }

    pub fn sensor(&self, id: SensorId) -> Option<&Sensor> {
        self.sensors.get(&id)
    }

    /// Change a sensor's display name; identity is unaffected.
    pub fn rename_sensor(&mut self, id: SensorId, name: &str) -> ProfileResult<()> {
        let sensor = self
            .sensors
            .get_mut(&id)
            .ok_or_else(|| ProfileError::UnknownSensor(id.to_string()))?;
        sensor.name = name.to_string();
        Ok(())
    }

    pub fn set_wavelengths(&mut self, id: SensorId, wavelengths: Vec<f64>, unit: &str) -> ProfileResult<()> {
        let sensor = self
            .sensors
            .get_mut(&id)
            .ok_or_else(|| ProfileError::UnknownSensor(id.to_string()))?;
        if wavelengths.len() != sensor.band_count() {
            return Err(ProfileError::InvalidInput(format!(
                "sensor {} has {} bands but {} wavelengths were given",
                id,
                sensor.band_count(),
                wavelengths.len()
            )));
        }
        sensor.wavelengths = Some(wavelengths);
        sensor.wavelength_unit = Some(unit.to_string());
        Ok(())
    }

    pub fn set_visible(&mut self, uri: &str, visible: bool) -> bool {
        match self.acquisitions.iter_mut().find(|a| a.uri == uri) {
            Some(a) => {
                a.visible = visible;
                true
            }
            None => false,
        }
    }

    /// Sum of band counts over all acquisitions
    pub fn total_band_count(&self) -> usize {
        self.acquisitions.iter().map(|a| a.band_count()).sum()
    }

    pub fn max_band_count(&self) -> usize {
        self.sensors.keys().map(|s| s.bands).max().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.acquisitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acquisitions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(uri: &str, bands: usize, px: f64) -> RasterInfo {
        RasterInfo {
            uri: uri.to_string(),
            samples: 10,
            lines: 10,
            bands,
            geo_transform: GeoTransform::north_up(0.0, 0.0, px, px),
            crs: Crs::epsg(32633),
            no_data: vec![None; bands],
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_sensor_classification_by_signature() {
        let mut ts = TimeSeries::new();
        let s1 = ts.add_raster(&info("a.tif", 6, 30.0), date(2020, 1, 1)).unwrap();
        let s2 = ts.add_raster(&info("b.tif", 6, 30.0), date(2020, 1, 2)).unwrap();
        let s3 = ts.add_raster(&info("c.tif", 4, 10.0), date(2020, 1, 3)).unwrap();
        let s4 = ts.add_raster(&info("d.tif", 6, 10.0), date(2020, 1, 4)).unwrap();
        assert_eq!(s1, s2);
        assert_ne!(s1, s3);
        assert_ne!(s1, s4);
        assert_eq!(ts.sensors().count(), 3);
        assert_eq!(ts.max_band_count(), 6);
        assert_eq!(ts.total_band_count(), 22);
    }

    #[test]
    fn test_acquisitions_sorted_by_date_then_uri() {
        let mut ts = TimeSeries::new();
        ts.add_raster(&info("z.tif", 1, 30.0), date(2020, 5, 1)).unwrap();
        ts.add_raster(&info("b.tif", 1, 30.0), date(2020, 1, 1)).unwrap();
        ts.add_raster(&info("a.tif", 1, 30.0), date(2020, 5, 1)).unwrap();
        let uris: Vec<_> = ts.acquisitions().iter().map(|a| a.uri.as_str()).collect();
        assert_eq!(uris, vec!["b.tif", "a.tif", "z.tif"]);
        assert!(ts.add_raster(&info("a.tif", 1, 30.0), date(2021, 1, 1)).is_err());
        assert_eq!(ts.acquisitions_on(date(2020, 5, 1)).count(), 2);
    }

    #[test]
    fn test_rename_keeps_identity_and_removal_drops_sensor() {
        let mut ts = TimeSeries::new();
        let s1 = ts.add_raster(&info("a.tif", 4, 10.0), date(2020, 1, 1)).unwrap();
        ts.rename_sensor(s1, "Sentinel-2").unwrap();
        let again = ts.add_raster(&info("b.tif", 4, 10.0), date(2020, 1, 5)).unwrap();
        assert_eq!(s1, again);
        assert_eq!(ts.sensor(s1).unwrap().name, "Sentinel-2");
        assert_eq!(ts.remove_sources(&["a.tif"]), 1);
        assert!(ts.sensor(s1).is_some());
        ts.remove_sources(&["b.tif"]);
        assert!(ts.sensor(s1).is_none());
        assert!(ts.rename_sensor(s1, "x").is_err());
    }

    #[test]
    fn test_wavelength_count_must_match() {
        let mut ts = TimeSeries::new();
        let s = ts.add_raster(&info("a.tif", 2, 10.0), date(2020, 1, 1)).unwrap();
        assert!(ts.set_wavelengths(s, vec![0.66], "um").is_err());
        ts.set_wavelengths(s, vec![0.66, 0.84], "um").unwrap();
        assert_eq!(ts.sensor(s).unwrap().wavelength_unit.as_deref(), Some("um"));
    }
}
