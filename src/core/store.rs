//! Temporal profile store.
//!
//! The store owns the profile records and their per-acquisition data
//! maps. The vector layer only carries the fixed core schema plus any
//! user fields; band values live in the data map, keyed `b{i}` / `std{i}`.

use crate::config::CoreConfig;
use crate::core::extraction::{SlotResult, TaskResult};
use crate::core::timeseries::TimeSeries;
use crate::io::crs::CrsTransformer;
use crate::io::layer::{AttributeValue, FieldDef, FieldType, VectorLayer};
use crate::types::{
    band_key, parse_band_key, std_key, Geometry, ProfileError, ProfileId, ProfileResult, RequestId, Shape,
};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub const FIELD_ID: &str = "id";
pub const FIELD_NAME: &str = "name";
pub const FIELD_X: &str = "x";
pub const FIELD_Y: &str = "y";
pub const FIELD_LOADED: &str = "loaded";
pub const FIELD_NODATA: &str = "nodata";
pub const FIELD_TOTAL: &str = "total";

/// A persistent location accumulating per-date observations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporalProfile {
    pub id: ProfileId,
    pub name: String,
    /// Feature id in the profile layer
    pub fid: i64,
    /// Point geometry in the layer CRS
    pub geometry: Geometry,
}

impl TemporalProfile {
    pub fn xy(&self) -> (f64, f64) {
        match self.geometry.shape {
            Shape::Point { x, y } => (x, y),
            Shape::Rectangle { x_min, y_min, x_max, y_max } => ((x_min + x_max) / 2.0, (y_min + y_max) / 2.0),
        }
    }
}

/// Values of one profile at one acquisition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub date: NaiveDate,
    pub nodata: bool,
    values: BTreeMap<String, f64>,
}

impl Observation {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            nodata: false,
            values: BTreeMap::new(),
        }
    }

    pub fn doy(&self) -> u32 {
        self.date.ordinal()
    }

    /// Value stored under a `b{i}` or `std{i}` key
    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Mean of 1-based band `number`
    pub fn band(&self, number: usize) -> Option<f64> {
        self.get(&band_key(number))
    }

    pub fn std(&self, number: usize) -> Option<f64> {
        self.get(&std_key(number))
    }

    /// Number of `b{i}` keys present
    pub fn loaded_bands(&self) -> usize {
        self.values.keys().filter(|k| parse_band_key(k).is_some()).count()
    }

    pub fn values(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub(crate) fn set_band(&mut self, number: usize, mean: f64, std: Option<f64>) {
        self.values.insert(band_key(number), mean);
        if let Some(std) = std {
            self.values.insert(std_key(number), std);
        }
    }

    fn mark_nodata(&mut self) {
        self.nodata = true;
        self.values.clear();
    }
}

/// Loading status of a profile, counted in bands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProfileStatus {
    pub loaded: usize,
    pub nodata: usize,
    pub total: usize,
}

impl ProfileStatus {
    pub fn is_complete(&self) -> bool {
        self.loaded + self.nodata == self.total
    }

    /// Percentage of bands resolved (loaded or no-data)
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            100.0 * (self.loaded + self.nodata) as f64 / self.total as f64
        }
    }
}

/// What an ingestion did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub stale: bool,
    pub updated: Vec<ProfileId>,
    pub skipped: usize,
}

pub struct ProfileStore {
    config: CoreConfig,
    transformer: Arc<dyn CrsTransformer>,
    layer: Box<dyn VectorLayer>,
    profiles: BTreeMap<ProfileId, TemporalProfile>,
    data: HashMap<ProfileId, BTreeMap<String, Observation>>,
    next_id: u64,
    accepted: RequestId,
}

impl ProfileStore {
    /// Wrap a layer; the core schema is added where missing and existing
    /// features with an `id` attribute are adopted as profiles.
    pub fn new(
        config: CoreConfig,
        mut layer: Box<dyn VectorLayer>,
        transformer: Arc<dyn CrsTransformer>,
    ) -> ProfileResult<Self> {
        config.validate()?;
        let core_fields = [
            FieldDef::new(FIELD_ID, FieldType::Integer).mandatory(),
            FieldDef::new(FIELD_NAME, FieldType::Text).mandatory(),
            FieldDef::new(FIELD_X, FieldType::Real).mandatory(),
            FieldDef::new(FIELD_Y, FieldType::Real).mandatory(),
            FieldDef::new(FIELD_LOADED, FieldType::Integer),
            FieldDef::new(FIELD_NODATA, FieldType::Integer),
            FieldDef::new(FIELD_TOTAL, FieldType::Integer),
        ];
        for field in core_fields {
            if !layer.has_field(&field.name) {
                layer.add_field(field)?;
            }
        }

        let crs = layer.crs();
        let mut profiles = BTreeMap::new();
        let mut data = HashMap::new();
        let mut next_id = 1;
        for feature in layer.features() {
            let Some(id) = feature.attribute(FIELD_ID).as_i64().filter(|id| *id > 0) else {
                continue;
            };
            let id = ProfileId(id as u64);
            let name = feature
                .attribute(FIELD_NAME)
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| format!("Profile {}", id));
            profiles.insert(
                id,
                TemporalProfile {
                    id,
                    name,
                    fid: feature.fid,
                    geometry: Geometry::point(feature.x, feature.y, crs.clone()),
                },
            );
            data.insert(id, BTreeMap::new());
            next_id = next_id.max(id.0 + 1);
        }
        if !profiles.is_empty() {
            log::info!("Adopted {} profiles from existing layer", profiles.len());
        }

        Ok(Self {
            config,
            transformer,
            layer,
            profiles,
            data,
            next_id,
            accepted: RequestId(0),
        })
    }

    pub fn layer(&self) -> &dyn VectorLayer {
        &*self.layer
    }

    /// Layer access for user schema edits (extra non-mandatory fields)
    pub fn layer_mut(&mut self) -> &mut dyn VectorLayer {
        &mut *self.layer
    }

    pub fn profile(&self, id: ProfileId) -> Option<&TemporalProfile> {
        self.profiles.get(&id)
    }

    pub fn profiles(&self) -> impl Iterator<Item = &TemporalProfile> {
        self.profiles.values()
    }

    pub fn profile_ids(&self) -> Vec<ProfileId> {
        self.profiles.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Find a profile whose location equals `geometry` within the
    /// tolerance of the query CRS.
    pub fn find(&self, geometry: &Geometry) -> Option<ProfileId> {
        let Shape::Point { x, y } = geometry.shape else {
            return None;
        };
        let epsilon = self.config.epsilon_for(&geometry.crs);
        self.profiles.values().find_map(|profile| {
            let (px, py) = profile.xy();
            let (qx, qy) = self
                .transformer
                .transform_point(&profile.geometry.crs, &geometry.crs, px, py)
                .ok()?;
            ((qx - x).abs() <= epsilon && (qy - y).abs() <= epsilon).then_some(profile.id)
        })
    }

    /// Register a location, returning the existing profile when an equal
    /// one is already stored.
    pub fn register(&mut self, geometry: &Geometry, name: Option<&str>) -> ProfileResult<ProfileId> {
        geometry.validate()?;
        if !matches!(geometry.shape, Shape::Point { .. }) {
            return Err(ProfileError::InvalidInput(
                "profiles must be registered with a point geometry".to_string(),
            ));
        }
        if let Some(existing) = self.find(geometry) {
            log::debug!("Location already registered as profile {}", existing);
            return Ok(existing);
        }

        let crs = self.layer.crs();
        let projected = self.transformer.transform_geometry(geometry, &crs)?;
        let Shape::Point { x, y } = projected.shape else {
            return Err(ProfileError::InvalidInput("point transformed into a non-point".to_string()));
        };

        let id = ProfileId(self.next_id);
        let name = name.map(str::to_string).unwrap_or_else(|| format!("Profile {}", id));
        let mut attributes = BTreeMap::new();
        attributes.insert(FIELD_ID.to_string(), AttributeValue::Integer(id.0 as i64));
        attributes.insert(FIELD_NAME.to_string(), AttributeValue::Text(name.clone()));
        attributes.insert(FIELD_X.to_string(), AttributeValue::Real(x));
        attributes.insert(FIELD_Y.to_string(), AttributeValue::Real(y));
        let fid = self.layer.add_feature(x, y, attributes)?;
        self.next_id += 1;

        self.profiles.insert(
            id,
            TemporalProfile {
                id,
                name,
                fid,
                geometry: Geometry::point(x, y, crs),
            },
        );
        self.data.insert(id, BTreeMap::new());
        log::debug!("Registered profile {} at ({}, {})", id, x, y);
        Ok(id)
    }

    pub fn rename(&mut self, id: ProfileId, name: &str) -> ProfileResult<()> {
        let profile = self.profiles.get_mut(&id).ok_or(ProfileError::UnknownProfile(id))?;
        self.layer
            .update_attribute(profile.fid, FIELD_NAME, AttributeValue::Text(name.to_string()))?;
        profile.name = name.to_string();
        Ok(())
    }

    /// Delete profiles, their features and data. Returns how many existed.
    pub fn remove(&mut self, ids: &[ProfileId]) -> usize {
        let mut fids = Vec::new();
        for id in ids {
            if let Some(profile) = self.profiles.remove(id) {
                fids.push(profile.fid);
                self.data.remove(id);
            }
        }
        self.layer.delete_features(&fids);
        fids.len()
    }

    /// Drop cached observations, e.g. after sources were replaced.
    pub fn clear_data(&mut self, ids: &[ProfileId]) {
        for id in ids {
            if let Some(map) = self.data.get_mut(id) {
                map.clear();
            }
        }
    }

    /// Forget observations of acquisitions no longer in the time series.
    pub fn purge_sources(&mut self, time_series: &TimeSeries) {
        for map in self.data.values_mut() {
            map.retain(|uri, _| time_series.acquisition(uri).is_some());
        }
    }

    pub fn observation(&self, id: ProfileId, uri: &str) -> Option<&Observation> {
        self.data.get(&id).and_then(|m| m.get(uri))
    }

    /// Observations of a profile keyed by source uri
    pub fn observations(&self, id: ProfileId) -> Option<&BTreeMap<String, Observation>> {
        self.data.get(&id)
    }

    pub fn accepted_request(&self) -> RequestId {
        self.accepted
    }

    /// Make `request` the current one; older results are dropped.
    pub fn accept_request(&mut self, request: RequestId) {
        if request > self.accepted {
            self.accepted = request;
        }
    }

    /// Stop accepting results of `request` (and anything older).
    pub fn reject_request(&mut self, request: RequestId) {
        self.accept_request(RequestId(request.0 + 1));
    }

    /// Apply a task result to the data maps.
    pub fn ingest(&mut self, result: &TaskResult, time_series: &TimeSeries) -> IngestSummary {
        let mut summary = IngestSummary::default();
        if result.request < self.accepted {
            log::debug!(
                "Dropping result of superseded request {} (accepted {})",
                result.request,
                self.accepted
            );
            summary.stale = true;
            return summary;
        }
        self.accepted = result.request;

        let Some(acquisition) = time_series
            .acquisition(&result.task.uri)
            .filter(|a| a.date == result.task.date)
        else {
            log::debug!("Dropping result for unknown source {}", result.task.uri);
            summary.skipped = result.task.profile_ids.len();
            return summary;
        };
        let band_count = acquisition.band_count();
        debug_assert_eq!(result.task.profile_ids.len(), result.task.geometries.len());

        for (index, id) in result.task.profile_ids.iter().enumerate() {
            let Some(map) = self.data.get_mut(id) else {
                log::debug!("Dropping result for unknown profile {}", id);
                summary.skipped += 1;
                continue;
            };
            let Some(slot) = result.slots.get(index) else {
                summary.skipped += 1;
                continue;
            };
            let observation = map
                .entry(acquisition.uri.clone())
                .or_insert_with(|| Observation::new(acquisition.date));
            match slot {
                SlotResult::OutOfImage | SlotResult::AllNoData => observation.mark_nodata(),
                SlotResult::Values { mean, std, .. } => {
                    observation.nodata = false;
                    for (i, &band) in result.bands.iter().enumerate() {
                        if band >= band_count {
                            log::warn!("{}: band index {} exceeds sensor band count {}", acquisition.uri, band, band_count);
                            continue;
                        }
                        if let Some(&m) = mean.get(i) {
                            observation.set_band(band + 1, m, std.get(i).copied());
                        }
                    }
                }
            }
            summary.updated.push(*id);
        }
        summary
    }

    /// Record an observation directly, e.g. when importing exported data.
    pub fn restore_observation(
        &mut self,
        id: ProfileId,
        uri: &str,
        observation: Observation,
        time_series: &TimeSeries,
    ) -> ProfileResult<()> {
        let acquisition = time_series
            .acquisition(uri)
            .ok_or_else(|| ProfileError::InvalidInput(format!("unknown source {}", uri)))?;
        if let Some(max) = observation.values.keys().filter_map(|k| parse_band_key(k)).max() {
            if max > acquisition.band_count() {
                return Err(ProfileError::InvalidInput(format!(
                    "{} has {} bands, observation holds b{}",
                    uri,
                    acquisition.band_count(),
                    max
                )));
            }
        }
        let map = self.data.get_mut(&id).ok_or(ProfileError::UnknownProfile(id))?;
        map.insert(uri.to_string(), observation);
        Ok(())
    }

    /// Loading status derived from the data map and the time series.
    pub fn status(&self, id: ProfileId, time_series: &TimeSeries) -> Option<ProfileStatus> {
        let map = self.data.get(&id)?;
        let mut status = ProfileStatus::default();
        for acquisition in time_series.acquisitions() {
            let nb = acquisition.band_count();
            status.total += nb;
            match map.get(&acquisition.uri) {
                Some(obs) if obs.nodata => status.nodata += nb,
                Some(obs) => status.loaded += obs.loaded_bands().min(nb),
                None => {}
            }
        }
        debug_assert!(status.loaded + status.nodata <= status.total);
        Some(status)
    }

    /// Write loaded / nodata / total into the layer attributes.
    pub fn refresh_status(&mut self, ids: &[ProfileId], time_series: &TimeSeries) -> ProfileResult<()> {
        for id in ids {
            let (Some(status), Some(profile)) = (self.status(*id, time_series), self.profiles.get(id)) else {
                continue;
            };
            let fid = profile.fid;
            self.layer
                .update_attribute(fid, FIELD_LOADED, AttributeValue::Integer(status.loaded as i64))?;
            self.layer
                .update_attribute(fid, FIELD_NODATA, AttributeValue::Integer(status.nodata as i64))?;
            self.layer
                .update_attribute(fid, FIELD_TOTAL, AttributeValue::Integer(status.total as i64))?;
        }
        Ok(())
    }
}
