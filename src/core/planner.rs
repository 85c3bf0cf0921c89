use crate::core::store::ProfileStore;
use crate::core::timeseries::{SensorId, TimeSeries};
use crate::types::{band_key, Geometry, ProfileError, ProfileId, ProfileResult};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Which bands of a sensor to extract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BandSelection {
    All,
    /// Explicit 0-based band indices
    Bands(Vec<usize>),
}

/// Band selection per sensor, with a fallback for unlisted sensors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandPolicy {
    default: BandSelection,
    per_sensor: HashMap<SensorId, BandSelection>,
}

impl Default for BandPolicy {
    fn default() -> Self {
        Self::all()
    }
}

impl BandPolicy {
    pub fn all() -> Self {
        Self {
            default: BandSelection::All,
            per_sensor: HashMap::new(),
        }
    }

    pub fn with_default(default: BandSelection) -> Self {
        Self {
            default,
            per_sensor: HashMap::new(),
        }
    }

    pub fn with_sensor(mut self, sensor: SensorId, selection: BandSelection) -> Self {
        self.per_sensor.insert(sensor, selection);
        self
    }

    pub fn sensors(&self) -> impl Iterator<Item = &SensorId> {
        self.per_sensor.keys()
    }

    /// Requested 0-based bands for a sensor, restricted to its band count.
    pub fn requested(&self, sensor: SensorId) -> Vec<usize> {
        let selection = self.per_sensor.get(&sensor).unwrap_or(&self.default);
        match selection {
            BandSelection::All => (0..sensor.bands).collect(),
            BandSelection::Bands(bands) => {
                let mut out: Vec<usize> = Vec::with_capacity(bands.len());
                for &b in bands {
                    if b < sensor.bands && !out.contains(&b) {
                        out.push(b);
                    }
                }
                out
            }
        }
    }
}

/// High-level extraction request
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub profiles: Vec<ProfileId>,
    pub band_policy: BandPolicy,
}

impl ExtractionRequest {
    pub fn new(profiles: Vec<ProfileId>, band_policy: BandPolicy) -> Self {
        Self { profiles, band_policy }
    }
}

/// One raster, the geometries to sample in it and the bands to read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionTask {
    pub uri: String,
    pub date: NaiveDate,
    pub geometries: Vec<Geometry>,
    /// 0-based band indices
    pub bands: Vec<usize>,
    /// Parallel to `geometries`
    pub profile_ids: Vec<ProfileId>,
}

/// Turns requests into per-acquisition extraction tasks
pub struct ExtractionPlanner;

impl ExtractionPlanner {
    /// Reject band policies naming sensors the time series does not know.
    pub fn validate(request: &ExtractionRequest, time_series: &TimeSeries) -> ProfileResult<()> {
        for sensor in request.band_policy.sensors() {
            if time_series.sensor(*sensor).is_none() {
                return Err(ProfileError::UnknownSensor(sensor.to_string()));
            }
        }
        Ok(())
    }

    /// Build tasks in (date, uri) order. Profiles already complete at an
    /// acquisition, or marked no-data there, are left out of its task.
    pub fn plan(request: &ExtractionRequest, time_series: &TimeSeries, store: &ProfileStore) -> Vec<ExtractionTask> {
        let profiles: Vec<_> = request
            .profiles
            .iter()
            .filter_map(|id| {
                let profile = store.profile(*id);
                if profile.is_none() {
                    log::debug!("Skipping unknown profile {} while planning", id);
                }
                profile
            })
            .collect();

        let mut tasks = Vec::new();
        if profiles.is_empty() {
            return tasks;
        }

        for acquisition in time_series.acquisitions() {
            let requested = request.band_policy.requested(acquisition.sensor);
            if requested.is_empty() {
                continue;
            }
            let mut task = ExtractionTask {
                uri: acquisition.uri.clone(),
                date: acquisition.date,
                geometries: Vec::new(),
                bands: Vec::new(),
                profile_ids: Vec::new(),
            };
            let mut needed = vec![false; acquisition.sensor.bands];
            for profile in &profiles {
                let missing: Vec<usize> = match store.observation(profile.id, &acquisition.uri) {
                    Some(obs) if obs.nodata => continue,
                    Some(obs) => requested
                        .iter()
                        .copied()
                        .filter(|&b| !obs.contains(&band_key(b + 1)))
                        .collect(),
                    None => requested.clone(),
                };
                if missing.is_empty() {
                    continue;
                }
                for b in missing {
                    needed[b] = true;
                }
                task.geometries.push(profile.geometry.clone());
                task.profile_ids.push(profile.id);
            }
            if task.profile_ids.is_empty() {
                continue;
            }
            task.bands = requested.into_iter().filter(|&b| needed[b]).collect();
            tasks.push(task);
        }

        tasks.sort_by(|a, b| (a.date, &a.uri).cmp(&(b.date, &b.uri)));
        log::debug!(
            "Planned {} tasks for {} profiles over {} acquisitions",
            tasks.len(),
            profiles.len(),
            time_series.len()
        );
        tasks
    }
}
