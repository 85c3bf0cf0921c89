//! Profile session: the consumer side of the extraction worker.
//!
//! All store mutation happens on the thread owning the session. Worker
//! events are pulled with [`ProfileSession::process_events`] (non-blocking)
//! or [`ProfileSession::wait_idle`] and ingested under request-id gating.

use crate::config::CoreConfig;
use crate::core::evaluator::{DateAxis, ExpressionEvaluator, ProfileSeries};
use crate::core::export::{self, ProfileRecord};
use crate::core::planner::{ExtractionPlanner, ExtractionRequest};
use crate::core::store::{Observation, ProfileStatus, ProfileStore};
use crate::core::timeseries::{SensorId, TimeSeries};
use crate::core::worker::{ExtractionWorker, WorkerEvent};
use crate::io::crs::CrsTransformer;
use crate::io::layer::{MemoryLayer, VectorLayer};
use crate::io::raster::RasterOpener;
use crate::types::{Crs, Geometry, ProfileError, ProfileId, ProfileResult, RequestId};
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;

pub struct ProfileSession {
    time_series: TimeSeries,
    store: ProfileStore,
    opener: Arc<dyn RasterOpener>,
    transformer: Arc<dyn CrsTransformer>,
    worker: ExtractionWorker,
    events: Receiver<WorkerEvent>,
    next_request: u64,
    active: BTreeSet<RequestId>,
}

impl ProfileSession {
    pub fn new(
        config: CoreConfig,
        layer: Box<dyn VectorLayer>,
        opener: Arc<dyn RasterOpener>,
        transformer: Arc<dyn CrsTransformer>,
    ) -> ProfileResult<Self> {
        let (worker, events) = ExtractionWorker::spawn(&config, Arc::clone(&opener), Arc::clone(&transformer))?;
        let store = ProfileStore::new(config, layer, Arc::clone(&transformer))?;
        Ok(Self {
            time_series: TimeSeries::new(),
            store,
            opener,
            transformer,
            worker,
            events,
            next_request: 1,
            active: BTreeSet::new(),
        })
    }

    /// Session backed by an in-memory layer in the configured default CRS.
    pub fn in_memory(
        config: CoreConfig,
        opener: Arc<dyn RasterOpener>,
        transformer: Arc<dyn CrsTransformer>,
    ) -> ProfileResult<Self> {
        let layer = MemoryLayer::new(config.default_crs.clone());
        Self::new(config, Box::new(layer), opener, transformer)
    }

    pub fn time_series(&self) -> &TimeSeries {
        &self.time_series
    }

    pub fn time_series_mut(&mut self) -> &mut TimeSeries {
        &mut self.time_series
    }

    pub fn store(&self) -> &ProfileStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ProfileStore {
        &mut self.store
    }

    /// Open `uri` through the session's raster opener and add it.
    pub fn add_source(&mut self, uri: &str, date: NaiveDate) -> ProfileResult<SensorId> {
        let sensor = self.time_series.add_source(self.opener.as_ref(), uri, date)?;
        self.refresh_all()?;
        Ok(sensor)
    }

    /// Remove sources and the profile data observed on them.
    pub fn remove_sources(&mut self, uris: &[&str]) -> ProfileResult<usize> {
        let removed = self.time_series.remove_sources(uris);
        if removed > 0 {
            self.store.purge_sources(&self.time_series);
            self.refresh_all()?;
        }
        Ok(removed)
    }

    pub fn register(&mut self, geometry: &Geometry, name: Option<&str>) -> ProfileResult<ProfileId> {
        let id = self.store.register(geometry, name)?;
        self.store.refresh_status(&[id], &self.time_series)?;
        Ok(id)
    }

    /// Plan and queue a request. Earlier batches still running are
    /// cancelled; their late results are dropped on ingestion.
    pub fn submit(&mut self, request: &ExtractionRequest) -> ProfileResult<RequestId> {
        ExtractionPlanner::validate(request, &self.time_series)?;
        let tasks = ExtractionPlanner::plan(request, &self.time_series, &self.store);

        let id = RequestId(self.next_request);
        self.next_request += 1;
        for superseded in &self.active {
            self.worker.cancel(*superseded);
        }
        self.store.accept_request(id);
        log::info!("Submitting request {} with {} tasks", id, tasks.len());
        self.worker.submit(id, tasks)?;
        self.active.insert(id);
        Ok(id)
    }

    /// Best-effort cancellation of an active request. Its results are no
    /// longer ingested, including those already queued in the channel.
    /// Unknown or finished requests are left alone and give `false`.
    pub fn cancel(&mut self, request: RequestId) -> bool {
        if !self.active.contains(&request) {
            log::debug!("Ignoring cancel of inactive request {}", request);
            return false;
        }
        self.store.reject_request(request);
        self.worker.cancel(request);
        true
    }

    /// Requests without a terminal event yet
    pub fn active_requests(&self) -> Vec<RequestId> {
        self.active.iter().copied().collect()
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    /// Ingest one event. Data already sits in the store when the layer
    /// attributes fail to update, so that failure is only logged.
    fn handle(&mut self, event: &WorkerEvent) {
        match event {
            WorkerEvent::Result(result) => {
                let summary = self.store.ingest(result, &self.time_series);
                if !summary.updated.is_empty() {
                    if let Err(e) = self.store.refresh_status(&summary.updated, &self.time_series) {
                        log::error!("Failed to update status attributes for {}: {}", result.task.uri, e);
                    }
                }
            }
            WorkerEvent::Finished(request) | WorkerEvent::Cancelled(request) => {
                self.active.remove(request);
            }
            WorkerEvent::Progress { .. } => {}
        }
    }

    fn disconnected() -> ProfileError {
        ProfileError::InvalidInput("extraction worker stopped unexpectedly".to_string())
    }

    /// Drain pending events without blocking, ingesting results.
    pub fn process_events(&mut self) -> ProfileResult<Vec<WorkerEvent>> {
        let mut seen = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => {
                    self.handle(&event);
                    seen.push(event);
                }
                Err(TryRecvError::Empty) => return Ok(seen),
                Err(TryRecvError::Disconnected) if seen.is_empty() => return Err(Self::disconnected()),
                Err(TryRecvError::Disconnected) => return Ok(seen),
            }
        }
    }

    /// Block for the next event and ingest it.
    pub fn wait_event(&mut self) -> ProfileResult<WorkerEvent> {
        let event = self.events.recv().map_err(|_| Self::disconnected())?;
        self.handle(&event);
        Ok(event)
    }

    /// Block until every submitted request has terminated.
    pub fn wait_idle(&mut self) -> ProfileResult<Vec<WorkerEvent>> {
        let mut seen = Vec::new();
        while !self.active.is_empty() {
            seen.push(self.wait_event()?);
        }
        Ok(seen)
    }

    pub fn status(&self, id: ProfileId) -> Option<ProfileStatus> {
        self.store.status(id, &self.time_series)
    }

    /// Series of `expression` over the acquisitions of `sensor`.
    pub fn profile_data(
        &self,
        profile: ProfileId,
        sensor: SensorId,
        expression: &str,
        axis: DateAxis,
    ) -> ProfileResult<ProfileSeries> {
        ExpressionEvaluator::new(&self.store, &self.time_series).evaluate(profile, sensor, expression, axis)
    }

    fn refresh_all(&mut self) -> ProfileResult<()> {
        let ids = self.store.profile_ids();
        self.store.refresh_status(&ids, &self.time_series)
    }

    pub fn export_csv<P: AsRef<Path>>(&self, path: P) -> ProfileResult<usize> {
        let file = BufWriter::new(File::create(path)?);
        export::write_csv(file, &self.store, &self.time_series, self.transformer.as_ref())
    }

    pub fn export_geojson<P: AsRef<Path>>(&self, path: P) -> ProfileResult<usize> {
        let file = BufWriter::new(File::create(path)?);
        export::write_geojson(file, &self.store, &self.time_series, self.transformer.as_ref())
    }

    /// Import a CSV export. Rows are matched to profiles by location
    /// (new profiles are registered as needed) and to sources by uri;
    /// rows of sources missing from the time series are skipped.
    pub fn import_csv<P: AsRef<Path>>(&mut self, path: P) -> ProfileResult<Vec<ProfileId>> {
        let records = export::read_csv(BufReader::new(File::open(path)?))?;
        self.import_records(&records)
    }

    pub fn import_records(&mut self, records: &[ProfileRecord]) -> ProfileResult<Vec<ProfileId>> {
        let mut ids: BTreeMap<u64, ProfileId> = BTreeMap::new();
        let mut skipped = 0;
        for record in records {
            let id = match ids.get(&record.pid) {
                Some(id) => *id,
                None => {
                    let (Some(lon), Some(lat)) = (record.lon, record.lat) else {
                        return Err(ProfileError::InvalidInput(format!(
                            "profile {} has no position",
                            record.pid
                        )));
                    };
                    let geometry = Geometry::point(lon, lat, Crs::wgs84());
                    let id = self.store.register(&geometry, Some(&record.name))?;
                    ids.insert(record.pid, id);
                    id
                }
            };
            if self.time_series.acquisition(&record.source).is_none() {
                skipped += 1;
                continue;
            }
            let mut observation = Observation::new(record.date);
            observation.nodata = record.nodata;
            if !record.nodata {
                for (index, value) in record.bands.iter().enumerate() {
                    if let Some(value) = value {
                        observation.set_band(index + 1, *value, None);
                    }
                }
            }
            self.store
                .restore_observation(id, &record.source, observation, &self.time_series)?;
        }
        if skipped > 0 {
            log::warn!("Skipped {} rows of sources not in the time series", skipped);
        }
        let ids: Vec<ProfileId> = ids.into_values().collect();
        self.store.refresh_status(&ids, &self.time_series)?;
        Ok(ids)
    }
}
