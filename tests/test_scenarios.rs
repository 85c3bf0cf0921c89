use approx::assert_relative_eq;
use chrono::NaiveDate;
use eotsv_profiles::core::extraction::{run_task, SlotResult};
use eotsv_profiles::core::planner::ExtractionTask;
use eotsv_profiles::core::store::ProfileStore;
use eotsv_profiles::core::timeseries::{SensorId, TimeSeries};
use eotsv_profiles::io::raster::RasterInfo;
use eotsv_profiles::{
    BandPolicy, BandSelection, BuiltinTransformer, CoreConfig, Crs, DateAxis, ExtractionRequest, GeoTransform,
    Geometry, MemoryLayer, MemoryRaster, MemoryRasterCatalog, ProfileSession, RasterOpener, RequestId, WorkerEvent,
};
use ndarray::Array3;
use std::sync::Arc;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn utm() -> Crs {
    Crs::epsg(32633)
}

fn config() -> CoreConfig {
    CoreConfig {
        default_crs: utm(),
        ..CoreConfig::default()
    }
}

fn date(year: i32, ordinal: u32) -> NaiveDate {
    NaiveDate::from_yo_opt(year, ordinal).expect("valid ordinal date")
}

fn session(catalog: &Arc<MemoryRasterCatalog>) -> ProfileSession {
    let opener: Arc<dyn RasterOpener> = catalog.clone();
    ProfileSession::in_memory(config(), opener, Arc::new(BuiltinTransformer)).expect("Failed to create session")
}

fn three_by_three() -> Arc<MemoryRasterCatalog> {
    let catalog = Arc::new(MemoryRasterCatalog::new());
    catalog.insert(MemoryRaster::filled(
        "mem://s1.tif",
        &[10.0, 20.0],
        (3, 3),
        GeoTransform::north_up(500000.0, 4000030.0, 10.0, 10.0),
        utm(),
    ));
    catalog
}

#[test]
fn test_single_point_single_image() {
    init_logging();
    let catalog = three_by_three();
    let mut session = session(&catalog);
    session.add_source("mem://s1.tif", date(2020, 1)).expect("Failed to add source");

    let id = session
        .register(&Geometry::point(500015.0, 4000015.0, utm()), Some("center"))
        .expect("Failed to register profile");
    let request = session
        .submit(&ExtractionRequest::new(vec![id], BandPolicy::all()))
        .expect("Failed to submit");
    let events = session.wait_idle().expect("Worker stopped");

    let results: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            WorkerEvent::Result(r) => Some(r),
            _ => None,
        })
        .collect();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].request, request);
    match &results[0].slots[0] {
        SlotResult::Values { mean, std, .. } => {
            assert_relative_eq!(mean[0], 10.0);
            assert_relative_eq!(mean[1], 20.0);
            assert_relative_eq!(std[0], 0.0);
            assert_relative_eq!(std[1], 0.0);
        }
        other => panic!("unexpected slot {:?}", other),
    }

    let status = session.status(id).expect("profile status");
    assert_eq!((status.loaded, status.nodata, status.total), (2, 0, 2));
    assert!(status.is_complete());
}

#[test]
fn test_point_out_of_raster() {
    init_logging();
    let catalog = three_by_three();
    let mut session = session(&catalog);
    session.add_source("mem://s1.tif", date(2020, 1)).expect("Failed to add source");

    // pixel (-1, -1) of a 10 m grid
    let id = session
        .register(&Geometry::point(499995.0, 4000035.0, utm()), None)
        .expect("Failed to register profile");
    session
        .submit(&ExtractionRequest::new(vec![id], BandPolicy::all()))
        .expect("Failed to submit");
    let events = session.wait_idle().expect("Worker stopped");

    let slot = events.iter().find_map(|e| match e {
        WorkerEvent::Result(r) => r.slots.first().cloned(),
        _ => None,
    });
    assert_eq!(slot, Some(SlotResult::OutOfImage));
    let status = session.status(id).expect("profile status");
    assert_eq!((status.loaded, status.nodata, status.total), (0, 2, 2));

    // nothing left to plan for a nodata acquisition
    session
        .submit(&ExtractionRequest::new(vec![id], BandPolicy::all()))
        .expect("Failed to submit");
    let events = session.wait_idle().expect("Worker stopped");
    assert!(!events.iter().any(|e| matches!(e, WorkerEvent::Result(_))));
}

#[test]
fn test_rectangle_overlapping_edge() {
    init_logging();
    let data = Array3::from_shape_fn((1, 4, 4), |(_, row, col)| (row * 4 + col) as f64);
    let catalog = MemoryRasterCatalog::new();
    catalog.insert(MemoryRaster::new(
        "mem://edge.tif",
        data,
        GeoTransform::north_up(0.0, 4.0, 1.0, 1.0),
        utm(),
    ));

    // pixels (2..5, 2..5)
    let task = ExtractionTask {
        uri: "mem://edge.tif".to_string(),
        date: date(2021, 100),
        geometries: vec![Geometry::rectangle(2.0, -1.0, 5.0, 2.0, utm())],
        bands: vec![0],
        profile_ids: vec![eotsv_profiles::ProfileId(1)],
    };
    let result = run_task(&task, RequestId(1), &catalog, &BuiltinTransformer);
    assert!(!result.is_failed());
    match &result.slots[0] {
        SlotResult::Values {
            mean,
            std,
            window,
            valid_samples,
        } => {
            assert_eq!((window.x_off, window.y_off, window.size_x, window.size_y), (2, 2, 2, 2));
            assert_eq!(*valid_samples, 4);
            // samples 10, 11, 14, 15
            assert_relative_eq!(mean[0], 12.5);
            assert_relative_eq!(std[0], 4.25f64.sqrt());
        }
        other => panic!("unexpected slot {:?}", other),
    }
}

#[test]
fn test_no_data_filtering() {
    init_logging();
    let data = Array3::from_shape_vec((1, 1, 2), vec![0.0, 7.0]).expect("shape");
    let raster = MemoryRaster::new("mem://nd.tif", data, GeoTransform::north_up(0.0, 1.0, 1.0, 1.0), utm())
        .with_no_data(0, 0.0);
    let catalog = MemoryRasterCatalog::new();
    catalog.insert(raster);

    let mut ts = TimeSeries::new();
    ts.add_source(&catalog, "mem://nd.tif", date(2021, 5)).expect("Failed to add source");
    let mut store = ProfileStore::new(config(), Box::new(MemoryLayer::new(utm())), Arc::new(BuiltinTransformer))
        .expect("Failed to create store");
    let id = store
        .register(&Geometry::point(0.5, 0.5, utm()), None)
        .expect("Failed to register profile");

    let task = ExtractionTask {
        uri: "mem://nd.tif".to_string(),
        date: date(2021, 5),
        geometries: vec![Geometry::rectangle(0.0, 0.0, 2.0, 1.0, utm())],
        bands: vec![0],
        profile_ids: vec![id],
    };
    let result = run_task(&task, RequestId(1), &catalog, &BuiltinTransformer);
    match &result.slots[0] {
        SlotResult::Values { mean, std, valid_samples, .. } => {
            assert_relative_eq!(mean[0], 7.0);
            assert_relative_eq!(std[0], 0.0);
            assert_eq!(*valid_samples, 1);
        }
        other => panic!("unexpected slot {:?}", other),
    }

    let summary = store.ingest(&result, &ts);
    assert_eq!(summary.updated, vec![id]);
    let status = store.status(id, &ts).expect("profile status");
    assert_eq!((status.loaded, status.nodata, status.total), (1, 0, 1));
}

#[test]
fn test_two_sensors_expression() {
    init_logging();
    let gt = GeoTransform::north_up(0.0, 2.0, 1.0, 1.0);
    let catalog = Arc::new(MemoryRasterCatalog::new());
    catalog.insert(MemoryRaster::filled("mem://a1.tif", &[0.05, 0.1, 0.2, 0.5], (2, 2), gt, utm()));
    catalog.insert(MemoryRaster::filled(
        "mem://a2.tif",
        &[0.05, 0.1, 0.3, 0.4, 0.6, 0.7],
        (2, 2),
        gt,
        utm(),
    ));
    let mut session = session(&catalog);
    let s1 = session.add_source("mem://a1.tif", date(2020, 1)).expect("Failed to add A1");
    let s2 = session.add_source("mem://a2.tif", date(2020, 10)).expect("Failed to add A2");
    assert_ne!(s1, s2);
    assert_eq!(s1, SensorId::new(4, 1.0, 1.0));

    let id = session
        .register(&Geometry::point(1.0, 1.0, utm()), None)
        .expect("Failed to register profile");
    session
        .submit(&ExtractionRequest::new(vec![id], BandPolicy::all()))
        .expect("Failed to submit");
    session.wait_idle().expect("Worker stopped");

    let ndvi = "(b4-b3)/(b4+b3)";
    let series = session.profile_data(id, s1, ndvi, DateAxis::Doy).expect("S1 series");
    assert_eq!(series.xs, vec![1.0]);
    assert_relative_eq!(series.ys[0], (0.5 - 0.2) / 0.7, epsilon = 1e-12);

    let series = session.profile_data(id, s2, ndvi, DateAxis::Doy).expect("S2 series");
    assert_eq!(series.xs, vec![10.0]);
    assert_relative_eq!(series.ys[0], (0.4 - 0.3) / 0.7, epsilon = 1e-12);

    // b6 exists only for the second sensor
    let series = session.profile_data(id, s1, "b6", DateAxis::Date).expect("S1 series");
    assert_eq!(series.len(), 1);
    assert!(series.ys[0].is_nan());
    assert_eq!(series.xs, vec![2020.0]);

    // malformed input is an error, not a crash
    let deep = format!("{}b1{}", "(".repeat(100_000), ")".repeat(100_000));
    let err = session.profile_data(id, s1, &deep, DateAxis::Doy);
    assert!(matches!(err, Err(eotsv_profiles::ProfileError::Expression(_))));
}

#[test]
fn test_band_subset_then_complete() {
    init_logging();
    let catalog = three_by_three();
    let mut session = session(&catalog);
    let sensor = session.add_source("mem://s1.tif", date(2020, 1)).expect("Failed to add source");
    let id = session
        .register(&Geometry::point(500015.0, 4000015.0, utm()), None)
        .expect("Failed to register profile");

    let policy = BandPolicy::all().with_sensor(sensor, BandSelection::Bands(vec![1]));
    session
        .submit(&ExtractionRequest::new(vec![id], policy))
        .expect("Failed to submit");
    session.wait_idle().expect("Worker stopped");
    let status = session.status(id).expect("profile status");
    assert_eq!((status.loaded, status.nodata, status.total), (1, 0, 2));
    let observation = session.store().observation(id, "mem://s1.tif").expect("observation");
    assert_eq!(observation.band(2), Some(20.0));
    assert_eq!(observation.band(1), None);

    // the follow-up only asks for the missing band
    session
        .submit(&ExtractionRequest::new(vec![id], BandPolicy::all()))
        .expect("Failed to submit");
    let events = session.wait_idle().expect("Worker stopped");
    let bands: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            WorkerEvent::Result(r) => Some(r.task.bands.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(bands, vec![vec![0]]);
    assert!(session.status(id).expect("profile status").is_complete());
}

#[test]
fn test_unknown_sensor_rejected() {
    init_logging();
    let catalog = three_by_three();
    let mut session = session(&catalog);
    session.add_source("mem://s1.tif", date(2020, 1)).expect("Failed to add source");
    let policy = BandPolicy::all().with_sensor(SensorId::new(9, 30.0, 30.0), BandSelection::All);
    let err = session.submit(&ExtractionRequest::new(vec![], policy));
    assert!(matches!(err, Err(eotsv_profiles::ProfileError::UnknownSensor(_))));
    assert!(session.is_idle());
}

#[test]
fn test_failed_raster_counts_as_nodata() {
    init_logging();
    let catalog = three_by_three();
    let mut session = session(&catalog);
    session.add_source("mem://s1.tif", date(2020, 1)).expect("Failed to add source");

    let info = RasterInfo::read(catalog.as_ref(), "mem://s1.tif").expect("raster info");
    let gone = RasterInfo {
        uri: "mem://gone.tif".to_string(),
        ..info
    };
    session
        .time_series_mut()
        .add_raster(&gone, date(2020, 2))
        .expect("Failed to add raster");

    let id = session
        .register(&Geometry::point(500015.0, 4000015.0, utm()), None)
        .expect("Failed to register profile");
    session
        .submit(&ExtractionRequest::new(vec![id], BandPolicy::all()))
        .expect("Failed to submit");
    let events = session.wait_idle().expect("Worker stopped");

    let failed = events
        .iter()
        .filter(|e| matches!(e, WorkerEvent::Result(r) if r.is_failed()))
        .count();
    assert_eq!(failed, 1);
    assert!(matches!(events.last(), Some(WorkerEvent::Finished(_))));
    let status = session.status(id).expect("profile status");
    assert_eq!((status.loaded, status.nodata, status.total), (2, 2, 4));
}
