//! CSV and GeoJSON export of profile data, and CSV import.
//!
//! CSV layout: `pid, name, date, doy, source, lon, lat, nodata, b1..bK`
//! with one row per profile and observed acquisition. `K` is the largest
//! band count of any sensor; unused band columns stay empty.

use crate::core::store::{ProfileStore, TemporalProfile};
use crate::core::timeseries::TimeSeries;
use crate::io::crs::CrsTransformer;
use crate::types::{band_key, parse_band_key, Crs, ProfileError, ProfileResult};
use chrono::{Datelike, NaiveDate};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use serde_json::json;
use std::io::{Read, Write};

/// Date format of the `date` column
pub const DATE_FORMAT: &str = "%Y-%m-%d";

const FIXED_COLUMNS: [&str; 8] = ["pid", "name", "date", "doy", "source", "lon", "lat", "nodata"];

/// One CSV row read back from an export
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileRecord {
    pub pid: u64,
    pub name: String,
    pub date: NaiveDate,
    pub doy: u32,
    pub source: String,
    pub lon: Option<f64>,
    pub lat: Option<f64>,
    pub nodata: bool,
    /// Band means by 0-based index
    pub bands: Vec<Option<f64>>,
}

fn wgs84_position(profile: &TemporalProfile, transformer: &dyn CrsTransformer) -> Option<(f64, f64)> {
    let (x, y) = profile.xy();
    match transformer.transform_point(&profile.geometry.crs, &Crs::wgs84(), x, y) {
        Ok(p) => Some(p),
        Err(e) => {
            log::warn!("Profile {} has no WGS84 position: {}", profile.id, e);
            None
        }
    }
}

fn opt_to_string(v: Option<f64>) -> String {
    v.map(|v| v.to_string()).unwrap_or_default()
}

/// Write every profile observation as CSV; returns the number of rows.
pub fn write_csv<W: Write>(
    writer: W,
    store: &ProfileStore,
    time_series: &TimeSeries,
    transformer: &dyn CrsTransformer,
) -> ProfileResult<usize> {
    let max_bands = time_series.max_band_count();
    let mut csv = WriterBuilder::new().has_headers(false).from_writer(writer);

    let mut header: Vec<String> = FIXED_COLUMNS.iter().map(|c| c.to_string()).collect();
    header.extend((1..=max_bands).map(band_key));
    csv.write_record(&header)?;

    let mut rows = 0;
    for profile in store.profiles() {
        let position = wgs84_position(profile, transformer);
        for acquisition in time_series.acquisitions() {
            let Some(observation) = store.observation(profile.id, &acquisition.uri) else {
                continue;
            };
            let mut record = vec![
                profile.id.0.to_string(),
                profile.name.clone(),
                acquisition.date.format(DATE_FORMAT).to_string(),
                acquisition.date.ordinal().to_string(),
                acquisition.uri.clone(),
                opt_to_string(position.map(|p| p.0)),
                opt_to_string(position.map(|p| p.1)),
                if observation.nodata { "1" } else { "0" }.to_string(),
            ];
            record.extend((1..=max_bands).map(|i| opt_to_string(observation.band(i))));
            csv.write_record(&record)?;
            rows += 1;
        }
    }
    csv.flush()?;
    log::info!("Exported {} profile rows to CSV", rows);
    Ok(rows)
}

fn parse_field<T: std::str::FromStr>(record: &StringRecord, index: usize, column: &str) -> ProfileResult<T> {
    let raw = record.get(index).unwrap_or("").trim();
    raw.parse()
        .map_err(|_| ProfileError::InvalidInput(format!("bad {} value '{}'", column, raw)))
}

fn parse_optional(record: &StringRecord, index: usize, column: &str) -> ProfileResult<Option<f64>> {
    match record.get(index).map(str::trim) {
        None | Some("") => Ok(None),
        Some(_) => parse_field(record, index, column).map(Some),
    }
}

/// Read rows written by [`write_csv`].
pub fn read_csv<R: Read>(reader: R) -> ProfileResult<Vec<ProfileRecord>> {
    let mut csv = ReaderBuilder::new().has_headers(true).from_reader(reader);
    let headers = csv.headers()?.clone();
    let column = |name: &str| -> ProfileResult<usize> {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .ok_or_else(|| ProfileError::InvalidInput(format!("CSV is missing column '{}'", name)))
    };
    let [pid, name, date, doy, source, lon, lat, nodata] = [
        column("pid")?,
        column("name")?,
        column("date")?,
        column("doy")?,
        column("source")?,
        column("lon")?,
        column("lat")?,
        column("nodata")?,
    ];
    let band_columns: Vec<(usize, usize)> = headers
        .iter()
        .enumerate()
        .filter_map(|(i, h)| parse_band_key(h.trim()).map(|n| (i, n)))
        .collect();
    let max_band = band_columns.iter().map(|(_, n)| *n).max().unwrap_or(0);

    let mut records = Vec::new();
    for row in csv.records() {
        let row = row?;
        let date_text = row.get(date).unwrap_or("").trim();
        let parsed_date = NaiveDate::parse_from_str(date_text, DATE_FORMAT)
            .map_err(|e| ProfileError::InvalidInput(format!("bad date '{}': {}", date_text, e)))?;
        let mut bands = vec![None; max_band];
        for (index, number) in &band_columns {
            bands[number - 1] = parse_optional(&row, *index, &band_key(*number))?;
        }
        let nodata_text = row.get(nodata).unwrap_or("").trim();
        records.push(ProfileRecord {
            pid: parse_field(&row, pid, "pid")?,
            name: row.get(name).unwrap_or("").to_string(),
            date: parsed_date,
            doy: parse_field(&row, doy, "doy")?,
            source: row.get(source).unwrap_or("").to_string(),
            lon: parse_optional(&row, lon, "lon")?,
            lat: parse_optional(&row, lat, "lat")?,
            nodata: matches!(nodata_text, "1" | "true" | "True"),
            bands,
        });
    }
    Ok(records)
}

/// Write profiles as a GeoJSON FeatureCollection of WGS84 points.
pub fn write_geojson<W: Write>(
    writer: W,
    store: &ProfileStore,
    time_series: &TimeSeries,
    transformer: &dyn CrsTransformer,
) -> ProfileResult<usize> {
    let mut features = Vec::new();
    for profile in store.profiles() {
        let Some((lon, lat)) = wgs84_position(profile, transformer) else {
            continue;
        };
        let status = store.status(profile.id, time_series).unwrap_or_default();
        features.push(json!({
            "type": "Feature",
            "geometry": { "type": "Point", "coordinates": [lon, lat] },
            "properties": {
                "id": profile.id.0,
                "name": profile.name,
                "loaded": status.loaded,
                "nodata": status.nodata,
                "total": status.total,
            }
        }));
    }
    let count = features.len();
    let collection = json!({ "type": "FeatureCollection", "features": features });
    serde_json::to_writer_pretty(writer, &collection)?;
    Ok(count)
}
