use crate::core::expression::Expression;
use crate::core::store::{Observation, ProfileStore};
use crate::core::timeseries::{SensorId, TimeSeries};
use crate::types::{parse_band_key, ProfileError, ProfileId, ProfileResult};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

/// X axis of a plotted series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DateAxis {
    /// Decimal year
    Date,
    /// Day of year
    Doy,
}

/// Plottable series; NaN marks dates without a value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileSeries {
    pub xs: Vec<f64>,
    pub ys: Vec<f64>,
}

impl ProfileSeries {
    pub fn len(&self) -> usize {
        self.xs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.xs.is_empty()
    }
}

fn days_in_year(year: i32) -> u32 {
    if NaiveDate::from_ymd_opt(year, 2, 29).is_some() {
        366
    } else {
        365
    }
}

/// `year + (doy - 1) / days_in_year`, kept strictly below `year + 1`.
pub fn decimal_year(date: NaiveDate) -> f64 {
    let year = date.year();
    let value = year as f64 + (date.ordinal() - 1) as f64 / days_in_year(year) as f64;
    let upper = (year + 1) as f64;
    if value < upper {
        value
    } else {
        upper - upper.abs() * f64::EPSILON
    }
}

/// Resolve a field of the synthetic per-date tuple
fn field_value(name: &str, observation: Option<&Observation>, date: NaiveDate, band_count: usize) -> Option<f64> {
    match name {
        "doy" => Some(date.ordinal() as f64),
        "date" => Some(decimal_year(date)),
        _ => {
            let number = parse_band_key(name).or_else(|| {
                name.strip_prefix("std")
                    .filter(|d| !d.is_empty() && d.bytes().all(|b| b.is_ascii_digit()))
                    .and_then(|d| d.parse::<usize>().ok())
                    .filter(|n| *n >= 1)
            })?;
            if number > band_count {
                return None;
            }
            let observation = observation.filter(|o| !o.nodata)?;
            observation.get(name)
        }
    }
}

/// Projects stored profile data to (x, y) series for one sensor
pub struct ExpressionEvaluator<'a> {
    store: &'a ProfileStore,
    time_series: &'a TimeSeries,
}

impl<'a> ExpressionEvaluator<'a> {
    pub fn new(store: &'a ProfileStore, time_series: &'a TimeSeries) -> Self {
        Self { store, time_series }
    }

    pub fn evaluate(
        &self,
        profile: ProfileId,
        sensor: SensorId,
        expression: &str,
        axis: DateAxis,
    ) -> ProfileResult<ProfileSeries> {
        let expression = Expression::parse(expression)?;
        self.evaluate_parsed(profile, sensor, &expression, axis)
    }

    pub fn evaluate_parsed(
        &self,
        profile: ProfileId,
        sensor: SensorId,
        expression: &Expression,
        axis: DateAxis,
    ) -> ProfileResult<ProfileSeries> {
        if self.store.profile(profile).is_none() {
            return Err(ProfileError::UnknownProfile(profile));
        }
        let band_count = self
            .time_series
            .sensor(sensor)
            .ok_or_else(|| ProfileError::UnknownSensor(sensor.to_string()))?
            .band_count();

        let mut series = ProfileSeries::default();
        for acquisition in self.time_series.acquisitions_of(sensor) {
            let observation = self.store.observation(profile, &acquisition.uri);
            let date = acquisition.date;
            let y = expression
                .evaluate(&|name: &str| field_value(name, observation, date, band_count))
                .unwrap_or(f64::NAN);
            let x = match axis {
                DateAxis::Date => decimal_year(date),
                DateAxis::Doy => date.ordinal() as f64,
            };
            series.xs.push(x);
            series.ys.push(y);
        }
        debug_assert_eq!(series.xs.len(), series.ys.len());
        Ok(series)
    }
}
