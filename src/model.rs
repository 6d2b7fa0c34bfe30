use crate::store::{PropertyValue, StoredRow, WritePayload};
use chrono::{DateTime, DurationRound, NaiveDate, TimeDelta, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// One extracted record before normalization, keyed by field name.
pub type RawRow = BTreeMap<String, String>;

/// Tuple of normalized strings; two rows describe the same fact iff their
/// keys are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct IdentityKey(Vec<String>);

impl IdentityKey {
    pub fn composite<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// Case-folded, trimmed single-part key.
    pub fn name(raw: &str) -> Self {
        Self(vec![raw.trim().to_lowercase()])
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("|"))
    }
}

/// A typed row of one dataset.
pub trait CanonicalRow {
    fn identity_key(&self) -> IdentityKey;

    fn to_payload(&self) -> WritePayload;

    /// Rebuilds the identity key of a row already in the store.
    fn key_from_stored(row: &StoredRow) -> Option<IdentityKey>
    where
        Self: Sized;

    /// Short label for logs.
    fn describe(&self) -> String;
}

pub fn minute_key(ts: DateTime<Utc>) -> String {
    ts.duration_round(TimeDelta::minutes(1))
        .unwrap_or(ts)
        .format("%Y-%m-%dT%H:%M")
        .to_string()
}

pub fn second_key(ts: DateTime<Utc>) -> String {
    ts.duration_round(TimeDelta::seconds(1))
        .unwrap_or(ts)
        .format("%Y-%m-%dT%H:%M:%S")
        .to_string()
}

fn stored_timestamp(row: &StoredRow, column: &str) -> Option<DateTime<Utc>> {
    let raw = row.text(column)?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

fn stored_date(row: &StoredRow, column: &str) -> Option<NaiveDate> {
    let raw = row.text(column)?;
    NaiveDate::parse_from_str(raw.get(..10)?, "%Y-%m-%d").ok()
}

pub mod columns {
    pub const LIFT_NAME: &str = "Lift Name";
    pub const LIFT_BOTTOM: &str = "Bottom Elevation (m)";
    pub const LIFT_TOP: &str = "Top Elevation (m)";

    pub const HISTORY_TITLE: &str = "Date";
    pub const HISTORY_DATE: &str = "date";
    pub const HISTORY_SNOW: &str = "Snow (cm)";
    pub const HISTORY_SEASON_TOTAL: &str = "Season (cm)";
    pub const HISTORY_BASE: &str = "Base (cm)";
    pub const HISTORY_SEASON: &str = "Season";

    pub const FORECAST_TITLE: &str = "Elevation + Update Time";
    pub const FORECAST_REPORT_DATE: &str = "Report Date";
    pub const FORECAST_DATE: &str = "Forecast Date";
    pub const FORECAST_NEXT_UPDATE: &str = "Next Update";
    pub const FORECAST_PERIOD: &str = "Time of Day";
    pub const FORECAST_TYPE: &str = "Forecast Type";
    pub const FORECAST_SYNOPSIS: &str = "Synopsis";
    pub const FORECAST_SUMMARY: &str = "Daily Summary";
    pub const FORECAST_PRECIP_TYPE: &str = "Precipitation Type";
    pub const FORECAST_PRECIP_AMOUNT: &str = "Precipitation Amount";
    pub const FORECAST_HIGH: &str = "High";
    pub const FORECAST_LOW: &str = "Low";
    pub const FORECAST_FREEZING: &str = "Freezing Level (m)";
    pub const FORECAST_WIND_SPEED: &str = "Ridge Wind Speed";
    pub const FORECAST_WIND_DIRECTION: &str = "Ridge Wind Direction";
    pub const FORECAST_WIND_STRENGTH: &str = "Ridge Wind Strength";
    pub const FORECAST_ABOUT: &str = "About Forecast";
    pub const FORECAST_ELEVATION: &str = "Forecast Elevation";
    pub const FORECAST_LATEST: &str = "Latest Report?";

    pub const CONDITION_NAME: &str = "Name";
    pub const CONDITION_DATE: &str = "Date";
    pub const CONDITION_TEMPERATURE: &str = "Temperature";
    pub const CONDITION_WIND_CHILL: &str = "Wind Chill";
    pub const CONDITION_WIND_SPEED: &str = "Wind Speed";
    pub const CONDITION_WIND_DIRECTION: &str = "Wind Direction";
    pub const CONDITION_HUMIDITY: &str = "Humidity";
    pub const CONDITION_PRESSURE: &str = "Pressure";
    pub const CONDITION_SNOW_DEPTH: &str = "Snow Depth";
    pub const CONDITION_NEW_SNOW: &str = "New Snow";
    pub const CONDITION_PRECIPITATION: &str = "Precipitation";
    pub const CONDITION_LABEL: &str = "Condition";
    pub const CONDITION_STATION: &str = "Weather Station";
    pub const CONDITION_FILES: &str = "Files";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lift {
    pub name: String,
    pub bottom_m: i64,
    pub top_m: i64,
}

impl CanonicalRow for Lift {
    fn identity_key(&self) -> IdentityKey {
        IdentityKey::name(&self.name)
    }

    fn to_payload(&self) -> WritePayload {
        WritePayload::new()
            .with(columns::LIFT_NAME, PropertyValue::title(self.name.trim()))
            .with(columns::LIFT_BOTTOM, PropertyValue::int(self.bottom_m))
            .with(columns::LIFT_TOP, PropertyValue::int(self.top_m))
    }

    fn key_from_stored(row: &StoredRow) -> Option<IdentityKey> {
        row.text(columns::LIFT_NAME)
            .or_else(|| row.title())
            .map(IdentityKey::name)
    }

    fn describe(&self) -> String {
        self.name.trim().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnowfallRecord {
    pub date: NaiveDate,
    pub new_snow_cm: i64,
    pub season_total_cm: i64,
    pub base_cm: i64,
    pub season_page_id: Option<String>,
}

impl CanonicalRow for SnowfallRecord {
    fn identity_key(&self) -> IdentityKey {
        IdentityKey::composite([self.date.format("%Y-%m-%d").to_string()])
    }

    fn to_payload(&self) -> WritePayload {
        let iso = self.date.format("%Y-%m-%d").to_string();
        WritePayload::new()
            .with(columns::HISTORY_TITLE, PropertyValue::title(iso.clone()))
            .with(columns::HISTORY_DATE, PropertyValue::date(iso))
            .with(columns::HISTORY_SNOW, PropertyValue::int(self.new_snow_cm))
            .with(columns::HISTORY_SEASON_TOTAL, PropertyValue::int(self.season_total_cm))
            .with(columns::HISTORY_BASE, PropertyValue::int(self.base_cm))
            .with_opt(
                columns::HISTORY_SEASON,
                self.season_page_id
                    .clone()
                    .map(|id| PropertyValue::relation([id])),
            )
    }

    fn key_from_stored(row: &StoredRow) -> Option<IdentityKey> {
        let date = stored_date(row, columns::HISTORY_DATE)
            .or_else(|| stored_date(row, columns::HISTORY_TITLE))?;
        Some(IdentityKey::composite([date.format("%Y-%m-%d").to_string()]))
    }

    fn describe(&self) -> String {
        self.date.to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForecastEntry {
    pub elevation: String,
    pub report_time: DateTime<Utc>,
    pub forecast_date: NaiveDate,
    pub period: String,
    pub summary: String,
    pub high_c: Option<i64>,
    pub low_c: Option<i64>,
    pub freezing_level_m: Option<i64>,
    pub precip_type: String,
    pub precip_amount: i64,
    pub wind_speed_kmh: i64,
    pub wind_direction: String,
    pub wind_strength: Option<String>,
    pub synopsis: Option<String>,
    pub edition: Option<String>,
    pub next_update: Option<DateTime<Utc>>,
    pub about: Option<String>,
    pub elevation_page_id: Option<String>,
}

impl ForecastEntry {
    pub fn title(&self) -> String {
        format!("{} - {}", self.elevation, minute_key(self.report_time))
    }
}

impl CanonicalRow for ForecastEntry {
    fn identity_key(&self) -> IdentityKey {
        IdentityKey::composite([
            minute_key(self.report_time),
            self.forecast_date.format("%Y-%m-%d").to_string(),
            self.elevation.clone(),
            self.period.clone(),
        ])
    }

    fn to_payload(&self) -> WritePayload {
        let text = |value: &Option<String>| value.clone().map(PropertyValue::text);
        WritePayload::new()
            .with(columns::FORECAST_TITLE, PropertyValue::title(self.title()))
            .with(
                columns::FORECAST_REPORT_DATE,
                PropertyValue::date(self.report_time.to_rfc3339()),
            )
            .with(
                columns::FORECAST_DATE,
                PropertyValue::date(self.forecast_date.format("%Y-%m-%d").to_string()),
            )
            .with_opt(
                columns::FORECAST_NEXT_UPDATE,
                self.next_update.map(|ts| PropertyValue::date(ts.to_rfc3339())),
            )
            .with(columns::FORECAST_PERIOD, PropertyValue::select(self.period.clone()))
            .with_opt(columns::FORECAST_TYPE, text(&self.edition))
            .with_opt(columns::FORECAST_SYNOPSIS, text(&self.synopsis))
            .with(columns::FORECAST_SUMMARY, PropertyValue::text(self.summary.clone()))
            .with(
                columns::FORECAST_PRECIP_TYPE,
                PropertyValue::select(self.precip_type.clone()),
            )
            .with(columns::FORECAST_PRECIP_AMOUNT, PropertyValue::int(self.precip_amount))
            .with_opt(columns::FORECAST_HIGH, self.high_c.map(PropertyValue::int))
            .with_opt(columns::FORECAST_LOW, self.low_c.map(PropertyValue::int))
            .with_opt(
                columns::FORECAST_FREEZING,
                self.freezing_level_m.map(PropertyValue::int),
            )
            .with(columns::FORECAST_WIND_SPEED, PropertyValue::int(self.wind_speed_kmh))
            .with(
                columns::FORECAST_WIND_DIRECTION,
                PropertyValue::text(self.wind_direction.clone()),
            )
            .with_opt(columns::FORECAST_WIND_STRENGTH, text(&self.wind_strength))
            .with_opt(columns::FORECAST_ABOUT, text(&self.about))
            .with_opt(
                columns::FORECAST_ELEVATION,
                self.elevation_page_id
                    .clone()
                    .map(|id| PropertyValue::relation([id])),
            )
    }

    fn key_from_stored(row: &StoredRow) -> Option<IdentityKey> {
        let title = row.text(columns::FORECAST_TITLE).or_else(|| row.title())?;
        let (elevation, title_time) = title.split_once(" - ")?;
        let report = match stored_timestamp(row, columns::FORECAST_REPORT_DATE) {
            Some(ts) => minute_key(ts),
            None => title_time.trim().to_string(),
        };
        let date = stored_date(row, columns::FORECAST_DATE)?;
        let period = row.text(columns::FORECAST_PERIOD)?;
        Some(IdentityKey::composite([
            report,
            date.format("%Y-%m-%d").to_string(),
            elevation.trim().to_string(),
            period.to_string(),
        ]))
    }

    fn describe(&self) -> String {
        format!("{} {} {}", self.elevation, self.forecast_date, self.period)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StationReading {
    pub station: String,
    pub time: DateTime<Utc>,
    pub temperature_c: Option<f64>,
    pub wind_chill_c: Option<f64>,
    pub wind_speed_kmh: Option<f64>,
    pub wind_direction: Option<String>,
    pub humidity_pct: Option<f64>,
    pub pressure_mb: Option<f64>,
    pub snow_depth_cm: Option<f64>,
    pub new_snow_cm: Option<f64>,
    pub precipitation_mm: Option<f64>,
    pub condition: String,
    pub webcams: Vec<String>,
    pub station_page_id: Option<String>,
}

impl StationReading {
    pub fn title(&self) -> String {
        format!("{} - {}", self.station, second_key(self.time))
    }
}

impl CanonicalRow for StationReading {
    fn identity_key(&self) -> IdentityKey {
        IdentityKey::composite([self.station.clone(), second_key(self.time)])
    }

    fn to_payload(&self) -> WritePayload {
        let number = |value: Option<f64>| value.map(|v| PropertyValue::float(Some(v)));
        let files = (!self.webcams.is_empty()).then(|| PropertyValue::Files(self.webcams.clone()));
        WritePayload::new()
            .with(columns::CONDITION_NAME, PropertyValue::title(self.title()))
            .with(columns::CONDITION_DATE, PropertyValue::date(self.time.to_rfc3339()))
            .with_opt(columns::CONDITION_TEMPERATURE, number(self.temperature_c))
            .with_opt(columns::CONDITION_WIND_CHILL, number(self.wind_chill_c))
            .with_opt(columns::CONDITION_WIND_SPEED, number(self.wind_speed_kmh))
            .with_opt(
                columns::CONDITION_WIND_DIRECTION,
                self.wind_direction.clone().map(PropertyValue::text),
            )
            .with_opt(columns::CONDITION_HUMIDITY, number(self.humidity_pct))
            .with_opt(columns::CONDITION_PRESSURE, number(self.pressure_mb))
            .with_opt(columns::CONDITION_SNOW_DEPTH, number(self.snow_depth_cm))
            .with_opt(columns::CONDITION_NEW_SNOW, number(self.new_snow_cm))
            .with_opt(columns::CONDITION_PRECIPITATION, number(self.precipitation_mm))
            .with(columns::CONDITION_LABEL, PropertyValue::select(self.condition.clone()))
            .with_opt(
                columns::CONDITION_STATION,
                self.station_page_id
                    .clone()
                    .map(|id| PropertyValue::relation([id])),
            )
            .with_opt(columns::CONDITION_FILES, files)
    }

    fn key_from_stored(row: &StoredRow) -> Option<IdentityKey> {
        let title = row.text(columns::CONDITION_NAME).or_else(|| row.title())?;
        let (station, title_time) = title.rsplit_once(" - ")?;
        let time = match stored_timestamp(row, columns::CONDITION_DATE) {
            Some(ts) => second_key(ts),
            None => title_time.trim().to_string(),
        };
        Some(IdentityKey::composite([station.trim().to_string(), time]))
    }

    fn describe(&self) -> String {
        self.title()
    }
}

/// Read-only description of a weather station page.
#[derive(Debug, Clone)]
pub struct StationMeta {
    pub name: String,
    pub url: String,
    pub webcam_indices: Vec<usize>,
    pub system_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextUpdate {
    /// Minutes from the moment the page was read.
    Countdown(i64),
    At(DateTime<Utc>),
}

impl NextUpdate {
    pub fn minutes_until(&self, now: DateTime<Utc>) -> i64 {
        match self {
            NextUpdate::Countdown(minutes) => *minutes,
            NextUpdate::At(ts) => (*ts - now).num_minutes(),
        }
    }

    pub fn timestamp(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            NextUpdate::Countdown(minutes) => now + TimeDelta::minutes(*minutes),
            NextUpdate::At(ts) => *ts,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageMeta {
    pub report_time: Option<DateTime<Utc>>,
    pub next_update: Option<NextUpdate>,
    pub synopsis: Option<String>,
    pub edition: Option<String>,
    pub about: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extracted {
    pub rows: Vec<RawRow>,
    pub meta: PageMeta,
}

impl Extracted {
    pub fn empty() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobReport {
    pub job: String,
    pub scraped: usize,
    pub existing: usize,
    pub new: usize,
    pub inserted: usize,
    pub failed: usize,
    pub next_update_minutes: Option<i64>,
}

impl JobReport {
    pub fn named(job: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub started_at: DateTime<Utc>,
    pub jobs: Vec<JobReport>,
    pub failed_jobs: Vec<String>,
}

impl PassReport {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            jobs: Vec::new(),
            failed_jobs: Vec::new(),
        }
    }

    pub fn countdowns(&self) -> Vec<i64> {
        self.jobs
            .iter()
            .filter_map(|job| job.next_update_minutes)
            .collect()
    }

    pub fn total_inserted(&self) -> usize {
        self.jobs.iter().map(|job| job.inserted).sum()
    }
}
