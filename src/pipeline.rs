use crate::classify::{GeminiClassifier, SkyClassifier, SkyLabel};
use crate::config::{
    AppConfig, ForecastLayout, ForecastSource, LoadedConfig, PageJob, Secrets, StationConfig,
};
use crate::dedup::{diff, existing_keys, forecast_filter, history_filter, station_filter};
use crate::fetch::{PageFetcher, build_fetcher};
use crate::forecast::{
    extract_card_forecast, extract_table_forecast, forecasts_from_cards, forecasts_from_table,
};
use crate::model::{CanonicalRow, JobReport, PassReport, StationMeta, columns};
use crate::parser::{
    extract_history, extract_lifts, extract_station, extract_webcams, history_from_rows,
    lifts_from_rows, station_readings,
};
use crate::retry::RetryPolicy;
use crate::store::{
    ColumnType, Filter, MemoryStore, NotionStore, RowStore, StoredRow, find_row_id, query_all,
};
use crate::upsert::Upserter;
use anyhow::{Context as _, Result, anyhow};
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum JobKind {
    Lifts,
    History,
    Forecasts,
    Conditions,
}

/// Everything a pass needs, borrowed for its duration.
pub struct Context<'a> {
    pub config: &'a LoadedConfig,
    pub fetcher: &'a dyn PageFetcher,
    pub store: &'a dyn RowStore,
    pub classifier: Option<&'a dyn SkyClassifier>,
    pub retry: RetryPolicy,
    pub now: DateTime<Utc>,
}

impl Context<'_> {
    fn app(&self) -> &AppConfig {
        &self.config.config
    }

    fn database(&self, name: &str) -> Result<&str> {
        self.app()
            .databases
            .by_name(name)
            .ok_or_else(|| anyhow!("databases.{name} is not configured"))
    }
}

pub struct Services {
    pub fetcher: Box<dyn PageFetcher>,
    pub store: Box<dyn RowStore>,
    pub classifier: Option<Box<dyn SkyClassifier>>,
}

impl Services {
    pub fn context<'a>(&'a self, config: &'a LoadedConfig, now: DateTime<Utc>) -> Context<'a> {
        Context {
            config,
            fetcher: self.fetcher.as_ref(),
            store: self.store.as_ref(),
            classifier: self.classifier.as_deref(),
            retry: RetryPolicy::from(&config.config.retry),
            now,
        }
    }
}

pub fn build_store(config: &AppConfig, secrets: &Secrets) -> Result<Box<dyn RowStore>> {
    let token = secrets.store_token.as_deref().with_context(|| {
        format!(
            "store token missing; set the {} environment variable",
            config.store.token_env
        )
    })?;
    Ok(Box::new(NotionStore::new(
        &config.store.endpoint,
        &config.store.api_version,
        token,
        Duration::from_secs(config.store.timeout_secs),
        config.store.page_size,
    )?))
}

pub fn build_classifier(
    config: &AppConfig,
    secrets: &Secrets,
) -> Result<Option<Box<dyn SkyClassifier>>> {
    if !config.classifier.enabled {
        return Ok(None);
    }
    let Some(key) = secrets.classifier_key.as_deref() else {
        warn!(
            env = %config.classifier.api_key_env,
            "classifier enabled but no api key set; falling back to sensor rules"
        );
        return Ok(None);
    };
    Ok(Some(Box::new(GeminiClassifier::new(
        &config.classifier.endpoint,
        &config.classifier.model,
        key,
        Duration::from_secs(config.classifier.timeout_secs),
    )?)))
}

pub fn build_services(
    loaded: &LoadedConfig,
    secrets: &Secrets,
    store: Option<Box<dyn RowStore>>,
) -> Result<Services> {
    let store = match store {
        Some(store) => store,
        None => build_store(&loaded.config, secrets)?,
    };
    Ok(Services {
        fetcher: build_fetcher(loaded, secrets)?,
        store,
        classifier: build_classifier(&loaded.config, secrets)?,
    })
}

/// Registers every configured database so the in-memory store accepts
/// queries against it.
pub fn prepare_memory_store(store: &MemoryStore, config: &AppConfig) {
    for name in DATABASE_NAMES {
        if let Some(id) = config.databases.by_name(name) {
            store.create_database(id, &[]);
        }
    }
}

const DATABASE_NAMES: [&str; 6] = [
    "lifts",
    "snowfall_history",
    "forecast_elevations",
    "forecasts",
    "weather_stations",
    "ski_conditions",
];

/// Columns each destination database must expose, with their types.
pub fn expected_columns(name: &str) -> Vec<(&'static str, ColumnType)> {
    match name {
        "lifts" => vec![
            (columns::LIFT_NAME, ColumnType::Title),
            (columns::LIFT_BOTTOM, ColumnType::Number),
            (columns::LIFT_TOP, ColumnType::Number),
        ],
        "snowfall_history" => vec![
            (columns::HISTORY_TITLE, ColumnType::Title),
            (columns::HISTORY_DATE, ColumnType::Date),
            (columns::HISTORY_SNOW, ColumnType::Number),
            (columns::HISTORY_SEASON_TOTAL, ColumnType::Number),
            (columns::HISTORY_BASE, ColumnType::Number),
        ],
        "forecasts" => vec![
            (columns::FORECAST_TITLE, ColumnType::Title),
            (columns::FORECAST_REPORT_DATE, ColumnType::Date),
            (columns::FORECAST_DATE, ColumnType::Date),
            (columns::FORECAST_PERIOD, ColumnType::Select),
            (columns::FORECAST_TYPE, ColumnType::RichText),
            (columns::FORECAST_SUMMARY, ColumnType::RichText),
            (columns::FORECAST_PRECIP_TYPE, ColumnType::Select),
            (columns::FORECAST_PRECIP_AMOUNT, ColumnType::Number),
            (columns::FORECAST_LATEST, ColumnType::Formula),
        ],
        "ski_conditions" => vec![
            (columns::CONDITION_NAME, ColumnType::Title),
            (columns::CONDITION_DATE, ColumnType::Date),
            (columns::CONDITION_LABEL, ColumnType::Select),
        ],
        _ => Vec::new(),
    }
}

/// Checks remote schemas against the columns and types the jobs write.
pub fn check_remote_schemas(store: &dyn RowStore, config: &AppConfig) -> Result<Vec<String>> {
    let mut messages = Vec::new();
    let mut problems = 0;
    for name in DATABASE_NAMES {
        let Some(id) = config.databases.by_name(name) else {
            continue;
        };
        let schema = store
            .schema(id)
            .with_context(|| format!("failed to read schema of {name} ({id})"))?;
        let mut missing = Vec::new();
        let mut mistyped = Vec::new();
        for (column, expected) in expected_columns(name) {
            match schema.columns.get(column) {
                None => missing.push(column),
                Some(actual) if *actual != expected => {
                    mistyped.push(format!("{column} is {actual}, expected {expected}"));
                }
                Some(_) => {}
            }
        }
        if missing.is_empty() && mistyped.is_empty() {
            messages.push(format!("ok: {name} ({} columns)", schema.columns.len()));
            continue;
        }
        problems += missing.len() + mistyped.len();
        if !missing.is_empty() {
            messages.push(format!("missing in {name}: {}", missing.join(", ")));
        }
        if !mistyped.is_empty() {
            messages.push(format!("wrong type in {name}: {}", mistyped.join(", ")));
        }
    }
    if problems > 0 {
        return Err(anyhow!(
            "destination schemas have {problems} column problem(s):\n{}",
            messages.join("\n")
        ));
    }
    Ok(messages)
}

pub fn dump_database(store: &dyn RowStore, database_id: &str) -> Result<Vec<StoredRow>> {
    query_all(store, database_id, None)
        .with_context(|| format!("failed to query database {database_id}"))
}

/// Runs every enabled job once. A failing job is recorded and the pass
/// moves on.
pub fn run_pass(ctx: &Context<'_>, only: Option<JobKind>) -> PassReport {
    let mut report = PassReport::new(ctx.now);
    let wanted = |kind: JobKind| only.is_none_or(|k| k == kind);
    let app = ctx.app();

    let mut record = |name: String, outcome: Result<JobReport>| match outcome {
        Ok(job) => report.jobs.push(job),
        Err(err) => {
            warn!(job = %name, error = %format!("{err:#}"), "job failed; continuing with next job");
            report.failed_jobs.push(name);
        }
    };

    if wanted(JobKind::Lifts)
        && let Some(page) = app.lifts.as_ref().filter(|p| p.enabled)
    {
        record("lifts".to_string(), run_lifts(ctx, page));
    }
    if wanted(JobKind::History)
        && let Some(history) = app.history.as_ref().filter(|h| h.page.enabled)
    {
        record(
            "history".to_string(),
            run_history(ctx, &history.page, history.season_page_id.as_deref()),
        );
    }
    if wanted(JobKind::Forecasts) {
        for source in app.forecasts.iter().filter(|s| s.page.enabled) {
            record(format!("forecast {}", source.elevation), run_forecast(ctx, source));
        }
    }
    if wanted(JobKind::Conditions) {
        for station in app.stations.iter().filter(|s| s.page.enabled) {
            record(format!("conditions {}", station.name), run_station(ctx, station));
        }
    }

    info!(
        jobs = report.jobs.len(),
        failed = report.failed_jobs.len(),
        inserted = report.total_inserted(),
        "pass complete"
    );
    report
}

fn fetch_page(ctx: &Context<'_>, page: &PageJob) -> Result<Option<String>> {
    let timeout = Duration::from_millis(page.timeout_ms.unwrap_or(ctx.app().render.timeout_ms));
    match ctx.fetcher.fetch_rendered(&page.url, &page.ready_selector, timeout) {
        Ok(html) => Ok(Some(html)),
        Err(err) if err.is_timeout() => {
            warn!(url = %page.url, error = %err, "page never became ready; skipping this pass");
            Ok(None)
        }
        Err(err) => Err(err).with_context(|| format!("failed to fetch {}", page.url)),
    }
}

/// Dedup against the store, then write what is new.
fn sync_rows<R: CanonicalRow>(
    ctx: &Context<'_>,
    mut report: JobReport,
    database_id: &str,
    rows: Vec<R>,
    filter: Option<&Filter>,
) -> Result<JobReport> {
    report.scraped = rows.len();
    if rows.is_empty() {
        info!(job = %report.job, "no rows extracted");
        return Ok(report);
    }

    let existing = existing_keys::<R>(ctx.store, database_id, filter)
        .with_context(|| format!("failed to load existing rows for {}", report.job))?;
    let fresh = diff(rows, &existing);
    report.existing = existing.len();
    report.new = fresh.len();

    if !fresh.is_empty() {
        let result = Upserter::new(ctx.store, ctx.retry).upsert_all(database_id, &fresh);
        report.inserted = result.inserted;
        report.failed = result.failed;
    }

    info!(
        job = %report.job,
        scraped = report.scraped,
        existing = report.existing,
        new = report.new,
        inserted = report.inserted,
        failed = report.failed,
        "job summary"
    );
    Ok(report)
}

pub fn run_lifts(ctx: &Context<'_>, page: &PageJob) -> Result<JobReport> {
    let report = JobReport::named("lifts");
    let database_id = ctx.database("lifts")?;
    let Some(html) = fetch_page(ctx, page)? else {
        return Ok(report);
    };
    let lifts = lifts_from_rows(&extract_lifts(&html).rows);
    sync_rows(ctx, report, database_id, lifts, None)
}

pub fn run_history(
    ctx: &Context<'_>,
    page: &PageJob,
    season_page_id: Option<&str>,
) -> Result<JobReport> {
    let report = JobReport::named("history");
    let database_id = ctx.database("snowfall_history")?;
    let Some(html) = fetch_page(ctx, page)? else {
        return Ok(report);
    };
    let today = ctx.now.with_timezone(&ctx.app().timezone()).date_naive();
    let records = history_from_rows(&extract_history(&html).rows, today, season_page_id);
    let filter = history_filter(&records);
    sync_rows(ctx, report, database_id, records, filter.as_ref())
}

/// Relation id of the row whose title mentions `needle`, if the lookup
/// database is configured.
fn lookup_relation(ctx: &Context<'_>, database: &str, needle: &str) -> Option<String> {
    let database_id = ctx.app().databases.by_name(database)?;
    match find_row_id(ctx.store, database_id, needle) {
        Ok(Some(id)) => Some(id),
        Ok(None) => {
            warn!(%database, %needle, "no related row found");
            None
        }
        Err(err) => {
            warn!(%database, %needle, error = %err, "relation lookup failed");
            None
        }
    }
}

pub fn run_forecast(ctx: &Context<'_>, source: &ForecastSource) -> Result<JobReport> {
    let mut report = JobReport::named(format!("forecast {}", source.elevation));
    let database_id = ctx.database("forecasts")?;
    let Some(html) = fetch_page(ctx, &source.page)? else {
        return Ok(report);
    };

    let schedule = &ctx.app().schedule;
    let extracted = match source.layout {
        ForecastLayout::Table => extract_table_forecast(&html, ctx.now, ctx.app().timezone()),
        ForecastLayout::Cards => {
            extract_card_forecast(&html, ctx.now, schedule.fixed_offset_hours)
        }
    };
    report.next_update_minutes = extracted
        .meta
        .next_update
        .map(|next| next.minutes_until(ctx.now));

    let elevation_id = lookup_relation(ctx, "forecast_elevations", &source.elevation);
    let entries = match source.layout {
        ForecastLayout::Table => {
            forecasts_from_table(&extracted, &source.elevation, elevation_id.as_deref(), ctx.now)
        }
        ForecastLayout::Cards => forecasts_from_cards(
            &extracted,
            &source.elevation,
            elevation_id.as_deref(),
            ctx.now,
            schedule.fixed_offset_hours,
        ),
    };

    let filter = forecast_filter(&source.elevation);
    sync_rows(ctx, report, database_id, entries, Some(&filter))
}

impl From<&StationConfig> for StationMeta {
    fn from(station: &StationConfig) -> Self {
        Self {
            name: station.name.clone(),
            url: station.page.url.clone(),
            webcam_indices: station.webcams.clone(),
            system_id: station.system_id.clone(),
        }
    }
}

fn classify_frame(ctx: &Context<'_>, station: &str, frame_url: &str) -> Option<SkyLabel> {
    let classifier = ctx.classifier?;
    match ctx.fetcher.fetch_bytes(frame_url) {
        Ok(bytes) => {
            let label = classifier.classify(&bytes);
            info!(%station, label = ?label.map(|l| l.as_str()), "webcam classified");
            label
        }
        Err(err) => {
            warn!(%station, url = %frame_url, error = %err, "webcam download failed");
            None
        }
    }
}

pub fn run_station(ctx: &Context<'_>, station: &StationConfig) -> Result<JobReport> {
    let meta = StationMeta::from(station);
    let report = JobReport::named(format!("conditions {}", meta.name));
    let database_id = ctx.database("ski_conditions")?;
    let Some(html) = fetch_page(ctx, &station.page)? else {
        return Ok(report);
    };

    let webcams = extract_webcams(&html, &meta.webcam_indices, &meta.url);
    let ai_label = webcams
        .first()
        .and_then(|frame| classify_frame(ctx, &meta.name, frame));
    let system_id = meta
        .system_id
        .clone()
        .or_else(|| lookup_relation(ctx, "weather_stations", &meta.name));

    let readings = station_readings(
        &extract_station(&html).rows,
        &meta.name,
        ctx.app().timezone(),
        ctx.now,
        ai_label,
        &webcams,
        system_id.as_deref(),
    );
    let filter = station_filter(&meta.name);
    sync_rows(ctx, report, database_id, readings, Some(&filter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::fetch::FetchError;
    use std::collections::HashMap;
    use std::path::PathBuf;

    struct PageMap(HashMap<String, String>);

    impl PageFetcher for PageMap {
        fn fetch_rendered(
            &self,
            url: &str,
            ready_selector: &str,
            _timeout: Duration,
        ) -> Result<String, FetchError> {
            self.0.get(url).cloned().ok_or_else(|| FetchError::Timeout {
                url: url.to_string(),
                selector: ready_selector.to_string(),
                waited_ms: 0,
            })
        }

        fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            Err(FetchError::Http {
                url: url.to_string(),
                status: 404,
            })
        }
    }

    const CONFIG: &str = r#"
        [store]
        endpoint = "https://api.notion.com/v1"

        [render]
        mode = "file"

        [retry]
        backoff_ms = 0

        [databases]
        lifts = "db-lifts"
        forecasts = "db-forecasts"

        [lifts]
        url = "lifts.html"
        ready_selector = ".row"

        [[forecasts]]
        elevation = "1800m"
        layout = "cards"
        url = "alpine.html"
        ready_selector = ".alpine__container"
    "#;

    fn loaded() -> LoadedConfig {
        LoadedConfig {
            path: PathBuf::from("/tmp/skisync.toml"),
            config: parse_config(CONFIG).unwrap(),
        }
    }

    #[test]
    fn timeout_skips_job_and_pass_continues() {
        let config = loaded();
        let store = MemoryStore::default();
        prepare_memory_store(&store, &config.config);
        let fetcher = PageMap(HashMap::from([(
            "lifts.html".to_string(),
            r#"<div class="row"><div class="cell">Lift A</div><div class="cell">1,100</div><div class="cell">2,200</div></div>"#
                .to_string(),
        )]));
        let ctx = Context {
            config: &config,
            fetcher: &fetcher,
            store: &store,
            classifier: None,
            retry: RetryPolicy::from(&config.config.retry),
            now: Utc::now(),
        };

        let report = run_pass(&ctx, None);
        assert!(report.failed_jobs.is_empty());
        assert_eq!(report.jobs.len(), 2);
        assert_eq!(report.jobs[0].inserted, 1);
        assert_eq!(report.jobs[1].scraped, 0);
        assert!(report.countdowns().is_empty());

        let again = run_pass(&ctx, Some(JobKind::Lifts));
        assert_eq!(again.jobs.len(), 1);
        assert_eq!(again.jobs[0].existing, 1);
        assert_eq!(again.jobs[0].inserted, 0);
    }

    #[test]
    fn unknown_database_fails_only_that_job() {
        let config = loaded();
        let store = MemoryStore::default();
        let fetcher = PageMap(HashMap::from([(
            "lifts.html".to_string(),
            r#"<div class="row"><div class="cell">Lift A</div><div class="cell">1</div><div class="cell">2</div></div>"#
                .to_string(),
        )]));
        let ctx = Context {
            config: &config,
            fetcher: &fetcher,
            store: &store,
            classifier: None,
            retry: RetryPolicy::from(&config.config.retry),
            now: Utc::now(),
        };
        let report = run_pass(&ctx, None);
        assert_eq!(report.failed_jobs, vec!["lifts".to_string()]);
        assert_eq!(report.jobs.len(), 1);
    }

    #[test]
    fn remote_schema_check_reports_missing_columns() {
        let config = loaded();
        let store = MemoryStore::default();
        store.create_database(
            "db-lifts",
            &[
                (columns::LIFT_NAME, ColumnType::Title),
                (columns::LIFT_BOTTOM, ColumnType::Number),
                (columns::LIFT_TOP, ColumnType::Number),
            ],
        );
        store.create_database("db-forecasts", &[(columns::FORECAST_TITLE, ColumnType::Title)]);
        let err = check_remote_schemas(&store, &config.config).unwrap_err();
        assert!(format!("{err:#}").contains("missing in forecasts"));
    }

    #[test]
    fn remote_schema_check_reports_wrong_column_types() {
        let config = loaded();
        let store = MemoryStore::default();
        store.create_database("db-lifts", &expected_columns("lifts"));
        let mut forecast_columns = expected_columns("forecasts");
        for (column, kind) in &mut forecast_columns {
            if *column == columns::FORECAST_TYPE {
                *kind = ColumnType::Select;
            }
        }
        store.create_database("db-forecasts", &forecast_columns);
        let err = check_remote_schemas(&store, &config.config).unwrap_err();
        let text = format!("{err:#}");
        assert!(text.contains(
            "wrong type in forecasts: Forecast Type is select, expected rich_text"
        ));
        assert!(!text.contains("missing in forecasts"));
    }
}
