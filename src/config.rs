use anyhow::{Context, Result, anyhow, bail};
use chrono_tz::Tz;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub path: PathBuf,
    pub config: AppConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub store: StoreConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    pub databases: DatabaseIds,
    #[serde(default)]
    pub lifts: Option<PageJob>,
    #[serde(default)]
    pub history: Option<HistoryJob>,
    #[serde(default)]
    pub forecasts: Vec<ForecastSource>,
    #[serde(default)]
    pub stations: Vec<StationConfig>,
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        if self.store.endpoint.trim().is_empty() {
            bail!("store.endpoint must not be empty");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.schedule.default_delay_minutes == 0 {
            bail!("schedule.default_delay_minutes must be positive");
        }
        self.schedule
            .timezone
            .parse::<Tz>()
            .map_err(|err| anyhow!("schedule.timezone is not a known zone: {err}"))?;

        match self.render.mode {
            RenderMode::Service => {
                if self.render.endpoint.is_none() {
                    bail!("render.endpoint is required for service mode");
                }
            }
            RenderMode::Direct | RenderMode::File => {}
        }

        if let Some(lifts) = &self.lifts {
            lifts.validate("lifts")?;
            require_database(&self.databases.lifts, "lifts")?;
        }
        if let Some(history) = &self.history {
            history.page.validate("history")?;
            require_database(&self.databases.snowfall_history, "snowfall_history")?;
        }
        for source in &self.forecasts {
            if source.elevation.trim().is_empty() {
                bail!("forecasts[].elevation must not be empty");
            }
            source.page.validate(&format!("forecast {}", source.elevation))?;
        }
        if !self.forecasts.is_empty() {
            require_database(&self.databases.forecasts, "forecasts")?;
        }
        for station in &self.stations {
            if station.name.trim().is_empty() {
                bail!("stations[].name must not be empty");
            }
            station.page.validate(&format!("station {}", station.name))?;
            if station.webcams.contains(&0) {
                bail!("station {} webcam indices are 1-based", station.name);
            }
        }
        if !self.stations.is_empty() {
            require_database(&self.databases.ski_conditions, "ski_conditions")?;
        }

        Ok(())
    }

    pub fn timezone(&self) -> Tz {
        self.schedule
            .timezone
            .parse::<Tz>()
            .unwrap_or(chrono_tz::America::Vancouver)
    }

    pub fn default_delay(&self) -> Duration {
        Duration::from_secs(self.schedule.default_delay_minutes * 60)
    }
}

fn require_database(id: &Option<String>, name: &str) -> Result<()> {
    match id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => Ok(()),
        _ => bail!("databases.{name} is required when its job is configured"),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub endpoint: String,
    #[serde(default = "default_store_version")]
    pub api_version: String,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    #[default]
    Service,
    Direct,
    File,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenderConfig {
    #[serde(default)]
    pub mode: RenderMode,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default = "default_render_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            mode: RenderMode::Service,
            endpoint: None,
            token_env: None,
            timeout_ms: default_render_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_classifier_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_classifier_model")]
    pub model: String,
    #[serde(default = "default_classifier_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_classifier_endpoint(),
            model: default_classifier_model(),
            api_key_env: default_classifier_key_env(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            backoff_ms: default_retry_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_delay_minutes")]
    pub default_delay_minutes: u64,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Hours added to fixed-offset local times to reach UTC.
    #[serde(default = "default_fixed_offset_hours")]
    pub fixed_offset_hours: i64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            default_delay_minutes: default_delay_minutes(),
            timezone: default_timezone(),
            fixed_offset_hours: default_fixed_offset_hours(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DatabaseIds {
    #[serde(default)]
    pub lifts: Option<String>,
    #[serde(default)]
    pub snowfall_history: Option<String>,
    #[serde(default)]
    pub forecast_elevations: Option<String>,
    #[serde(default)]
    pub forecasts: Option<String>,
    #[serde(default)]
    pub weather_stations: Option<String>,
    #[serde(default)]
    pub ski_conditions: Option<String>,
}

impl DatabaseIds {
    pub fn by_name(&self, name: &str) -> Option<&str> {
        let id = match name {
            "lifts" => &self.lifts,
            "snowfall_history" | "history" => &self.snowfall_history,
            "forecast_elevations" => &self.forecast_elevations,
            "forecasts" => &self.forecasts,
            "weather_stations" => &self.weather_stations,
            "ski_conditions" | "conditions" => &self.ski_conditions,
            _ => return None,
        };
        id.as_deref()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PageJob {
    pub url: String,
    pub ready_selector: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl PageJob {
    fn validate(&self, label: &str) -> Result<()> {
        if self.url.trim().is_empty() {
            bail!("{label}: url must not be empty");
        }
        if self.ready_selector.trim().is_empty() {
            bail!("{label}: ready_selector must not be empty");
        }
        scraper::Selector::parse(&self.ready_selector)
            .map_err(|err| anyhow!("{label}: invalid ready_selector: {err:?}"))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryJob {
    #[serde(flatten)]
    pub page: PageJob,
    #[serde(default)]
    pub season_page_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ForecastLayout {
    Table,
    Cards,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForecastSource {
    pub elevation: String,
    pub layout: ForecastLayout,
    #[serde(flatten)]
    pub page: PageJob,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StationConfig {
    pub name: String,
    #[serde(flatten)]
    pub page: PageJob,
    #[serde(default)]
    pub webcams: Vec<usize>,
    #[serde(default)]
    pub system_id: Option<String>,
}

/// Credentials read from the environment once at start-up.
#[derive(Clone, Default)]
pub struct Secrets {
    pub store_token: Option<String>,
    pub render_token: Option<String>,
    pub classifier_key: Option<String>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("store_token", &self.store_token.as_ref().map(|_| "***"))
            .field("render_token", &self.render_token.as_ref().map(|_| "***"))
            .field("classifier_key", &self.classifier_key.as_ref().map(|_| "***"))
            .finish()
    }
}

impl Secrets {
    pub fn from_env(config: &AppConfig) -> Self {
        let read = |name: &str| {
            std::env::var(name)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            store_token: read(&config.store.token_env),
            render_token: config.render.token_env.as_deref().and_then(read),
            classifier_key: read(&config.classifier.api_key_env),
        }
    }
}

pub fn load_config(config_path: &Path) -> Result<LoadedConfig> {
    let text = std::fs::read_to_string(config_path)
        .with_context(|| format!("failed to read config: {}", config_path.display()))?;
    let config = parse_config(&text)
        .with_context(|| format!("invalid config {}", config_path.display()))?;
    Ok(LoadedConfig {
        path: config_path.to_path_buf(),
        config,
    })
}

pub fn parse_config(text: &str) -> Result<AppConfig> {
    let config: AppConfig = toml::from_str(text).context("failed to parse toml")?;
    config.validate()?;
    Ok(config)
}

pub fn resolve_path(base_config_path: &Path, maybe_relative: &Path) -> Result<PathBuf> {
    if maybe_relative.is_absolute() {
        return Ok(maybe_relative.to_path_buf());
    }

    let parent = base_config_path.parent().ok_or_else(|| {
        anyhow!(
            "config has no parent directory: {}",
            base_config_path.display()
        )
    })?;

    Ok(parent.join(maybe_relative))
}

fn default_true() -> bool {
    true
}

fn default_store_version() -> String {
    "2022-06-28".to_string()
}

fn default_token_env() -> String {
    "NOTION_TOKEN".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_page_size() -> u32 {
    100
}

fn default_render_timeout_ms() -> u64 {
    60_000
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_classifier_endpoint() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_classifier_model() -> String {
    "gemini-1.5-flash".to_string()
}

fn default_classifier_key_env() -> String {
    "GEMINI_API_KEY".to_string()
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    2_000
}

fn default_delay_minutes() -> u64 {
    60
}

fn default_timezone() -> String {
    "America/Vancouver".to_string()
}

fn default_fixed_offset_hours() -> i64 {
    8
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [store]
        endpoint = "https://api.notion.com/v1"

        [render]
        mode = "file"

        [databases]
        lifts = "db-lifts"
        forecasts = "db-forecasts"

        [lifts]
        url = "fixtures/lifts.html"
        ready_selector = ".row"

        [[forecasts]]
        elevation = "1800m"
        layout = "cards"
        url = "fixtures/alpine.html"
        ready_selector = ".alpine__container"
    "#;

    #[test]
    fn applies_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.backoff_ms, 2_000);
        assert_eq!(config.schedule.default_delay_minutes, 60);
        assert_eq!(config.default_delay(), Duration::from_secs(3600));
        assert_eq!(config.timezone(), chrono_tz::America::Vancouver);
        assert_eq!(config.forecasts[0].layout, ForecastLayout::Cards);
        assert!(config.lifts.as_ref().unwrap().enabled);
    }

    #[test]
    fn rejects_job_without_database() {
        let text = MINIMAL.replace("lifts = \"db-lifts\"", "");
        let err = parse_config(&text).unwrap_err();
        assert!(format!("{err:#}").contains("databases.lifts"));
    }

    #[test]
    fn service_mode_requires_endpoint() {
        let text = MINIMAL.replace("mode = \"file\"", "mode = \"service\"");
        assert!(parse_config(&text).is_err());
    }

    #[test]
    fn resolves_relative_paths_against_config_dir() {
        let resolved =
            resolve_path(Path::new("/etc/skisync/config.toml"), Path::new("pages/a.html")).unwrap();
        assert_eq!(resolved, PathBuf::from("/etc/skisync/pages/a.html"));
    }

    #[test]
    fn shipped_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("configs/whistler.toml");
        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.config.forecasts.len(), 3);
        assert_eq!(loaded.config.stations.len(), 3);
        assert_eq!(loaded.config.render.mode, RenderMode::Service);
    }
}
