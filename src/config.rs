use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs, io};

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::grid::BoundingBox;
use crate::retry::RetryPolicy;

pub const DEFAULT_NEARBY_ENDPOINT: &str =
    "https://maps.googleapis.com/maps/api/place/nearbysearch/json";
pub const DEFAULT_DETAILS_ENDPOINT: &str =
    "https://maps.googleapis.com/maps/api/place/details/json";

const DEFAULT_JOURNAL_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_JOURNAL_MAX_FILES: usize = 5;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub journal: JournalSettings,
    pub endpoints: ProviderEndpoints,
    pub google_places_api_key: Option<SecretString>,
    pub keyword: String,
    pub crawl: CrawlSettings,
}

#[derive(Clone, Debug)]
pub struct JournalSettings {
    pub enabled: bool,
    pub directory: PathBuf,
    pub batch_size: usize,
    pub max_file_bytes: u64,
    pub max_files: usize,
}

#[derive(Clone, Debug)]
pub struct ProviderEndpoints {
    pub nearby_search: String,
    pub place_details: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for ProviderEndpoints {
    fn default() -> Self {
        Self {
            nearby_search: DEFAULT_NEARBY_ENDPOINT.to_string(),
            place_details: DEFAULT_DETAILS_ENDPOINT.to_string(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(90),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PlateauSettings {
    pub window: usize,
    pub threshold: f64,
    pub stable_windows: u32,
    pub warmup_points: usize,
}

impl Default for PlateauSettings {
    fn default() -> Self {
        Self {
            window: 50,
            threshold: 0.5,
            stable_windows: 5,
            warmup_points: 80,
        }
    }
}

/// Knobs shared by every region of a run.
#[derive(Clone, Debug)]
pub struct CrawlSettings {
    pub step_multiplier: f64,
    pub target_per_region: Option<usize>,
    pub plateau: PlateauSettings,
    pub request_delay: Duration,
    pub max_retries: u32,
    pub max_pages: usize,
    pub page_token_delay: Duration,
    pub transient_retry_delay: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub backoff_jitter: Duration,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            step_multiplier: 1.2,
            target_per_region: None,
            plateau: PlateauSettings::default(),
            request_delay: Duration::from_millis(800),
            max_retries: 6,
            max_pages: 3,
            page_token_delay: Duration::from_secs(2),
            transient_retry_delay: Duration::from_secs(2),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            backoff_jitter: Duration::from_secs(1),
        }
    }
}

impl CrawlSettings {
    /// All waits zeroed; the shape of the crawl is unchanged.
    pub fn without_delays(mut self) -> Self {
        self.request_delay = Duration::ZERO;
        self.page_token_delay = Duration::ZERO;
        self.transient_retry_delay = Duration::ZERO;
        self.backoff_base = Duration::ZERO;
        self.backoff_max = Duration::ZERO;
        self.backoff_jitter = Duration::ZERO;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            self.backoff_base,
            self.backoff_max,
            self.backoff_jitter,
        )
    }

    pub fn validate(&self) -> AppResult<()> {
        if !(self.step_multiplier.is_finite() && self.step_multiplier > 0.0) {
            return Err(AppError::Config(format!(
                "step multiplier must be positive, got {}",
                self.step_multiplier
            )));
        }
        if self.plateau.window == 0 {
            return Err(AppError::Config("plateau window must be at least 1".into()));
        }
        if self.plateau.stable_windows == 0 {
            return Err(AppError::Config(
                "plateau stability count must be at least 1".into(),
            ));
        }
        if !self.plateau.threshold.is_finite() {
            return Err(AppError::Config("plateau threshold must be finite".into()));
        }
        if self.max_pages == 0 {
            return Err(AppError::Config("max pages per point must be at least 1".into()));
        }
        if self.max_retries == 0 {
            return Err(AppError::Config("max retries must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegionConfig {
    pub name: String,
    pub bbox: BoundingBox,
    pub radius_m: u32,
    #[serde(default)]
    pub target: Option<usize>,
}

impl RegionConfig {
    pub fn new(name: impl Into<String>, bbox: BoundingBox, radius_m: u32) -> Self {
        Self {
            name: name.into(),
            bbox,
            radius_m,
            target: None,
        }
    }

    pub fn step_meters(&self, multiplier: f64) -> f64 {
        (self.radius_m as f64 * multiplier).floor()
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.name.trim().is_empty() {
            return Err(AppError::Config("region name must not be empty".into()));
        }
        if self.radius_m == 0 {
            return Err(AppError::Config(format!(
                "region {} has a zero search radius",
                self.name
            )));
        }
        self.bbox.validate()
    }
}

#[derive(Debug, Deserialize)]
struct RegionFile {
    regions: Vec<RegionConfig>,
}

pub fn load_regions<P: AsRef<Path>>(path: P) -> AppResult<Vec<RegionConfig>> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;
    let file: RegionFile = toml::from_str(&contents)?;
    if file.regions.is_empty() {
        return Err(AppError::Config(format!(
            "no regions defined in {}",
            path.display()
        )));
    }
    for region in &file.regions {
        region.validate()?;
    }
    Ok(file.regions)
}

/// City presets crawled when no region file is supplied.
pub fn default_regions() -> Vec<RegionConfig> {
    vec![
        RegionConfig::new(
            "San Francisco",
            BoundingBox::new(37.66, 37.84, -122.55, -122.33),
            1200,
        ),
        RegionConfig::new(
            "Los Angeles",
            BoundingBox::new(33.70, 34.35, -118.70, -118.10),
            3000,
        ),
        RegionConfig::new(
            "Chicago",
            BoundingBox::new(41.65, 42.10, -88.05, -87.45),
            1600,
        ),
        RegionConfig::new(
            "New York",
            BoundingBox::new(40.50, 40.95, -74.30, -73.65),
            1400,
        ),
    ]
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let defaults = CrawlSettings::default();
        let plateau_defaults = PlateauSettings::default();
        Self {
            database_path: env::var("CRAWLER_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/places_google.sqlite")),
            journal: JournalSettings {
                enabled: parse_bool("CRAWLER_JOURNAL_ENABLED", true),
                directory: env::var("CRAWLER_JOURNAL_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("data")),
                batch_size: parse_usize("CRAWLER_JOURNAL_BATCH_SIZE", 25).max(1),
                max_file_bytes: parse_u64("CRAWLER_JOURNAL_MAX_BYTES", DEFAULT_JOURNAL_MAX_BYTES),
                max_files: parse_usize("CRAWLER_JOURNAL_MAX_FILES", DEFAULT_JOURNAL_MAX_FILES)
                    .max(1),
            },
            endpoints: ProviderEndpoints {
                nearby_search: env::var("PLACES_NEARBY_ENDPOINT")
                    .unwrap_or_else(|_| DEFAULT_NEARBY_ENDPOINT.to_string()),
                place_details: env::var("PLACES_DETAILS_ENDPOINT")
                    .unwrap_or_else(|_| DEFAULT_DETAILS_ENDPOINT.to_string()),
                connect_timeout: Duration::from_secs(parse_u64("PLACES_CONNECT_TIMEOUT_SECS", 10)),
                read_timeout: Duration::from_secs(parse_u64("PLACES_READ_TIMEOUT_SECS", 90)),
            },
            google_places_api_key: env::var("GOOGLE_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            keyword: env::var("PLACES_KEYWORD")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| "restaurant".to_string()),
            crawl: CrawlSettings {
                step_multiplier: parse_f64("CRAWL_STEP_MULTIPLIER", defaults.step_multiplier),
                target_per_region: env::var("CRAWL_TARGET_PER_REGION")
                    .ok()
                    .and_then(|v| v.parse::<usize>().ok()),
                plateau: PlateauSettings {
                    window: parse_usize("CRAWL_PLATEAU_WINDOW", plateau_defaults.window),
                    threshold: parse_f64("CRAWL_PLATEAU_THRESHOLD", plateau_defaults.threshold),
                    stable_windows: parse_u32(
                        "CRAWL_PLATEAU_STABLE_WINDOWS",
                        plateau_defaults.stable_windows,
                    ),
                    warmup_points: parse_usize(
                        "CRAWL_WARMUP_POINTS",
                        plateau_defaults.warmup_points,
                    ),
                },
                request_delay: parse_millis("CRAWL_REQUEST_DELAY_MS", defaults.request_delay),
                max_retries: parse_u32("CRAWL_MAX_RETRIES", defaults.max_retries),
                max_pages: parse_usize("CRAWL_MAX_PAGES", defaults.max_pages),
                page_token_delay: parse_millis(
                    "CRAWL_PAGE_TOKEN_DELAY_MS",
                    defaults.page_token_delay,
                ),
                transient_retry_delay: parse_millis(
                    "CRAWL_TRANSIENT_DELAY_MS",
                    defaults.transient_retry_delay,
                ),
                backoff_base: parse_millis("CRAWL_BACKOFF_BASE_MS", defaults.backoff_base),
                backoff_max: parse_millis("CRAWL_BACKOFF_MAX_MS", defaults.backoff_max),
                backoff_jitter: parse_millis("CRAWL_BACKOFF_JITTER_MS", defaults.backoff_jitter),
            },
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn parse_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

fn parse_millis(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
