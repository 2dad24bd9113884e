use anyhow::{Context, Result, anyhow, bail};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{fs, path::{Path, PathBuf}, time::Duration};

/// Environment variable that takes precedence over `provider.api_key`.
pub const API_KEY_ENV: &str = "OPENWEATHER_API_KEY";

pub const DEFAULT_CITIES: &[&str] = &[
    "Mumbai", "Delhi", "Kolkata", "Bengaluru", "Chennai", "Hyderabad", "Coimbatore", "Goa",
    "Surat", "Jaipur", "Lucknow", "Bhopal", "Nagaland", "Jodhpur", "Shimla",
];

/// Weather provider endpoint and credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub units: String,
    /// Appended to the city in the `q` parameter, e.g. `Mumbai,IN`.
    pub country_code: Option<String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openweathermap.org".to_string(),
            units: "metric".to_string(),
            country_code: Some("IN".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    pub concurrency: usize,
    pub timeout_secs: u64,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self { concurrency: 4, timeout_secs: 10 }
    }
}

impl FetchSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveSettings {
    pub root: Option<PathBuf>,
    pub prefix: String,
    /// 1 means a single fire-and-forget attempt.
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self { root: None, prefix: "weather_data".to_string(), max_attempts: 1, backoff_ms: 200 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub snapshot_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseSettings {
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastSettings {
    /// Offset used to decide what "today" is; 330 = Asia/Kolkata.
    pub utc_offset_minutes: i32,
}

impl Default for ForecastSettings {
    fn default() -> Self {
        Self { utc_offset_minutes: 330 }
    }
}

/// Top-level configuration stored on disk.
///
/// Example TOML:
/// ```toml
/// cities = ["Mumbai", "Delhi"]
///
/// [provider]
/// api_key = "..."
///
/// [fetch]
/// concurrency = 4
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cities: Vec<String>,
    pub provider: ProviderSettings,
    pub fetch: FetchSettings,
    pub archive: ArchiveSettings,
    pub store: StoreSettings,
    pub warehouse: WarehouseSettings,
    pub forecast: ForecastSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cities: DEFAULT_CITIES.iter().map(|c| c.to_string()).collect(),
            provider: ProviderSettings::default(),
            fetch: FetchSettings::default(),
            archive: ArchiveSettings::default(),
            store: StoreSettings::default(),
            warehouse: WarehouseSettings::default(),
            forecast: ForecastSettings::default(),
        }
    }
}

impl Config {
    /// Load config from the platform config dir, or return defaults if it doesn't exist yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            // First run: no config file, use defaults.
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let cfg: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Save config to the platform config dir, creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml =
            toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")?;

        fs::write(path, toml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.cities.is_empty() {
            bail!("No cities configured. Add at least one entry to `cities`.");
        }
        if self.fetch.concurrency == 0 {
            bail!("`fetch.concurrency` must be at least 1");
        }
        if self.archive.max_attempts == 0 {
            bail!("`archive.max_attempts` must be at least 1");
        }
        if self.forecast.utc_offset_minutes.unsigned_abs() >= 24 * 60 {
            bail!(
                "`forecast.utc_offset_minutes` must be within a day of UTC, got {}",
                self.forecast.utc_offset_minutes
            );
        }
        Ok(())
    }

    fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("dev", "weather-pipeline", "weather-pipeline")
            .ok_or_else(|| anyhow!("Could not determine platform config directory"))
    }

    /// Path to the config file.
    pub fn config_file_path() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.config_dir().join("config.toml"))
    }

    fn data_path(configured: &Option<PathBuf>, default_name: &str) -> Result<PathBuf> {
        match configured {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::project_dirs()?.data_dir().join(default_name)),
        }
    }

    pub fn archive_root(&self) -> Result<PathBuf> {
        Self::data_path(&self.archive.root, "archive")
    }

    pub fn store_snapshot_path(&self) -> Result<PathBuf> {
        Self::data_path(&self.store.snapshot_path, "store.json")
    }

    pub fn warehouse_root(&self) -> Result<PathBuf> {
        Self::data_path(&self.warehouse.root, "warehouse")
    }

    pub fn set_api_key(&mut self, api_key: String) {
        self.provider.api_key = Some(api_key);
    }

    /// API key, preferring the `OPENWEATHER_API_KEY` environment variable.
    pub fn api_key(&self) -> Option<String> {
        self.resolve_api_key(std::env::var(API_KEY_ENV).ok().as_deref())
    }

    fn resolve_api_key(&self, env_value: Option<&str>) -> Option<String> {
        env_value
            .filter(|v| !v.trim().is_empty())
            .map(str::to_string)
            .or_else(|| self.provider.api_key.clone().filter(|k| !k.trim().is_empty()))
    }

    pub fn is_provider_configured(&self) -> bool {
        self.api_key().is_some()
    }
}
