use std::{fs, path::PathBuf, time::Duration};

use common::export::ExportSettings;
use common::fetch::DownloadConfig;
use serde::{Deserialize, Serialize};
use url::Url;

pub const APP_NAME: &str = "atvault";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const EXPORTS_DIR_NAME: &str = "exports";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// PDS used to resolve handles when no DID is given
    #[serde(default = "default_pds_url")]
    pub pds_url: Url,
    /// PLC directory for `did:plc` documents
    #[serde(default = "default_plc_directory")]
    pub plc_directory: Url,
    /// Parallel blob downloads
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Retries after the first failed attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    /// Jobs larger than this are split into parts
    #[serde(default = "default_chunk_threshold")]
    pub chunk_threshold: usize,
    /// Where bundles go when no `--out` is given (defaults to ~/.atvault/exports)
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Daily rolling log files are written here when set
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_pds_url() -> Url {
    Url::parse("https://bsky.social").expect("hardcoded URL must parse")
}

fn default_plc_directory() -> Url {
    Url::parse("https://plc.directory").expect("hardcoded URL must parse")
}

fn default_concurrency() -> usize {
    common::fetch::DEFAULT_CONCURRENCY
}

fn default_max_retries() -> u32 {
    common::fetch::DEFAULT_MAX_RETRIES
}

fn default_retry_base_delay_ms() -> u64 {
    common::fetch::DEFAULT_RETRY_BASE_DELAY.as_millis() as u64
}

fn default_attempt_timeout_ms() -> u64 {
    common::fetch::DEFAULT_ATTEMPT_TIMEOUT.as_millis() as u64
}

fn default_chunk_threshold() -> usize {
    common::export::DEFAULT_CHUNK_THRESHOLD
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            pds_url: default_pds_url(),
            plc_directory: default_plc_directory(),
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            chunk_threshold: default_chunk_threshold(),
            output_dir: None,
            log_level: default_log_level(),
            log_dir: None,
        }
    }
}

impl AppConfig {
    pub fn download_config(&self) -> DownloadConfig {
        DownloadConfig {
            concurrency: self.concurrency,
            max_retries: self.max_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            attempt_timeout: Duration::from_millis(self.attempt_timeout_ms),
        }
    }

    pub fn export_settings(&self) -> ExportSettings {
        ExportSettings {
            chunk_threshold: self.chunk_threshold,
        }
    }

    /// Falls back to `info` on an unparseable level
    pub fn log_level(&self) -> tracing::Level {
        self.log_level.parse().unwrap_or(tracing::Level::INFO)
    }
}

#[derive(Debug, Clone)]
pub struct AppState {
    /// Path to the atvault directory (~/.atvault)
    pub atvault_dir: PathBuf,
    /// Path to the config file
    pub config_path: PathBuf,
    /// Loaded configuration
    pub config: AppConfig,
}

impl AppState {
    /// Get the atvault directory path (custom or default ~/.atvault)
    pub fn atvault_dir(custom_path: Option<PathBuf>) -> Result<PathBuf, StateError> {
        if let Some(path) = custom_path {
            return Ok(path);
        }

        let home = dirs::home_dir().ok_or(StateError::NoHomeDirectory)?;
        Ok(home.join(format!(".{}", APP_NAME)))
    }

    /// Initialize a new atvault directory with a config file
    pub fn init(
        custom_path: Option<PathBuf>,
        config: Option<AppConfig>,
    ) -> Result<Self, StateError> {
        let atvault_dir = Self::atvault_dir(custom_path)?;
        let config_path = atvault_dir.join(CONFIG_FILE_NAME);

        if config_path.exists() {
            return Err(StateError::AlreadyInitialized);
        }

        fs::create_dir_all(&atvault_dir)?;

        let config = config.unwrap_or_default();
        let config_toml = toml::to_string_pretty(&config)?;
        fs::write(&config_path, config_toml)?;

        Ok(Self {
            atvault_dir,
            config_path,
            config,
        })
    }

    /// Load existing state from the atvault directory
    pub fn load(custom_path: Option<PathBuf>) -> Result<Self, StateError> {
        let atvault_dir = Self::atvault_dir(custom_path)?;
        let config_path = atvault_dir.join(CONFIG_FILE_NAME);

        if !config_path.exists() {
            return Err(StateError::NotInitialized);
        }

        let config_toml = fs::read_to_string(&config_path)?;
        let config: AppConfig = toml::from_str(&config_toml)?;

        Ok(Self {
            atvault_dir,
            config_path,
            config,
        })
    }

    /// Load state, or run on defaults when `init` was never called
    pub fn load_or_default(custom_path: Option<PathBuf>) -> Result<Self, StateError> {
        match Self::load(custom_path.clone()) {
            Err(StateError::NotInitialized) => {
                let atvault_dir = Self::atvault_dir(custom_path)?;
                Ok(Self {
                    config_path: atvault_dir.join(CONFIG_FILE_NAME),
                    atvault_dir,
                    config: AppConfig::default(),
                })
            }
            other => other,
        }
    }

    /// Configured output directory, else `<atvault dir>/exports`
    pub fn output_dir(&self) -> PathBuf {
        self.config
            .output_dir
            .clone()
            .unwrap_or_else(|| self.atvault_dir.join(EXPORTS_DIR_NAME))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("atvault directory not initialized. Run 'atvault init' first")]
    NotInitialized,

    #[error("atvault directory already initialized")]
    AlreadyInitialized,

    #[error("no home directory found")]
    NoHomeDirectory,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
}
