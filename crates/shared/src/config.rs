use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::config_env::{
    optional_path_env, optional_trimmed_env, parse_f32_env, parse_u64_env, parse_usize_env,
};

const DEFAULT_STATE_DIR: &str = ".nova";
const DEFAULT_LOCALE: &str = "en-US";
pub const DEFAULT_PREFERRED_VOICE: &str = "Google UK English Female";
pub const DEFAULT_SPEECH_RATE: f32 = 1.02;
pub const DEFAULT_SPEECH_PITCH: f32 = 1.1;
const DEFAULT_SETTLE_DELAY_MS: u64 = 500;
const DEFAULT_RECOGNITION_RETRY_MS: u64 = 750;
const MIN_RECOGNITION_RETRY_MS: u64 = 500;
const MAX_RECOGNITION_RETRY_MS: u64 = 1_000;
const DEFAULT_SYNC_INTERVAL_SECONDS: u64 = 30;
const DEFAULT_PRIOR_TURNS: usize = 20;

#[derive(Debug, Clone)]
pub struct AssistantConfig {
    pub state_dir: PathBuf,
    pub locale: String,
    pub preferred_voice: String,
    pub speech_rate: f32,
    pub speech_pitch: f32,
    pub settle_delay_ms: u64,
    pub recognition_retry_ms: u64,
    pub sync_interval_seconds: u64,
    pub prior_turns: usize,
    pub redis_url: Option<String>,
    pub camera_image_path: Option<PathBuf>,
    pub download_dir: PathBuf,
    pub login_name: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required env var {0}")]
    MissingVar(String),
    #[error("invalid integer in env var {0}")]
    ParseInt(String),
    #[error("invalid number in env var {0}")]
    ParseFloat(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("failed to load .env file: {0}")]
    Dotenv(String),
}

impl Default for AssistantConfig {
    fn default() -> Self {
        let state_dir = PathBuf::from(DEFAULT_STATE_DIR);
        Self {
            download_dir: state_dir.join("downloads"),
            state_dir,
            locale: DEFAULT_LOCALE.to_string(),
            preferred_voice: DEFAULT_PREFERRED_VOICE.to_string(),
            speech_rate: DEFAULT_SPEECH_RATE,
            speech_pitch: DEFAULT_SPEECH_PITCH,
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
            recognition_retry_ms: DEFAULT_RECOGNITION_RETRY_MS,
            sync_interval_seconds: DEFAULT_SYNC_INTERVAL_SECONDS,
            prior_turns: DEFAULT_PRIOR_TURNS,
            redis_url: None,
            camera_image_path: None,
            login_name: None,
        }
    }
}

impl AssistantConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let state_dir = optional_path_env("NOVA_STATE_DIR").unwrap_or(defaults.state_dir);

        let config = Self {
            download_dir: optional_path_env("NOVA_DOWNLOAD_DIR")
                .unwrap_or_else(|| state_dir.join("downloads")),
            state_dir,
            locale: optional_trimmed_env("NOVA_LOCALE").unwrap_or(defaults.locale),
            preferred_voice: optional_trimmed_env("NOVA_PREFERRED_VOICE")
                .unwrap_or(defaults.preferred_voice),
            speech_rate: parse_f32_env("NOVA_SPEECH_RATE", defaults.speech_rate)?,
            speech_pitch: parse_f32_env("NOVA_SPEECH_PITCH", defaults.speech_pitch)?,
            settle_delay_ms: parse_u64_env("NOVA_SETTLE_DELAY_MS", defaults.settle_delay_ms)?,
            recognition_retry_ms: parse_u64_env(
                "NOVA_RECOGNITION_RETRY_MS",
                defaults.recognition_retry_ms,
            )?,
            sync_interval_seconds: parse_u64_env(
                "NOVA_SYNC_INTERVAL_SECONDS",
                defaults.sync_interval_seconds,
            )?,
            prior_turns: parse_usize_env("NOVA_PRIOR_TURNS", defaults.prior_turns)?,
            redis_url: optional_trimmed_env("NOVA_REDIS_URL"),
            camera_image_path: optional_path_env("NOVA_CAMERA_IMAGE_PATH"),
            login_name: optional_trimmed_env("NOVA_USER"),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.settle_delay_ms == 0 {
            return Err(ConfigError::InvalidConfiguration(
                "NOVA_SETTLE_DELAY_MS must be greater than 0".to_string(),
            ));
        }
        if !(MIN_RECOGNITION_RETRY_MS..=MAX_RECOGNITION_RETRY_MS)
            .contains(&self.recognition_retry_ms)
        {
            return Err(ConfigError::InvalidConfiguration(format!(
                "NOVA_RECOGNITION_RETRY_MS must be between {MIN_RECOGNITION_RETRY_MS} and {MAX_RECOGNITION_RETRY_MS}"
            )));
        }
        if self.sync_interval_seconds == 0 {
            return Err(ConfigError::InvalidConfiguration(
                "NOVA_SYNC_INTERVAL_SECONDS must be greater than 0".to_string(),
            ));
        }
        if !self.speech_rate.is_finite() || self.speech_rate <= 0.0 {
            return Err(ConfigError::InvalidConfiguration(
                "NOVA_SPEECH_RATE must be a positive number".to_string(),
            ));
        }
        if !self.speech_pitch.is_finite() || self.speech_pitch <= 0.0 {
            return Err(ConfigError::InvalidConfiguration(
                "NOVA_SPEECH_PITCH must be a positive number".to_string(),
            ));
        }
        if self.locale.is_empty() {
            return Err(ConfigError::InvalidConfiguration(
                "NOVA_LOCALE must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn recognition_retry_delay(&self) -> Duration {
        Duration::from_millis(self.recognition_retry_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_seconds)
    }
}

/// Loads `.env` from the working directory when present. A missing file is
/// fine; a malformed one is reported.
pub fn load_dotenv() -> Result<(), ConfigError> {
    match dotenvy::dotenv() {
        Ok(_) => Ok(()),
        Err(err) if err.not_found() => Ok(()),
        Err(err) => Err(ConfigError::Dotenv(err.to_string())),
    }
}
