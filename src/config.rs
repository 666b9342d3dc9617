//! Configuration management for the voice player
//!
//! Loads settings from environment variables (.env file)

use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Discord bot token
    pub discord_token: String,
    /// Playback pipeline settings
    pub media: MediaConfig,
}

/// Settings consumed by the resolver and the per-guild players
#[derive(Debug, Clone)]
pub struct MediaConfig {
    /// Explicit yt-dlp location; looked up next to the binary and on PATH otherwise
    pub ytdlp_path: Option<PathBuf>,
    /// Explicit ffmpeg location; looked up next to the binary and on PATH otherwise
    pub ffmpeg_path: Option<PathBuf>,
    /// Cookies file handed to yt-dlp for metadata lookups
    pub cookies_file: Option<PathBuf>,
    /// How long a cancelled pipeline may drain before its processes are killed
    pub grace_period: Duration,
    /// Bytes moved per copy-loop iteration (one pause check per chunk)
    pub chunk_size: usize,
    /// Wait between connection liveness checks while a track is pending
    pub connect_poll: Duration,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ytdlp_path: None,
            ffmpeg_path: None,
            cookies_file: None,
            grace_period: Duration::from_millis(400),
            chunk_size: 8192,
            connect_poll: Duration::from_millis(200),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let discord_token = env::var("DISCORD_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("DISCORD_TOKEN".to_string()))?;

        Ok(Self {
            discord_token,
            media: MediaConfig::from_env()?,
        })
    }
}

impl MediaConfig {
    /// Load playback settings, falling back to defaults for anything unset
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let chunk_size = parse_var("COPY_CHUNK_BYTES")?.unwrap_or(defaults.chunk_size);
        if chunk_size == 0 || chunk_size % 2 != 0 {
            return Err(ConfigError::InvalidValue(
                "COPY_CHUNK_BYTES".to_string(),
                chunk_size.to_string(),
            ));
        }

        Ok(Self {
            ytdlp_path: path_var("YTDLP_PATH"),
            ffmpeg_path: path_var("FFMPEG_PATH"),
            cookies_file: path_var("COOKIES_FILE"),
            grace_period: parse_var("PIPELINE_GRACE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.grace_period),
            chunk_size,
            connect_poll: parse_var("CONNECT_POLL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.connect_poll),
        })
    }
}

fn path_var(name: &str) -> Option<PathBuf> {
    env::var(name).ok().filter(|s| !s.is_empty()).map(PathBuf::from)
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<T>()
                .map_err(|_| ConfigError::InvalidValue(name.to_string(), s))
        })
        .transpose()
}

/// Canonical PCM interchange format
pub mod pcm {
    pub const SAMPLE_RATE: u32 = 48_000;
    pub const CHANNELS: u32 = 2;
    /// Bytes per second of s16le stereo audio
    pub const BYTES_PER_SECOND: usize = SAMPLE_RATE as usize * CHANNELS as usize * 2;
}
