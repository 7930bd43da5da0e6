//! Server settings
//!
//! Priority (highest to lowest):
//! 1. Environment variables (`BLABBER__` prefix, `__` between sections)
//! 2. `blabber.toml` in the working directory
//! 3. `blabber/blabber.toml` in the user config directory
//! 4. Built-in defaults

use blabber_core::{Credentials, PipelineConfig, VoiceDefaults};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const CONFIG_FILE: &str = "blabber.toml";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to load settings: {0}")]
    Load(#[from] ConfigError),

    #[error("Invalid setting: {0}")]
    Invalid(String),

    #[error(transparent)]
    Pipeline(#[from] blabber_core::Error),
}

/// HTTP listener and playback cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Interval between two packet pulls of a session player (milliseconds)
    #[serde(default = "default_frame_ms")]
    pub frame_ms: u64,

    /// Packets buffered per audio listener before it starts lagging
    #[serde(default = "default_listener_buffer")]
    pub listener_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            frame_ms: default_frame_ms(),
            listener_buffer: default_listener_buffer(),
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn frame(&self) -> Duration {
        Duration::from_millis(self.frame_ms)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_frame_ms() -> u64 {
    20
}

fn default_listener_buffer() -> usize {
    256
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub voice: VoiceDefaults,
}

impl Settings {
    /// Load layered settings and fill in what the files leave open
    pub fn load() -> Result<Self, SettingsError> {
        let mut builder = Config::builder();

        if let Some(dir) = dirs::config_dir() {
            builder = builder.add_source(File::from(user_config_path(dir)).required(false));
        }

        builder = builder
            .add_source(File::from(PathBuf::from(CONFIG_FILE)).required(false))
            .add_source(
                Environment::with_prefix("BLABBER")
                    .separator("__")
                    .try_parsing(true),
            );

        let settings: Settings = builder.build()?.try_deserialize()?;
        let settings = settings.resolve();
        settings.validate()?;
        Ok(settings)
    }

    /// Apply environment credentials and the playback read bound
    fn resolve(mut self) -> Self {
        if self.pipeline.credentials.is_anonymous() {
            self.pipeline.credentials = Credentials::from_env();
        }
        // A player must never block past its next frame
        if self.pipeline.read_timeout_ms.is_none() {
            self.pipeline.read_timeout_ms = Some(self.server.frame_ms);
        }
        self
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.server.frame_ms == 0 {
            return Err(SettingsError::Invalid(
                "server.frame_ms must be non-zero".to_string(),
            ));
        }
        if self.server.listener_buffer == 0 {
            return Err(SettingsError::Invalid(
                "server.listener_buffer must be non-zero".to_string(),
            ));
        }
        if self.voice.language_code.trim().is_empty() {
            return Err(SettingsError::Invalid(
                "voice.language_code must not be empty".to_string(),
            ));
        }
        self.pipeline.validate()?;
        Ok(())
    }
}

fn user_config_path(dir: PathBuf) -> PathBuf {
    dir.join("blabber").join(CONFIG_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn from_toml(text: &str) -> Settings {
        Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.server.addr(), "0.0.0.0:8080");
        assert_eq!(settings.server.frame(), Duration::from_millis(20));
        assert_eq!(settings.pipeline.workers, 16);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let settings = from_toml(
            r#"
            [server]
            port = 9000

            [pipeline]
            workers = 4
            endpoint = "http://localhost:5000/synthesize"

            [voice]
            language_code = "en-GB"
            gender = "FEMALE"
            "#,
        );

        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.frame_ms, 20);
        assert_eq!(settings.pipeline.workers, 4);
        assert_eq!(settings.pipeline.max_text_chars, 600);
        assert_eq!(settings.voice.language_code, "en-GB");
        assert_eq!(settings.voice.gender, blabber_core::SsmlGender::Female);
    }

    #[test]
    fn test_read_timeout_follows_frame() {
        let mut settings = Settings::default();
        settings.server.frame_ms = 40;
        let settings = settings.resolve();
        assert_eq!(settings.pipeline.read_timeout_ms, Some(40));
    }

    #[test]
    fn test_explicit_read_timeout_is_kept() {
        let mut settings = Settings::default();
        settings.pipeline.read_timeout_ms = Some(5);
        assert_eq!(settings.resolve().pipeline.read_timeout_ms, Some(5));
    }

    #[test]
    fn test_validation_rejects_zero_frame() {
        let mut settings = Settings::default();
        settings.server.frame_ms = 0;
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::Invalid(_))
        ));

        settings.server.frame_ms = 20;
        settings.pipeline.chunk_size = 0;
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::Pipeline(_))
        ));
    }

    #[test]
    fn test_user_config_path() {
        let path = user_config_path(PathBuf::from("/home/me/.config"));
        assert_eq!(path, PathBuf::from("/home/me/.config/blabber/blabber.toml"));
    }
}
