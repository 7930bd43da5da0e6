//! Configuration types for the Blabber speech pipeline

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::audio::ExtractRule;
use crate::error::{Error, Result};
use crate::synthesis::SsmlGender;

/// Environment variable holding an API key for the synthesis endpoint
pub const API_KEY_ENV: &str = "BLABBER_API_KEY";

/// Environment variable holding an OAuth access token for the synthesis endpoint
pub const ACCESS_TOKEN_ENV: &str = "BLABBER_ACCESS_TOKEN";

/// Environment variable naming a service account key file
pub const SERVICE_ACCOUNT_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";

/// Main pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of synthesis worker threads
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Text-to-speech synthesize endpoint
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Size of each read from the streamed response body (bytes)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Maximum number of characters accepted per request
    #[serde(default = "default_max_text_chars")]
    pub max_text_chars: usize,

    /// Where the base64 audio sits in the response
    #[serde(default)]
    pub extract_rule: ExtractRule,

    /// How often idle workers check for shutdown (milliseconds)
    #[serde(default = "default_queue_poll_ms")]
    pub queue_poll_ms: u64,

    /// How long teardown waits for workers to finish (milliseconds)
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,

    /// Upper bound on a single channel read from the playback side (milliseconds)
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,

    /// Whole-request timeout for one synthesis call (seconds)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Credentials attached to every synthesis call
    #[serde(default)]
    pub credentials: Credentials,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            endpoint: default_endpoint(),
            chunk_size: default_chunk_size(),
            max_text_chars: default_max_text_chars(),
            extract_rule: ExtractRule::default(),
            queue_poll_ms: default_queue_poll_ms(),
            join_timeout_ms: default_join_timeout_ms(),
            read_timeout_ms: None,
            request_timeout_secs: default_request_timeout_secs(),
            credentials: Credentials::default(),
        }
    }
}

impl PipelineConfig {
    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be non-zero".to_string()));
        }
        if self.max_text_chars == 0 {
            return Err(Error::Config("max_text_chars must be non-zero".to_string()));
        }
        if let ExtractRule::Field(name) = &self.extract_rule {
            if name.is_empty() {
                return Err(Error::Config("extract_rule field must not be empty".to_string()));
            }
        }
        if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
            return Err(Error::Config(format!(
                "endpoint must be an http(s) URL: {}",
                self.endpoint
            )));
        }
        self.credentials.validate()
    }

    pub fn queue_poll(&self) -> Duration {
        Duration::from_millis(self.queue_poll_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_workers() -> usize {
    16
}

fn default_endpoint() -> String {
    "https://texttospeech.googleapis.com/v1/text:synthesize".to_string()
}

fn default_chunk_size() -> usize {
    1024 * 1024
}

fn default_max_text_chars() -> usize {
    600
}

fn default_queue_poll_ms() -> u64 {
    1000
}

fn default_join_timeout_ms() -> u64 {
    5000
}

fn default_request_timeout_secs() -> u64 {
    60
}

/// Default voice parameters applied when a caller leaves them out
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceDefaults {
    #[serde(default = "default_language_code")]
    pub language_code: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub gender: SsmlGender,
}

impl Default for VoiceDefaults {
    fn default() -> Self {
        Self {
            language_code: default_language_code(),
            name: None,
            gender: SsmlGender::default(),
        }
    }
}

fn default_language_code() -> String {
    "en-US".to_string()
}

/// How synthesis calls authenticate against the endpoint
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Credentials {
    /// No authentication (local endpoints and tests)
    #[default]
    Anonymous,
    /// API key sent as the `key` query parameter
    ApiKey(String),
    /// Fixed OAuth access token sent as a bearer token
    BearerToken(String),
    /// Service account or authorized user key file. Access tokens are
    /// minted from it and refreshed before they expire.
    ServiceAccountFile(PathBuf),
    /// Same as `ServiceAccountFile`, with the key JSON held inline
    ServiceAccountJson(String),
    /// Application Default Credentials of the host
    ApplicationDefault,
}

impl Credentials {
    /// Resolve credentials from the process environment.
    ///
    /// An API key takes precedence over an access token, which takes
    /// precedence over a service account key file. Returns `Anonymous` when
    /// none of the variables is set.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty(API_KEY_ENV) {
            Credentials::ApiKey(key)
        } else if let Some(token) = non_empty(ACCESS_TOKEN_ENV) {
            Credentials::BearerToken(token)
        } else if let Some(path) = non_empty(SERVICE_ACCOUNT_ENV) {
            Credentials::ServiceAccountFile(PathBuf::from(path))
        } else {
            Credentials::Anonymous
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Credentials::Anonymous)
    }

    /// Whether access tokens are minted and refreshed at call time
    pub fn is_refreshing(&self) -> bool {
        matches!(
            self,
            Credentials::ServiceAccountFile(_)
                | Credentials::ServiceAccountJson(_)
                | Credentials::ApplicationDefault
        )
    }

    /// Catch unusable credentials before any call is made
    pub fn validate(&self) -> Result<()> {
        match self {
            Credentials::Anonymous | Credentials::ApplicationDefault => Ok(()),
            Credentials::ApiKey(value) | Credentials::BearerToken(value) => {
                if value.trim().is_empty() {
                    return Err(Error::Credentials("credential must not be empty".to_string()));
                }
                Ok(())
            }
            Credentials::ServiceAccountFile(path) => {
                if !path.is_file() {
                    return Err(Error::Credentials(format!(
                        "service account key file not found: {}",
                        path.display()
                    )));
                }
                Ok(())
            }
            Credentials::ServiceAccountJson(json) => {
                let value: serde_json::Value = serde_json::from_str(json).map_err(|e| {
                    Error::Credentials(format!("invalid service account JSON: {}", e))
                })?;
                if !value.is_object() {
                    return Err(Error::Credentials(
                        "service account JSON must be an object".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Anonymous => write!(f, "Anonymous"),
            Credentials::ApiKey(_) => write!(f, "ApiKey(<redacted>)"),
            Credentials::BearerToken(_) => write!(f, "BearerToken(<redacted>)"),
            Credentials::ServiceAccountFile(path) => {
                write!(f, "ServiceAccountFile({})", path.display())
            }
            Credentials::ServiceAccountJson(_) => write!(f, "ServiceAccountJson(<redacted>)"),
            Credentials::ApplicationDefault => write!(f, "ApplicationDefault"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunk_size, 1024 * 1024);
        assert_eq!(config.max_text_chars, 600);
        assert!(config.read_timeout().is_none());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = PipelineConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.workers = 2;
        config.endpoint = "ftp://example.com".to_string();
        assert!(config.validate().is_err());

        config.endpoint = "http://localhost:9000/synth".to_string();
        assert!(config.validate().is_ok());

        config.extract_rule = ExtractRule::Field(String::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_positional_extract_rule() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"extract_rule": {"between_quotes": 3}}"#).unwrap();
        assert_eq!(config.extract_rule, ExtractRule::BetweenQuotes(3));
        assert!(config.validate().is_ok());

        let config: PipelineConfig =
            serde_json::from_str(r#"{"extract_rule": {"field": "audio"}}"#).unwrap();
        assert_eq!(config.extract_rule, ExtractRule::Field("audio".to_string()));
    }

    #[test]
    fn test_credentials_lookup_order() {
        let creds = Credentials::from_lookup(|name| match name {
            API_KEY_ENV => Some("key-123".to_string()),
            ACCESS_TOKEN_ENV => Some("token".to_string()),
            _ => None,
        });
        assert_eq!(creds, Credentials::ApiKey("key-123".to_string()));

        let creds = Credentials::from_lookup(|name| match name {
            API_KEY_ENV => Some("  ".to_string()),
            ACCESS_TOKEN_ENV => Some("token".to_string()),
            _ => None,
        });
        assert_eq!(creds, Credentials::BearerToken("token".to_string()));

        let creds = Credentials::from_lookup(|name| match name {
            SERVICE_ACCOUNT_ENV => Some("/etc/blabber/key.json".to_string()),
            _ => None,
        });
        assert_eq!(
            creds,
            Credentials::ServiceAccountFile(PathBuf::from("/etc/blabber/key.json"))
        );
        assert!(creds.is_refreshing());

        assert!(Credentials::from_lookup(|_| None).is_anonymous());
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = Credentials::ApiKey("secret".to_string());
        assert!(!format!("{:?}", creds).contains("secret"));

        let creds = Credentials::ServiceAccountJson(r#"{"private_key": "secret"}"#.to_string());
        assert!(!format!("{:?}", creds).contains("secret"));
    }

    #[test]
    fn test_credentials_validation() {
        assert!(Credentials::ApplicationDefault.validate().is_ok());
        assert!(Credentials::ApiKey(" ".to_string()).validate().is_err());

        let missing = Credentials::ServiceAccountFile(PathBuf::from("/nonexistent/key.json"));
        assert!(matches!(missing.validate(), Err(Error::Credentials(_))));
        let present = Credentials::ServiceAccountFile(PathBuf::from("Cargo.toml"));
        assert!(present.validate().is_ok());

        let inline = Credentials::ServiceAccountJson(r#"{"type": "service_account"}"#.to_string());
        assert!(inline.validate().is_ok());
        assert!(Credentials::ServiceAccountJson("[1, 2]".to_string()).validate().is_err());
        assert!(Credentials::ServiceAccountJson("not json".to_string()).validate().is_err());

        let config = PipelineConfig {
            credentials: missing,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_refreshing_credentials() {
        let config: PipelineConfig = serde_json::from_str(
            r#"{"credentials": {"service_account_file": "/keys/tts.json"}}"#,
        )
        .unwrap();
        assert_eq!(
            config.credentials,
            Credentials::ServiceAccountFile(PathBuf::from("/keys/tts.json"))
        );

        let config: PipelineConfig =
            serde_json::from_str(r#"{"credentials": "application_default"}"#).unwrap();
        assert_eq!(config.credentials, Credentials::ApplicationDefault);
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"workers": 4, "credentials": {"api_key": "abc"}}"#).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.extract_rule, ExtractRule::Field("audioContent".to_string()));
        assert_eq!(config.credentials, Credentials::ApiKey("abc".to_string()));
    }
}
