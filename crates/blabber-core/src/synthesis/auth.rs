//! Access tokens for synthesis calls.
//!
//! Synthesis runs on plain worker threads, while `google-cloud-auth` is
//! async. [`GoogleTokenSource`] owns a small runtime that drives token
//! minting and background refresh, and worker threads block on it for the
//! current token before each call.

use google_cloud_auth::credentials::{
    service_account, user_account, Builder as CredentialsBuilder, CacheableResource,
    Credentials as GoogleCredentials,
};
use http::Extensions;
use std::fmt;
use tokio::runtime::{Builder as RuntimeBuilder, Runtime};
use tracing::{debug, error};

use crate::config::Credentials;
use crate::error::{Error, Result};

/// OAuth scope the synthesize endpoint requires
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Hands out a currently valid access token for each synthesis call
pub trait TokenSource: Send + Sync {
    /// Blocks while a token is minted or refreshed.
    ///
    /// Must not be called from inside an async runtime.
    fn token(&self) -> Result<String>;
}

/// Token that never changes
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl TokenSource for StaticToken {
    fn token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Refreshing tokens from a service account, an authorized user or the
/// host's Application Default Credentials
pub struct GoogleTokenSource {
    credentials: GoogleCredentials,
    runtime: Runtime,
}

impl fmt::Debug for GoogleTokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GoogleTokenSource")
            .field("credentials", &"<credentials>")
            .finish()
    }
}

impl GoogleTokenSource {
    /// Load credentials for `scopes`.
    ///
    /// Fails for credential kinds that carry no refreshable identity. Must
    /// not be called from inside an async runtime, and the source must not
    /// be dropped inside one either.
    pub fn new(source: &Credentials, scopes: &[&str]) -> Result<Self> {
        source.validate()?;

        let runtime = RuntimeBuilder::new_multi_thread()
            .worker_threads(1)
            .thread_name("blabber-auth")
            .enable_all()
            .build()?;
        let scopes: Vec<String> = scopes.iter().map(|s| s.to_string()).collect();

        // Token caches spawn their refresh task on the current runtime
        let entered = runtime.enter();
        let credentials = match source {
            Credentials::ApplicationDefault => CredentialsBuilder::default()
                .with_scopes(scopes)
                .build()
                .map_err(|e| {
                    error!("Failed to initialize Application Default Credentials: {}", e);
                    Error::Credentials(format!(
                        "failed to initialize Application Default Credentials: {}",
                        e
                    ))
                })?,
            Credentials::ServiceAccountFile(path) => {
                let json = std::fs::read_to_string(path).map_err(|e| {
                    Error::Credentials(format!(
                        "failed to read key file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                from_key_json(&json, scopes)?
            }
            Credentials::ServiceAccountJson(json) => from_key_json(json, scopes)?,
            other => {
                return Err(Error::Credentials(format!(
                    "{:?} credentials do not mint access tokens",
                    other
                )))
            }
        };
        drop(entered);

        debug!("Initialized refreshing credentials ({:?})", source);
        Ok(Self {
            credentials,
            runtime,
        })
    }
}

impl TokenSource for GoogleTokenSource {
    fn token(&self) -> Result<String> {
        let headers = self
            .runtime
            .block_on(self.credentials.headers(Extensions::new()))
            .map_err(|e| {
                error!("Failed to fetch access token: {}", e);
                Error::Credentials(format!("failed to fetch access token: {}", e))
            })?;

        let headers = match headers {
            CacheableResource::New { data, .. } => data,
            CacheableResource::NotModified => {
                return Err(Error::Credentials(
                    "credentials answered NotModified without a cached token".to_string(),
                ))
            }
        };
        bearer_token(&headers)
    }
}

/// Build credentials from a key file's JSON, by its `type` field
fn from_key_json(json: &str, scopes: Vec<String>) -> Result<GoogleCredentials> {
    let key: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| Error::Credentials(format!("invalid key JSON: {}", e)))?;
    let kind = key
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    match kind.as_str() {
        "service_account" => service_account::Builder::new(key)
            .with_access_specifier(service_account::AccessSpecifier::from_scopes(scopes))
            .build()
            .map_err(|e| {
                Error::Credentials(format!("failed to load service account key: {}", e))
            }),
        "authorized_user" => user_account::Builder::new(key)
            .with_scopes(scopes)
            .build()
            .map_err(|e| {
                Error::Credentials(format!("failed to load authorized user key: {}", e))
            }),
        other => Err(Error::Credentials(format!(
            "unsupported credential type '{}', expected 'service_account' or 'authorized_user'",
            other
        ))),
    }
}

/// Token part of an `Authorization: Bearer ...` header
fn bearer_token(headers: &http::HeaderMap) -> Result<String> {
    let value = headers
        .get(http::header::AUTHORIZATION)
        .ok_or_else(|| Error::Credentials("no Authorization header from credentials".to_string()))?;
    let value = value
        .to_str()
        .map_err(|e| Error::Credentials(format!("invalid Authorization header: {}", e)))?;
    value
        .strip_prefix("Bearer ")
        .map(str::to_string)
        .ok_or_else(|| Error::Credentials("Authorization header is not a bearer token".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, HeaderValue};
    use std::path::PathBuf;

    #[test]
    fn test_static_token() {
        assert_eq!(StaticToken::new("abc").token().unwrap(), "abc");
    }

    #[test]
    fn test_bearer_token_from_headers() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_err());

        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer ya29.token"),
        );
        assert_eq!(bearer_token(&headers).unwrap(), "ya29.token");

        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Basic dXNlcg=="),
        );
        assert!(matches!(bearer_token(&headers), Err(Error::Credentials(_))));
    }

    #[test]
    fn test_unsupported_key_type_is_rejected() {
        let source = Credentials::ServiceAccountJson(r#"{"type": "external_account"}"#.to_string());
        let result = GoogleTokenSource::new(&source, &[CLOUD_PLATFORM_SCOPE]);
        match result {
            Err(Error::Credentials(message)) => assert!(message.contains("external_account")),
            other => panic!("expected a credentials error, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_key_file_is_rejected() {
        let source = Credentials::ServiceAccountFile(PathBuf::from("/nonexistent/key.json"));
        assert!(matches!(
            GoogleTokenSource::new(&source, &[CLOUD_PLATFORM_SCOPE]),
            Err(Error::Credentials(_))
        ));
    }

    #[test]
    fn test_static_credentials_mint_no_tokens() {
        let source = Credentials::ApiKey("key".to_string());
        assert!(matches!(
            GoogleTokenSource::new(&source, &[CLOUD_PLATFORM_SCOPE]),
            Err(Error::Credentials(_))
        ));
    }
}
