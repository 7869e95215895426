//! OAuth2 bearer tokens for the Google REST APIs (Pub/Sub, BigQuery).
//!
//! A token is taken from `GOOGLE_OAUTH_ACCESS_TOKEN` when set, otherwise it
//! is requested from the GCE/GKE metadata server and cached until shortly
//! before it expires.

use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

pub const ACCESS_TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("token request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("metadata server responded with {0}")]
    Status(u16),
}

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

enum Kind {
    Fixed(String),
    Metadata { url: String },
}

pub struct TokenSource {
    http: reqwest::Client,
    kind: Kind,
    cached: Mutex<Option<(String, Instant)>>,
}

impl TokenSource {
    pub fn from_env(http: reqwest::Client) -> Self {
        match std::env::var(ACCESS_TOKEN_ENV) {
            Ok(token) if !token.is_empty() => {
                info!("Using access token from {}", ACCESS_TOKEN_ENV);
                Self::fixed(http, token)
            }
            _ => Self::metadata(http, METADATA_TOKEN_URL),
        }
    }

    pub fn fixed(http: reqwest::Client, token: impl Into<String>) -> Self {
        Self {
            http,
            kind: Kind::Fixed(token.into()),
            cached: Mutex::new(None),
        }
    }

    pub fn metadata(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            kind: Kind::Metadata { url: url.into() },
            cached: Mutex::new(None),
        }
    }

    pub async fn token(&self) -> Result<String, AuthError> {
        let url = match &self.kind {
            Kind::Fixed(token) => return Ok(token.clone()),
            Kind::Metadata { url } => url,
        };
        let mut cached = self.cached.lock().await;
        if let Some((token, expires_at)) = cached.as_ref() {
            if Instant::now() + REFRESH_MARGIN < *expires_at {
                return Ok(token.clone());
            }
        }
        debug!("Requesting access token from metadata server");
        let response = self
            .http
            .get(url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AuthError::Status(response.status().as_u16()));
        }
        let fresh: MetadataToken = response.json().await?;
        let expires_at = Instant::now() + Duration::from_secs(fresh.expires_in);
        *cached = Some((fresh.access_token.clone(), expires_at));
        Ok(fresh.access_token)
    }
}
