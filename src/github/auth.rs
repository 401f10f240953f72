//! GitHub App authentication: App JWTs and installation access tokens.
//!
//! The bridge authenticates as a GitHub App. Repository operations and the
//! agent's `GH_TOKEN` both use short-lived installation access tokens minted
//! from an RS256-signed App JWT. Tokens are cached until shortly before
//! expiry and are never persisted.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{AppError, Result};

/// App JWT lifetime: 9 minutes, inside GitHub's 10-minute maximum.
const JWT_LIFETIME: Duration = Duration::from_secs(9 * 60);
/// Cached installation tokens are discarded this long before they expire.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(120);

/// Vendor of short-lived repository access tokens.
///
/// Implemented by [`GithubAppAuth`] for real installations and by
/// [`StaticTokenProvider`] for environments that supply a pre-minted token.
pub trait TokenProvider: Send + Sync {
    /// Return a currently-valid access token.
    fn installation_token(&self) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>>;
}

/// JWT claims for GitHub App authentication.
#[derive(Debug, Serialize)]
struct Claims {
    /// Issued-at, backdated 60 s against clock skew.
    iat: u64,
    /// Expiry, at most 10 minutes after `iat`.
    exp: u64,
    /// Issuer: the App id.
    iss: String,
}

/// Generate a signed App JWT for `app_id`.
///
/// # Errors
///
/// Returns `AppError::Auth` when the private key is not valid RSA PEM or
/// signing fails.
pub fn generate_app_jwt(app_id: &str, private_key_pem: &str) -> Result<String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|err| AppError::Auth(format!("system time error: {err}")))?
        .as_secs();

    let claims = Claims {
        iat: now.saturating_sub(60),
        exp: now + JWT_LIFETIME.as_secs(),
        iss: app_id.to_owned(),
    };

    let key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
        .map_err(|err| AppError::Auth(format!("invalid app private key: {err}")))?;

    encode(&Header::new(Algorithm::RS256), &claims, &key)
        .map_err(|err| AppError::Auth(format!("failed to sign app jwt: {err}")))
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// GitHub App installation token vendor with caching.
pub struct GithubAppAuth {
    app_id: String,
    private_key: String,
    installation_id: u64,
    api_base: String,
    http: reqwest::Client,
    cache: Mutex<Option<CachedToken>>,
}

impl GithubAppAuth {
    /// Create a vendor for one App installation.
    #[must_use]
    pub fn new(app_id: String, private_key: String, installation_id: u64) -> Self {
        Self {
            app_id,
            private_key,
            installation_id,
            api_base: "https://api.github.com".into(),
            http: reqwest::Client::new(),
            cache: Mutex::new(None),
        }
    }

    /// Override the API base URL (test seam).
    #[must_use]
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    async fn fetch_token(&self) -> Result<String> {
        let mut cache = self.cache.lock().await;

        if let Some(cached) = cache.as_ref() {
            let margin = chrono::TimeDelta::seconds(TOKEN_EXPIRY_MARGIN.as_secs() as i64);
            if Utc::now() + margin < cached.expires_at {
                return Ok(cached.token.clone());
            }
        }

        let jwt = generate_app_jwt(&self.app_id, &self.private_key)?;
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_base, self.installation_id
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(jwt)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "acp-bridge")
            .send()
            .await
            .map_err(|err| AppError::Auth(format!("token exchange request failed: {err}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Auth(format!(
                "token exchange returned {status}: {body}"
            )));
        }

        let parsed: InstallationTokenResponse = response
            .json()
            .await
            .map_err(|err| AppError::Auth(format!("bad token exchange response: {err}")))?;

        debug!(
            installation_id = self.installation_id,
            expires_at = %parsed.expires_at,
            "minted installation access token"
        );

        *cache = Some(CachedToken {
            token: parsed.token.clone(),
            expires_at: parsed.expires_at,
        });
        Ok(parsed.token)
    }
}

impl TokenProvider for GithubAppAuth {
    fn installation_token(&self) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>> {
        Box::pin(self.fetch_token())
    }
}

/// Token vendor that hands out one fixed token (tests, personal-access-token
/// deployments).
pub struct StaticTokenProvider(String);

impl StaticTokenProvider {
    /// Wrap a pre-minted token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl TokenProvider for StaticTokenProvider {
    fn installation_token(&self) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>> {
        let token = self.0.clone();
        Box::pin(async move {
            if token.is_empty() {
                Err(AppError::Auth("no access token configured".into()))
            } else {
                Ok(token)
            }
        })
    }
}
