//! OAuth2 refresh-token session for the Netatmo API.
//!
//! The access token is refreshed lazily: whoever asks for headers after the
//! token expired (or is about to) pays for the refresh. Every successful
//! refresh is persisted before it is used, since Netatmo rotates refresh
//! tokens on use.

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::StatusCode;
use serde::Deserialize;
use std::fmt;

use crate::config::ClientCredentials;
use crate::credentials::{CredentialStore, Credentials};
use crate::error::{ExporterError, Result};

/// Refresh this many seconds before the recorded expiry.
pub const EXPIRY_MARGIN_SECS: f64 = 60.0;

const REDACTED: &str = "<redacted>";

const USER_AGENT_VALUE: &str = concat!("netatmo-exporter/", env!("CARGO_PKG_VERSION"));

/// Success body of the token endpoint.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<f64>,
}

/// Current wall clock in fractional Unix seconds.
pub fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Owns the refresh token and the cached access token.
pub struct TokenAuthenticator {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    refresh_token: String,
    access_token: Option<String>,
    expires_at: Option<f64>,
    store: CredentialStore,
}

impl fmt::Debug for TokenAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenAuthenticator")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &REDACTED)
            .field("refresh_token", &REDACTED)
            .field("access_token", &self.access_token.as_ref().map(|_| REDACTED))
            .field("expires_at", &self.expires_at)
            .field("store", &self.store)
            .finish()
    }
}

impl TokenAuthenticator {
    /// Build the authenticator, seeding its state from the token file.
    ///
    /// A refresh token found in the file wins over the configured one, which
    /// only matters for the very first run.
    pub fn new(
        http: reqwest::Client,
        token_url: impl Into<String>,
        credentials: ClientCredentials,
        store: CredentialStore,
    ) -> Self {
        let stored = store.load();
        if stored.is_empty() {
            log::info!(
                "No stored session in {}, starting from the configured refresh token",
                store.path().display()
            );
        }
        let refresh_token = stored
            .refresh_token
            .filter(|t| !t.is_empty())
            .unwrap_or(credentials.refresh_token);

        Self {
            http,
            token_url: token_url.into(),
            client_id: credentials.client_id,
            client_secret: credentials.client_secret,
            refresh_token,
            access_token: stored.access_token.filter(|t| !t.is_empty()),
            expires_at: stored.expires_at,
            store,
        }
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }

    pub fn expires_at(&self) -> Option<f64> {
        self.expires_at
    }

    /// Whether headers requested at `now` require a refresh first.
    pub fn needs_refresh(&self, now: f64) -> bool {
        if self.access_token.is_none() {
            return true;
        }
        match self.expires_at {
            Some(expires_at) => {
                log::debug!("Time until token expiration: {:.0} seconds", expires_at - now);
                now >= expires_at - EXPIRY_MARGIN_SECS
            }
            None => false,
        }
    }

    /// Forget the cached access token so the next header request refreshes.
    pub fn invalidate(&mut self) {
        if self.access_token.take().is_some() {
            log::debug!("Cached access token invalidated");
        }
    }

    /// Return request headers for a valid session, refreshing first if needed.
    pub async fn ensure_valid_headers(&mut self) -> Result<HeaderMap> {
        if self.needs_refresh(now_secs()) {
            self.refresh().await?;
        }
        let token = self
            .access_token
            .as_deref()
            .ok_or_else(|| ExporterError::Auth("no access token after refresh".to_string()))?;
        bearer_headers(token)
    }

    /// Exchange the refresh token for a new access token and persist the result.
    pub async fn refresh(&mut self) -> Result<()> {
        log::debug!("Refreshing Netatmo access token...");

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", self.refresh_token.as_str()),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        let response = self
            .http
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| ExporterError::Auth(format!("Failed to refresh token: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ExporterError::Auth(format!("Failed to refresh token: {}", e)))?;

        if status == StatusCode::BAD_REQUEST {
            if is_invalid_grant(&body) {
                return Err(ExporterError::TokenExpired {
                    token_file: self.store.path().display().to_string(),
                });
            }
            return Err(ExporterError::Auth(format!(
                "Failed to refresh token: {}",
                body
            )));
        }
        if !status.is_success() {
            return Err(ExporterError::Auth(format!(
                "Failed to refresh token (status {}): {}",
                status.as_u16(),
                body
            )));
        }

        let token: TokenResponse = serde_json::from_str(&body).map_err(|e| {
            ExporterError::Auth(format!("Malformed token response: {}", e))
        })?;
        let access_token = token
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                ExporterError::Auth("Token response carries no access_token".to_string())
            })?;

        self.access_token = Some(access_token);
        self.expires_at = token.expires_in.map(|secs| now_secs() + secs);
        if let Some(new_refresh) = token.refresh_token.filter(|t| !t.is_empty()) {
            if new_refresh != self.refresh_token {
                log::info!("Refresh token updated");
                self.refresh_token = new_refresh;
            }
        }

        self.store.save(&self.credentials())?;
        log::debug!("Access token refreshed");
        Ok(())
    }

    /// Snapshot of the session in token-file form.
    pub fn credentials(&self) -> Credentials {
        Credentials {
            access_token: self.access_token.clone(),
            refresh_token: Some(self.refresh_token.clone()),
            expires_at: self.expires_at,
        }
    }
}

fn is_invalid_grant(body: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.as_str())
                .map(|e| e == "invalid_grant")
        })
        .unwrap_or(false)
}

fn bearer_headers(token: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| ExporterError::Auth(format!("access token is not a valid header: {}", e)))?;
    headers.insert(AUTHORIZATION, bearer);
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
    Ok(headers)
}
