// =============================================================================
// GOOGLE OAUTH2 CLIENT (AUTHORIZATION-CODE FLOW)
// =============================================================================
//
// Handles the credential and token files plus the token-endpoint exchanges
// needed to call the Apps Script and Cloud Logging APIs as a user.
//
// **Files:**
// - `credentials.json` - the OAuth client downloaded from Google Cloud
//   Console ("Desktop application" type). Both the `installed` and `web`
//   shapes are accepted.
// - `token.json` - the access/refresh token pair written after the user
//   authorizes. Its appearance doubles as the completion marker the
//   `auth wait` command watches for.
//
// **Flow:**
// 1. `auth url` prints the consent URL (offline access so we get a refresh
//    token).
// 2. The user authorizes in a browser and copies the authorization code.
// 3. `auth exchange <code>` posts the code to the token endpoint and saves
//    `token.json`.
// 4. API clients call `access_token()`, which refreshes transparently when
//    the stored token is near expiry.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("credentials file error: {0}")]
    Credentials(String),
    #[error("token file error: {0}")]
    TokenStore(String),
    #[error("token endpoint error: {0}")]
    Exchange(String),
    #[error("not authorized: {0}")]
    NotAuthorized(String),
}

// =============================================================================
// CREDENTIALS FILE
// =============================================================================

/// One OAuth client entry from `credentials.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

fn default_auth_uri() -> String {
    "https://accounts.google.com/o/oauth2/auth".to_string()
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

impl OAuthClientConfig {
    /// The redirect used by the manual copy-the-code flow.
    pub fn redirect_uri(&self) -> &str {
        self.redirect_uris
            .first()
            .map(String::as_str)
            .unwrap_or("urn:ietf:wg:oauth:2.0:oob")
    }

    /// Reject obviously broken configs before any network call happens.
    pub fn validate(&self) -> Result<(), AuthError> {
        if self.client_id.is_empty() || self.client_secret.is_empty() {
            return Err(AuthError::Credentials(
                "client_id and client_secret are required".to_string(),
            ));
        }
        if self.client_id.contains("YOUR_CLIENT_ID")
            || self.client_secret.contains("YOUR_CLIENT_SECRET")
        {
            return Err(AuthError::Credentials(
                "credentials file still contains template values".to_string(),
            ));
        }
        Ok(())
    }
}

/// The file as downloaded from the console: one of two top-level keys
/// depending on the client type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed: Option<OAuthClientConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web: Option<OAuthClientConfig>,
}

impl Credentials {
    pub async fn load(path: &Path) -> Result<Self, AuthError> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            AuthError::Credentials(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self, AuthError> {
        let credentials: Credentials = serde_json::from_str(json)
            .map_err(|e| AuthError::Credentials(format!("invalid JSON: {e}")))?;
        if credentials.installed.is_none() && credentials.web.is_none() {
            return Err(AuthError::Credentials(
                "expected an 'installed' or 'web' client entry".to_string(),
            ));
        }
        Ok(credentials)
    }

    pub fn client(&self) -> &OAuthClientConfig {
        self.installed
            .as_ref()
            .or(self.web.as_ref())
            .expect("constructor guarantees one entry")
    }

    /// Write a placeholder file a user can fill in with their real client.
    pub async fn write_template(path: &Path) -> Result<(), AuthError> {
        let template = Credentials {
            installed: Some(OAuthClientConfig {
                client_id: "YOUR_CLIENT_ID.apps.googleusercontent.com".to_string(),
                client_secret: "YOUR_CLIENT_SECRET".to_string(),
                project_id: Some("your-project-id".to_string()),
                auth_uri: default_auth_uri(),
                token_uri: default_token_uri(),
                redirect_uris: vec!["http://localhost".to_string()],
            }),
            web: None,
        };
        let json = serde_json::to_string_pretty(&template)
            .map_err(|e| AuthError::Credentials(e.to_string()))?;
        tokio::fs::write(path, json).await.map_err(|e| {
            AuthError::Credentials(format!("failed to write {}: {e}", path.display()))
        })
    }
}

// =============================================================================
// TOKEN FILE
// =============================================================================

/// Persisted token pair. Field names follow what the Google client
/// libraries write, so existing `token.json` files keep working.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    /// Expiry as Unix milliseconds, matching the googleapis format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<i64>,
}

impl StoredToken {
    /// Whether the access token is still usable, with a one minute margin
    /// so a request doesn't start with a token about to lapse.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.expiry_date {
            Some(expiry_ms) => expiry_ms > (now + Duration::seconds(60)).timestamp_millis(),
            // No recorded expiry: assume stale and refresh.
            None => false,
        }
    }

    pub async fn load(path: &Path) -> Result<Self, AuthError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AuthError::TokenStore(format!("failed to read {}: {e}", path.display())))?;
        serde_json::from_str(&content)
            .map_err(|e| AuthError::TokenStore(format!("invalid token file: {e}")))
    }

    pub async fn save(&self, path: &Path) -> Result<(), AuthError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| AuthError::TokenStore(e.to_string()))?;
        tokio::fs::write(path, json)
            .await
            .map_err(|e| AuthError::TokenStore(format!("failed to write {}: {e}", path.display())))
    }
}

// =============================================================================
// TOKEN ENDPOINT
// =============================================================================

/// Response from Google's token endpoint.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
}

impl TokenResponse {
    fn into_stored(self, previous_refresh: Option<String>) -> StoredToken {
        let expiry_date = (Utc::now() + Duration::seconds(self.expires_in)).timestamp_millis();
        StoredToken {
            access_token: self.access_token,
            // Refresh grants omit the refresh token; keep the one we had.
            refresh_token: self.refresh_token.or(previous_refresh),
            scope: self.scope,
            token_type: self.token_type,
            expiry_date: Some(expiry_date),
        }
    }
}

/// Authenticator for the authorization-code flow with on-disk persistence
/// and an in-memory cache of the current token.
pub struct GoogleAuthClient {
    config: OAuthClientConfig,
    token_path: PathBuf,
    http: Client,
    cached: RwLock<Option<StoredToken>>,
}

impl GoogleAuthClient {
    pub fn new(config: OAuthClientConfig, token_path: impl Into<PathBuf>) -> Result<Self, AuthError> {
        config.validate()?;
        Ok(Self {
            config,
            token_path: token_path.into(),
            http: Client::new(),
            cached: RwLock::new(None),
        })
    }

    pub fn token_path(&self) -> &Path {
        &self.token_path
    }

    /// Build the consent URL the user opens in a browser. Offline access
    /// with a forced consent prompt so a refresh token is always issued.
    pub fn auth_url(&self, scopes: &[&str]) -> Result<String, AuthError> {
        let url = reqwest::Url::parse_with_params(
            &self.config.auth_uri,
            &[
                ("client_id", self.config.client_id.as_str()),
                ("redirect_uri", self.config.redirect_uri()),
                ("response_type", "code"),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("scope", scopes.join(" ").as_str()),
            ],
        )
        .map_err(|e| AuthError::Credentials(format!("invalid auth_uri: {e}")))?;
        Ok(url.into())
    }

    /// Exchange an authorization code for tokens and persist them.
    pub async fn exchange_code(&self, code: &str) -> Result<StoredToken, AuthError> {
        let response = self
            .http
            .post(&self.config.token_uri)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code.trim()),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("redirect_uri", self.config.redirect_uri()),
            ])
            .send()
            .await
            .map_err(|e| AuthError::Exchange(e.to_string()))?;

        let token = self.parse_token_response(response).await?.into_stored(None);
        token.save(&self.token_path).await?;
        *self.cached.write().await = Some(token.clone());
        tracing::info!("tokens saved to {}", self.token_path.display());
        Ok(token)
    }

    /// Get a valid bearer token, loading from disk and refreshing as needed.
    pub async fn access_token(&self) -> Result<String, AuthError> {
        {
            let cached = self.cached.read().await;
            if let Some(token) = cached.as_ref() {
                if token.is_fresh(Utc::now()) {
                    return Ok(token.access_token.clone());
                }
            }
        }

        let stored = match {
            let cached = self.cached.read().await;
            cached.clone()
        } {
            Some(token) => token,
            None => StoredToken::load(&self.token_path).await.map_err(|_| {
                AuthError::NotAuthorized(format!(
                    "no token at {}; run the auth flow first",
                    self.token_path.display()
                ))
            })?,
        };

        if stored.is_fresh(Utc::now()) {
            let access = stored.access_token.clone();
            *self.cached.write().await = Some(stored);
            return Ok(access);
        }

        let refreshed = self.refresh(&stored).await?;
        let access = refreshed.access_token.clone();
        refreshed.save(&self.token_path).await?;
        *self.cached.write().await = Some(refreshed);
        Ok(access)
    }

    async fn refresh(&self, stored: &StoredToken) -> Result<StoredToken, AuthError> {
        let refresh_token = stored.refresh_token.as_deref().ok_or_else(|| {
            AuthError::NotAuthorized(
                "stored token expired and has no refresh token; re-run the auth flow".to_string(),
            )
        })?;

        tracing::debug!("access token expired, refreshing");
        let response = self
            .http
            .post(&self.config.token_uri)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| AuthError::Exchange(e.to_string()))?;

        Ok(self
            .parse_token_response(response)
            .await?
            .into_stored(stored.refresh_token.clone()))
    }

    async fn parse_token_response(
        &self,
        response: reqwest::Response,
    ) -> Result<TokenResponse, AuthError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // 400/401 from the token endpoint means the grant itself is bad,
            // not a flaky network.
            if status.as_u16() == 400 || status.as_u16() == 401 {
                return Err(AuthError::NotAuthorized(format!(
                    "token endpoint rejected the request ({status}): {body}"
                )));
            }
            return Err(AuthError::Exchange(format!(
                "token endpoint error ({status}): {body}"
            )));
        }
        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| AuthError::Exchange(format!("invalid token response: {e}")))
    }
}
