//! OAuth2 authentication and token management for Google APIs.
//!
//! Drive and Cloud Storage share one consent flow; only the requested scope
//! differs.

use chrono::{DateTime, Duration, Utc};
use oauth2::basic::{BasicClient, BasicTokenResponse};
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet, EndpointSet,
    RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use snapmatch_common::{Error, Result};

/// OAuth2 authorization endpoint.
const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
/// OAuth2 token endpoint.
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
/// Redirect URL for the installed-app flow.
const REDIRECT_URL: &str = "http://localhost:8080/callback";

/// Environment fallbacks for the OAuth client registration.
pub const CLIENT_ID_ENV: &str = "SNAPMATCH_GOOGLE_CLIENT_ID";
pub const CLIENT_SECRET_ENV: &str = "SNAPMATCH_GOOGLE_CLIENT_SECRET";

/// Scope for files created by this application in Drive.
pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive.file";
/// Scope for reading and writing Cloud Storage objects.
pub const STORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME: std::time::Duration = std::time::Duration::from_secs(3600);

type GoogleClient = BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// OAuth2 tokens with expiration tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Tokens {
    /// Expired, or within five minutes of expiring.
    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now() + Duration::minutes(5)
    }

    fn from_response(response: &BasicTokenResponse, previous_refresh: Option<&str>) -> Result<Self> {
        let refresh_token = match (response.refresh_token(), previous_refresh) {
            (Some(token), _) => token.secret().clone(),
            (None, Some(previous)) => previous.to_string(),
            (None, None) => {
                return Err(Error::Authentication(
                    "No refresh token received. Ensure 'offline' access and 'consent' prompt were requested."
                        .to_string(),
                ))
            }
        };

        let expires_in = response.expires_in().unwrap_or(DEFAULT_TOKEN_LIFETIME);
        let expires_at =
            Utc::now() + Duration::from_std(expires_in).unwrap_or_else(|_| Duration::hours(1));

        Ok(Self {
            access_token: response.access_token().secret().clone(),
            refresh_token,
            expires_at,
        })
    }
}

/// OAuth2 client registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_redirect_url")]
    pub redirect_url: String,
}

fn default_redirect_url() -> String {
    REDIRECT_URL.to_string()
}

impl AuthConfig {
    /// Read the client registration from the environment.
    ///
    /// # Errors
    /// - `Configuration` if either variable is unset
    pub fn from_env() -> Result<Self> {
        let read = |key: &str| {
            std::env::var(key).map_err(|_| {
                Error::Configuration(format!(
                    "No auth_config given and {} is not set",
                    key
                ))
            })
        };

        Ok(Self {
            client_id: read(CLIENT_ID_ENV)?,
            client_secret: read(CLIENT_SECRET_ENV)?,
            redirect_url: default_redirect_url(),
        })
    }

    /// Use `config` when present, the environment otherwise.
    pub fn resolve(config: Option<AuthConfig>) -> Result<Self> {
        match config {
            Some(config) => Ok(config),
            None => Self::from_env(),
        }
    }
}

/// OAuth2 authentication manager for Google APIs.
pub struct AuthManager {
    client: GoogleClient,
    http: oauth2::reqwest::Client,
    config: AuthConfig,
}

impl AuthManager {
    /// Create a new authentication manager.
    ///
    /// # Errors
    /// - `Configuration` if a URL in `config` is malformed
    pub fn new(config: AuthConfig) -> Result<Self> {
        let client = BasicClient::new(ClientId::new(config.client_id.clone()))
            .set_client_secret(ClientSecret::new(config.client_secret.clone()))
            .set_auth_uri(
                AuthUrl::new(GOOGLE_AUTH_URL.to_string())
                    .map_err(|e| Error::Configuration(format!("Invalid auth URL: {}", e)))?,
            )
            .set_token_uri(
                TokenUrl::new(GOOGLE_TOKEN_URL.to_string())
                    .map_err(|e| Error::Configuration(format!("Invalid token URL: {}", e)))?,
            )
            .set_redirect_uri(
                RedirectUrl::new(config.redirect_url.clone())
                    .map_err(|e| Error::Configuration(format!("Invalid redirect URL: {}", e)))?,
            );

        // The token endpoint must not redirect.
        let http = oauth2::reqwest::ClientBuilder::new()
            .redirect(oauth2::reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to build OAuth HTTP client: {}", e)))?;

        Ok(Self { client, http, config })
    }

    /// Generate the authorization URL for the user to visit.
    ///
    /// Returns the URL and a CSRF token that should be verified on callback.
    pub fn authorization_url(&self, scope: &str) -> (String, String) {
        let (auth_url, csrf_token) = self
            .client
            .authorize_url(CsrfToken::new_random)
            .add_scope(Scope::new(scope.to_string()))
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "consent")
            .url();

        (auth_url.to_string(), csrf_token.secret().clone())
    }

    /// Exchange an authorization code for tokens.
    ///
    /// # Errors
    /// - `Authentication` if the code is rejected or no refresh token is issued
    pub async fn exchange_code(&self, code: &str) -> Result<Tokens> {
        let response = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(&self.http)
            .await
            .map_err(|e| Error::Authentication(format!("Token exchange failed: {}", e)))?;

        Tokens::from_response(&response, None)
    }

    /// Obtain a fresh access token.
    ///
    /// Google usually omits the refresh token from refresh responses, in which
    /// case the one passed in is kept.
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<Tokens> {
        let response = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(&self.http)
            .await
            .map_err(|e| Error::Authentication(format!("Token refresh failed: {}", e)))?;

        Tokens::from_response(&response, Some(refresh_token))
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }
}

/// Hands out access tokens, refreshing them when they are about to expire.
pub struct TokenManager {
    auth_manager: AuthManager,
    tokens: RwLock<Tokens>,
}

impl TokenManager {
    pub fn new(auth_manager: AuthManager, tokens: Tokens) -> Self {
        Self {
            auth_manager,
            tokens: RwLock::new(tokens),
        }
    }

    /// Get a valid access token, refreshing if necessary.
    ///
    /// # Errors
    /// - `Authentication` if the refresh token was revoked
    pub async fn access_token(&self) -> Result<String> {
        {
            let tokens = self.tokens.read().await;
            if !tokens.is_expired() {
                return Ok(tokens.access_token.clone());
            }
        }

        let mut tokens = self.tokens.write().await;

        // Another caller may have refreshed while we waited for the lock.
        if !tokens.is_expired() {
            return Ok(tokens.access_token.clone());
        }

        info!("Refreshing expired access token");
        *tokens = self.auth_manager.refresh_token(&tokens.refresh_token).await?;

        Ok(tokens.access_token.clone())
    }

    /// Force a refresh on the next call, e.g. after the API answered 401.
    pub async fn invalidate(&self) {
        self.tokens.write().await.expires_at = Utc::now() - Duration::seconds(1);
    }

    /// Current tokens, for persisting after a refresh.
    pub async fn tokens(&self) -> Tokens {
        self.tokens.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AuthConfig {
        AuthConfig {
            client_id: "test_id".to_string(),
            client_secret: "test_secret".to_string(),
            redirect_url: REDIRECT_URL.to_string(),
        }
    }

    fn tokens_expiring_in(delta: Duration) -> Tokens {
        Tokens {
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            expires_at: Utc::now() + delta,
        }
    }

    #[test]
    fn test_tokens_expiration() {
        assert!(tokens_expiring_in(Duration::hours(-1)).is_expired());
        assert!(!tokens_expiring_in(Duration::hours(1)).is_expired());
        // Inside the five minute margin
        assert!(tokens_expiring_in(Duration::minutes(4)).is_expired());
    }

    #[test]
    fn test_auth_config_redirect_defaults() {
        let config: AuthConfig =
            serde_json::from_str(r#"{"client_id":"a","client_secret":"b"}"#).unwrap();
        assert_eq!(config.redirect_url, REDIRECT_URL);
    }

    #[test]
    fn test_resolve_prefers_explicit_config() {
        let config = AuthConfig::resolve(Some(test_config())).unwrap();
        assert_eq!(config.client_id, "test_id");
    }

    #[test]
    fn test_authorization_url_requests_offline_access() {
        let manager = AuthManager::new(test_config()).unwrap();
        let (url, csrf_token) = manager.authorization_url(STORAGE_SCOPE);

        assert!(url.contains("accounts.google.com"));
        assert!(url.contains("client_id=test_id"));
        assert!(url.contains("devstorage.read_write"));
        assert!(url.contains("access_type=offline"));
        assert!(!csrf_token.is_empty());
    }

    #[test]
    fn test_invalid_redirect_is_configuration_error() {
        let mut config = test_config();
        config.redirect_url = "not a url".to_string();
        assert!(matches!(
            AuthManager::new(config),
            Err(Error::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_valid_token_is_served_without_refresh() {
        let manager = TokenManager::new(
            AuthManager::new(test_config()).unwrap(),
            tokens_expiring_in(Duration::hours(1)),
        );
        assert_eq!(manager.access_token().await.unwrap(), "access");

        manager.invalidate().await;
        assert!(manager.tokens().await.is_expired());
    }
}
