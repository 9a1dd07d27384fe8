//! Pieces shared by the Google-backed providers.

pub mod auth;

pub use auth::{AuthConfig, AuthManager, TokenManager, Tokens, DRIVE_SCOPE, STORAGE_SCOPE};

use reqwest::{Client, Response, StatusCode};
use std::time::Duration;

use snapmatch_common::{Error, Result};

/// Upper bound for a single API request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Build the HTTP client used for API calls.
pub(crate) fn http_client() -> Result<Client> {
    Client::builder()
        .user_agent(concat!("SnapMatch/", env!("CARGO_PKG_VERSION")))
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| Error::Configuration(format!("Failed to create HTTP client: {}", e)))
}

/// Turn a non-success response into the matching error kind.
///
/// Google reports quota exhaustion either as 429 or as 403 with a
/// `rateLimitExceeded` reason in the body.
pub(crate) async fn check_response(response: Response, context: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(classify_failure(status, &body, context))
}

fn classify_failure(status: StatusCode, body: &str, context: &str) -> Error {
    match status {
        StatusCode::NOT_FOUND => Error::NotFound(context.to_string()),
        StatusCode::UNAUTHORIZED => {
            Error::Authentication(format!("{}: invalid or expired token", context))
        }
        StatusCode::TOO_MANY_REQUESTS => Error::RateLimited(format!("{}: {}", context, status)),
        StatusCode::FORBIDDEN if body.contains("ateLimitExceeded") => {
            Error::RateLimited(format!("{}: {}", context, status))
        }
        StatusCode::FORBIDDEN => Error::PermissionDenied(format!("{}: {}", context, body)),
        s if s.is_server_error() => Error::Network(format!("{}: {} - {}", context, s, body)),
        s => Error::Storage(format!("{}: {} - {}", context, s, body)),
    }
}
