use std::sync::Arc;

use thiserror::Error;

/// Response header through which the identity service delegates to an
/// external login page when a credential exchange cannot succeed in-band.
pub const REDIRECT_HEADER: &str = "X-Authentication-Location";

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Failure to turn an access token into claims.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Token has no payload segment")]
    MissingPayload,

    #[error("Token payload is not valid base64url: {0}")]
    Base64(String),

    #[error("Token payload is not valid JSON: {0}")]
    Json(String),

    #[error("Token payload is not a JSON object")]
    NotAnObject,

    #[error("Token payload has no expiry (exp) claim")]
    MissingExpiry,
}

/// Outcome of a failed authenticate, login or refresh flow.
///
/// Clone is required so a single settled outcome can be handed to every
/// caller coalesced onto the same in-flight request.
#[derive(Error, Debug, Clone)]
pub enum AuthError {
    #[error("Malformed access token: {0}")]
    Decode(#[from] DecodeError),

    #[error("No token received: response has no '{field}' field")]
    MissingToken { field: String },

    #[error("Network error: {0}")]
    Network(Arc<reqwest::Error>),

    /// Not strictly an error: the service asked the caller to navigate to
    /// `location` to complete authentication out of band.
    #[error("Authentication required at {location} (status {status})")]
    Redirect { status: u16, location: String },

    #[error("Request rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("No refresh token available")]
    NoRefreshToken,

    #[error("Session was reset while the request was in flight")]
    SessionReset,
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        AuthError::Network(Arc::new(err))
    }
}

impl AuthError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    /// Build the failure for a non-success response. A redirect header wins
    /// over the status code.
    pub fn from_response(status: reqwest::StatusCode, location: Option<&str>, body: &str) -> Self {
        match location.map(str::trim).filter(|l| !l.is_empty()) {
            Some(location) => AuthError::Redirect {
                status: status.as_u16(),
                location: location.to_string(),
            },
            None => AuthError::Rejected {
                status: status.as_u16(),
                body: Self::truncate_body(body),
            },
        }
    }

    /// Navigation target carried by this failure, if any.
    pub fn redirect_location(&self) -> Option<&str> {
        match self {
            AuthError::Redirect { location, .. } => Some(location),
            _ => None,
        }
    }
}

/// Failure of a refresh-token persistence collaborator.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stored token file is corrupt: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Could not determine storage location")]
    NoLocation,
}
