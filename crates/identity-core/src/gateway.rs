//! Credential exchanges with the identity service.
//!
//! The gateway shapes the three calls (authenticate, login, refresh) and
//! turns whatever comes back into either a fully decoded `TokenGrant` or an
//! `AuthError`. It never touches session state: a grant is only applied by
//! the manager once it has been validated end to end, so a bad response can
//! not leave the session half-updated.

use reqwest::{header, RequestBuilder, Response};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::authorizer::AuthorizedClient;
use crate::codec::{self, Claims};
use crate::config::{Endpoint, IdentityConfig};
use crate::error::{AuthError, REDIRECT_HEADER};
use crate::session::AccessCredential;

/// Tokens extracted from a successful exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub claims: Claims,
}

impl TokenGrant {
    pub fn into_parts(self) -> (AccessCredential, Option<String>) {
        (
            AccessCredential {
                token: self.access_token,
                claims: self.claims,
            },
            self.refresh_token,
        )
    }
}

/// Which credential exchange a flow performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowKind {
    Authenticate,
    Login,
    Refresh,
}

impl FlowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowKind::Authenticate => "authenticate",
            FlowKind::Login => "login",
            FlowKind::Refresh => "refresh",
        }
    }
}

pub struct AuthGateway {
    config: IdentityConfig,
    client: AuthorizedClient,
}

impl AuthGateway {
    pub fn new(config: IdentityConfig, client: AuthorizedClient) -> Self {
        Self { config, client }
    }

    pub fn config(&self) -> &IdentityConfig {
        &self.config
    }

    pub fn client(&self) -> &AuthorizedClient {
        &self.client
    }

    /// Credentialed GET to the login endpoint, for services that can issue
    /// tokens from an existing browser-style session cookie.
    pub async fn request_login(&self) -> Result<TokenGrant, AuthError> {
        let url = self.config.uri(Endpoint::Login);
        let builder = self.client.get(&url).query(&self.config.login_params());
        self.exchange(FlowKind::Authenticate, builder).await
    }

    /// Credentialed POST of user-supplied credentials to the login endpoint.
    pub async fn submit_login<B: Serialize + ?Sized>(&self, credentials: &B) -> Result<TokenGrant, AuthError> {
        let url = self.config.uri(Endpoint::Login);
        let builder = self.client.post(&url).json(credentials);
        self.exchange(FlowKind::Login, builder).await
    }

    /// POST the refresh token to the refresh endpoint.
    pub async fn request_refresh(&self, refresh_token: &str) -> Result<TokenGrant, AuthError> {
        let url = self.config.uri(Endpoint::Refresh);
        let builder = self.client.post(&url).json(&json!({ "token": refresh_token }));
        self.exchange(FlowKind::Refresh, builder).await
    }

    async fn exchange(&self, flow: FlowKind, builder: RequestBuilder) -> Result<TokenGrant, AuthError> {
        debug!(flow = flow.as_str(), "Sending credential request");

        let response = self.client.send(builder).await?;
        let response = Self::check_response(response).await?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(format!("Failed to parse {} response: {}", flow.as_str(), e)))?;

        self.extract_grant(&body)
    }

    /// Check if response is successful, turning it into a failure carrying
    /// any redirect instruction if not.
    async fn check_response(response: Response) -> Result<Response, AuthError> {
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let location = redirect_location(response.headers()).map(str::to_string);
        let body = response.text().await.unwrap_or_default();

        if let Some(ref location) = location {
            warn!(status = status.as_u16(), location = %location, "Identity service requested redirect");
        } else {
            warn!(status = status.as_u16(), "Credential request rejected");
        }

        Err(AuthError::from_response(status, location.as_deref(), &body))
    }

    /// Pull the configured token fields out of a response body and decode the
    /// access token.
    pub fn extract_grant(&self, body: &Value) -> Result<TokenGrant, AuthError> {
        let fields = body
            .as_object()
            .ok_or_else(|| AuthError::InvalidResponse("Response body is not a JSON object".to_string()))?;

        let access_token = match fields.get(&self.config.access_token_field) {
            None | Some(Value::Null) => {
                return Err(AuthError::MissingToken {
                    field: self.config.access_token_field.clone(),
                })
            }
            Some(Value::String(token)) => token.clone(),
            Some(_) => {
                return Err(AuthError::InvalidResponse(format!(
                    "'{}' is not a string",
                    self.config.access_token_field
                )))
            }
        };

        let refresh_token = match fields.get(&self.config.refresh_token_field) {
            Some(Value::String(token)) => Some(token.clone()),
            None | Some(Value::Null) => {
                warn!(field = %self.config.refresh_token_field, "Response carried no refresh token");
                None
            }
            Some(_) => {
                warn!(field = %self.config.refresh_token_field, "Ignoring non-string refresh token");
                None
            }
        };

        let claims = codec::decode(&access_token)?;

        Ok(TokenGrant {
            access_token,
            refresh_token,
            claims,
        })
    }
}

/// Does this response carry a redirect instruction? Exposed for hosts that
/// make their own calls through the authorized client.
pub fn redirect_location(headers: &header::HeaderMap) -> Option<&str> {
    headers
        .get(REDIRECT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|l| !l.is_empty())
}
