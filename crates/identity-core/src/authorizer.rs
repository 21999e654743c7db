//! Authorization stamping for outgoing requests.
//!
//! Every request leaving through an `AuthorizedClient` is stamped with the
//! current access token right before transmission. The stamp never blocks
//! and never triggers a refresh; renewal is driven only by the scheduler and
//! the focus trigger.

use reqwest::{header, Client, Method, RequestBuilder, Response};
use tracing::warn;

use crate::session::SharedSession;

#[derive(Debug, Clone)]
pub struct RequestAuthorizer {
    session: SharedSession,
}

impl RequestAuthorizer {
    pub fn new(session: SharedSession) -> Self {
        Self { session }
    }

    /// The `Authorization` value for the current token. A missing token
    /// still yields a bearer credential (empty); rejecting it is the
    /// receiving service's job.
    pub fn header_value(&self) -> header::HeaderValue {
        let token = self.session.access_token().unwrap_or_default();
        let mut value = match header::HeaderValue::from_str(&format!("Bearer {}", token)) {
            Ok(value) => value,
            Err(_) => {
                warn!("Access token contains characters not allowed in a header, sending empty bearer");
                header::HeaderValue::from_static("Bearer ")
            }
        };
        value.set_sensitive(true);
        value
    }

    /// Stamp `headers`, replacing any existing authorization.
    pub fn authorize(&self, headers: &mut header::HeaderMap) {
        headers.insert(header::AUTHORIZATION, self.header_value());
    }
}

/// HTTP client whose every request passes through a `RequestAuthorizer`.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Debug, Clone)]
pub struct AuthorizedClient {
    client: Client,
    authorizer: RequestAuthorizer,
}

impl AuthorizedClient {
    /// Build a client with a cookie store, so credentialed calls carry the
    /// identity service's cookies.
    pub fn new(authorizer: RequestAuthorizer, timeout: std::time::Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).cookie_store(true).build()?;
        Ok(Self::with_client(client, authorizer))
    }

    pub fn with_client(client: Client, authorizer: RequestAuthorizer) -> Self {
        Self { client, authorizer }
    }

    pub fn authorizer(&self) -> &RequestAuthorizer {
        &self.authorizer
    }

    pub fn get(&self, url: &str) -> RequestBuilder {
        self.client.get(url)
    }

    pub fn post(&self, url: &str) -> RequestBuilder {
        self.client.post(url)
    }

    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client.request(method, url)
    }

    /// Build, stamp and send a request made from this client's builders.
    pub async fn send(&self, builder: RequestBuilder) -> Result<Response, reqwest::Error> {
        let mut request = builder.build()?;
        self.authorizer.authorize(request.headers_mut());
        self.client.execute(request).await
    }
}
