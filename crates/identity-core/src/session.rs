//! In-memory session record and its derived queries.
//!
//! Pure data: nothing here touches the network or timers.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::Claims;

/// An access token together with the claims decoded from it. Holding both in
/// one value keeps them from ever being set or cleared independently.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessCredential {
    pub token: String,
    pub claims: Claims,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    pub credential: Option<AccessCredential>,
    pub refresh_token: Option<String>,
}

impl Session {
    /// Empty session, optionally anchored by a rehydrated refresh token.
    pub fn new(refresh_token: Option<String>) -> Self {
        Self {
            credential: None,
            refresh_token,
        }
    }

    pub fn access_token(&self) -> Option<&str> {
        self.credential.as_ref().map(|c| c.token.as_str())
    }

    pub fn claims(&self) -> Option<&Claims> {
        self.credential.as_ref().map(|c| &c.claims)
    }

    pub fn subject(&self) -> Option<&str> {
        self.claims().and_then(|c| c.subject.as_deref())
    }

    /// Time until the access token expires. Zero when no token is held,
    /// negative once it has expired.
    pub fn time_remaining(&self, now: DateTime<Utc>) -> Duration {
        match self.claims() {
            Some(claims) => {
                let millis = claims
                    .expires_at
                    .saturating_mul(1000)
                    .saturating_sub(now.timestamp_millis())
                    .max(-i64::MAX);
                Duration::milliseconds(millis)
            }
            None => Duration::zero(),
        }
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        self.time_remaining(now).num_minutes().max(0)
    }

    /// A session exists while a refresh token is held and the access token is
    /// still live. An expired access token with a live refresh token counts
    /// only until a refresh actually fails.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.refresh_token.is_some() && self.time_remaining(now) > Duration::zero()
    }

    /// Check if the session will expire within `threshold` and should be refreshed
    pub fn needs_refresh(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.is_valid(now) && self.time_remaining(now) <= threshold
    }

    /// Install a freshly received token pair.
    pub fn update(&mut self, credential: AccessCredential, refresh_token: Option<String>) {
        self.credential = Some(credential);
        self.refresh_token = refresh_token;
    }

    /// Reset every field to absent.
    pub fn clear(&mut self) {
        self.credential = None;
        self.refresh_token = None;
    }
}

/// The one session of a manager, shared with its request authorizer.
#[derive(Debug, Clone, Default)]
pub struct SharedSession(Arc<RwLock<Session>>);

impl SharedSession {
    pub fn new(session: Session) -> Self {
        Self(Arc::new(RwLock::new(session)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Session> {
        self.0.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Session> {
        self.0.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Owned copy of the current access token.
    pub fn access_token(&self) -> Option<String> {
        self.read().access_token().map(str::to_string)
    }
}

/// Observable view of the session, published to the host on every change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub authenticated: bool,
    pub subject: Option<String>,
    pub issued_at: Option<DateTime<Utc>>,
    pub not_before: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub has_access_token: bool,
    pub has_refresh_token: bool,
    pub loading: bool,
    pub next_refresh_at: Option<DateTime<Utc>>,
    pub refresh_abandoned: bool,
}

impl SessionSnapshot {
    pub fn capture(
        session: &Session,
        now: DateTime<Utc>,
        loading: bool,
        next_refresh_at: Option<DateTime<Utc>>,
        refresh_abandoned: bool,
    ) -> Self {
        let claims = session.claims();
        Self {
            authenticated: session.is_valid(now),
            subject: session.subject().map(str::to_string),
            issued_at: claims.and_then(Claims::issued_at_utc),
            not_before: claims.and_then(Claims::not_before_utc),
            expires_at: claims.and_then(Claims::expires_at_utc),
            has_access_token: session.credential.is_some(),
            has_refresh_token: session.refresh_token.is_some(),
            loading,
            next_refresh_at,
            refresh_abandoned,
        }
    }
}
