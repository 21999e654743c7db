//! Access-token decoding.
//!
//! Tokens use the compact `header.payload.signature` form; only the payload
//! is read. Signatures are the issuing service's concern, not the client's.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DecodeError;

/// Structured claims carried by an access token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub subject: Option<String>,
    /// Epoch seconds
    pub issued_at: Option<i64>,
    /// Epoch seconds
    pub not_before: Option<i64>,
    /// Epoch seconds
    pub expires_at: i64,
    /// The complete decoded payload, registered claims included.
    pub payload: Map<String, Value>,
}

impl Claims {
    pub fn expires_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.expires_at, 0)
    }

    pub fn issued_at_utc(&self) -> Option<DateTime<Utc>> {
        self.issued_at.and_then(|t| DateTime::from_timestamp(t, 0))
    }

    pub fn not_before_utc(&self) -> Option<DateTime<Utc>> {
        self.not_before.and_then(|t| DateTime::from_timestamp(t, 0))
    }

    /// Look up an arbitrary payload claim.
    pub fn get(&self, claim: &str) -> Option<&Value> {
        self.payload.get(claim)
    }
}

/// JWT NumericDate: integer or fractional seconds.
fn numeric_date(payload: &Map<String, Value>, claim: &str) -> Option<i64> {
    let value = payload.get(claim)?;
    value.as_i64().or_else(|| value.as_f64().map(|f| f.floor() as i64))
}

/// Decode the claims of an access token.
pub fn decode(token: &str) -> Result<Claims, DecodeError> {
    let segment = token
        .split('.')
        .nth(1)
        .filter(|s| !s.is_empty())
        .ok_or(DecodeError::MissingPayload)?;

    let bytes = URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|e| DecodeError::Base64(e.to_string()))?;

    let payload = match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(map)) => map,
        Ok(_) => return Err(DecodeError::NotAnObject),
        Err(e) => return Err(DecodeError::Json(e.to_string())),
    };

    let expires_at = numeric_date(&payload, "exp").ok_or(DecodeError::MissingExpiry)?;

    Ok(Claims {
        subject: payload.get("sub").and_then(Value::as_str).map(str::to_string),
        issued_at: numeric_date(&payload, "iat"),
        not_before: numeric_date(&payload, "nbf"),
        expires_at,
        payload,
    })
}

/// Build an unsigned compact token around `payload` (tests and local stubs).
pub fn encode_unsigned(payload: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("{}.{}.", header, body)
}
