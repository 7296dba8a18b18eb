use axum::http::HeaderMap;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::AppError;

type HmacSha256 = Hmac<Sha256>;

/// Signed callbacks older or newer than this are refused
const TIMESTAMP_TOLERANCE_SECS: u64 = 5 * 60;

/// Prefix of Replicate signing secrets; the remainder is the base64 key
const SECRET_PREFIX: &str = "whsec_";

#[derive(Debug, PartialEq, Eq)]
pub enum WebhookError {
    InvalidSignature,
    TimestampOutOfRange,
    MissingHeaders,
    InvalidTimestamp,
    InvalidSecret,
}

impl From<WebhookError> for AppError {
    fn from(error: WebhookError) -> Self {
        match error {
            WebhookError::InvalidSignature => AppError::Unauthorized("invalid webhook signature".to_string()),
            WebhookError::TimestampOutOfRange => {
                AppError::Unauthorized("webhook timestamp outside acceptable range".to_string())
            }
            WebhookError::MissingHeaders => {
                AppError::Unauthorized("missing webhook signature headers".to_string())
            }
            WebhookError::InvalidTimestamp => AppError::invalid("invalid webhook timestamp"),
            WebhookError::InvalidSecret => {
                AppError::Configuration("webhook signing secret is not valid base64".to_string())
            }
        }
    }
}

/// `webhook-id`, `webhook-timestamp` and `webhook-signature` as sent by Replicate
#[derive(Debug)]
pub struct WebhookHeaders {
    pub id: String,
    pub timestamp: String,
    pub signature: String,
}

impl WebhookHeaders {
    pub fn from_http_headers(headers: &HeaderMap) -> Result<Self, WebhookError> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .ok_or(WebhookError::MissingHeaders)
        };

        Ok(WebhookHeaders {
            id: header("webhook-id")?,
            timestamp: header("webhook-timestamp")?,
            signature: header("webhook-signature")?,
        })
    }
}

fn signing_key(secret: &str) -> Result<Vec<u8>, WebhookError> {
    match secret.strip_prefix(SECRET_PREFIX) {
        Some(encoded) => BASE64
            .decode(encoded)
            .map_err(|_| WebhookError::InvalidSecret),
        None => Ok(secret.as_bytes().to_vec()),
    }
}

/// Candidate signatures from a `v1,<base64> v1,<base64>` list; a bare or
/// `v1=`-prefixed hex digest is accepted as well
fn candidate_signatures(header: &str) -> Vec<Vec<u8>> {
    header
        .split_whitespace()
        .filter_map(|entry| {
            if let Some(encoded) = entry.strip_prefix("v1,") {
                return BASE64.decode(encoded).ok();
            }
            let digest = entry.strip_prefix("v1=").unwrap_or(entry);
            hex::decode(digest).ok()
        })
        .collect()
}

/// Checks the HMAC-SHA256 of `{id}.{timestamp}.{payload}` against any of the
/// header's signatures
pub fn verify_webhook_signature(
    headers: &WebhookHeaders,
    payload: &[u8],
    signing_secret: &str,
) -> Result<(), WebhookError> {
    validate_timestamp(&headers.timestamp, chrono::Utc::now().timestamp())?;

    let mut mac = HmacSha256::new_from_slice(&signing_key(signing_secret)?)
        .map_err(|_| WebhookError::InvalidSecret)?;
    mac.update(headers.id.as_bytes());
    mac.update(b".");
    mac.update(headers.timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);

    // verify_slice compares in constant time
    let matched = candidate_signatures(&headers.signature)
        .iter()
        .any(|signature| mac.clone().verify_slice(signature).is_ok());

    if matched {
        Ok(())
    } else {
        Err(WebhookError::InvalidSignature)
    }
}

fn validate_timestamp(timestamp: &str, now: i64) -> Result<(), WebhookError> {
    let timestamp = timestamp
        .parse::<i64>()
        .map_err(|_| WebhookError::InvalidTimestamp)?;

    if timestamp.abs_diff(now) > TIMESTAMP_TOLERANCE_SECS {
        return Err(WebhookError::TimestampOutOfRange);
    }
    Ok(())
}
