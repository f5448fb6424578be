//! HMAC-signed submit links.
//!
//! The front end signs `data` (base64url JSON of a submit request plus an
//! optional `exp` unix timestamp) with the shared download secret and sends
//! `sig = hex(HMAC-SHA256(secret, data))`.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::pipeline::SubmitRequest;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature mismatch")]
    Mismatch,
    #[error("signed request expired")]
    Expired,
    #[error("malformed signed payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct SignedPayload {
    #[serde(flatten)]
    request: SubmitRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exp: Option<i64>,
}

fn mac(secret: &str) -> Result<HmacSha256, SignatureError> {
    HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| SignatureError::Malformed(e.to_string()))
}

/// Encode and sign `request`. Returns `(data, sig)`.
pub fn sign(
    secret: &str,
    request: &SubmitRequest,
    expires_at: Option<DateTime<Utc>>,
) -> Result<(String, String), SignatureError> {
    let payload = SignedPayload {
        request: request.clone(),
        exp: expires_at.map(|t| t.timestamp()),
    };
    let json =
        serde_json::to_vec(&payload).map_err(|e| SignatureError::Malformed(e.to_string()))?;
    let data = URL_SAFE_NO_PAD.encode(json);
    let mut mac = mac(secret)?;
    mac.update(data.as_bytes());
    Ok((data, hex::encode(mac.finalize().into_bytes())))
}

/// Check `sig` over `data` and decode the request inside.
pub fn verify(
    secret: &str,
    data: &str,
    sig: &str,
    now: DateTime<Utc>,
) -> Result<SubmitRequest, SignatureError> {
    let expected = hex::decode(sig.trim()).map_err(|_| SignatureError::Mismatch)?;
    let mut mac = mac(secret)?;
    mac.update(data.as_bytes());
    mac.verify_slice(&expected)
        .map_err(|_| SignatureError::Mismatch)?;

    let raw = URL_SAFE_NO_PAD
        .decode(data.trim_end_matches('='))
        .map_err(|e| SignatureError::Malformed(e.to_string()))?;
    let payload: SignedPayload =
        serde_json::from_slice(&raw).map_err(|e| SignatureError::Malformed(e.to_string()))?;

    if payload.exp.is_some_and(|exp| now.timestamp() > exp) {
        return Err(SignatureError::Expired);
    }
    Ok(payload.request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_then_verify() {
        let request = SubmitRequest::new(7, "Heat", "en").with_dub("LostFilm");
        let now = Utc::now();
        let (data, sig) = sign("s3cret", &request, Some(now + chrono::Duration::minutes(5))).unwrap();

        let decoded = verify("s3cret", &data, &sig, now).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let request = SubmitRequest::new(7, "Heat", "en");
        let (data, sig) = sign("s3cret", &request, None).unwrap();
        assert_eq!(
            verify("other", &data, &sig, Utc::now()),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify("s3cret", &data, "zz", Utc::now()),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_expired_link() {
        let request = SubmitRequest::new(7, "Heat", "en");
        let now = Utc::now();
        let (data, sig) = sign("s3cret", &request, Some(now - chrono::Duration::seconds(1))).unwrap();
        assert_eq!(verify("s3cret", &data, &sig, now), Err(SignatureError::Expired));
    }
}
