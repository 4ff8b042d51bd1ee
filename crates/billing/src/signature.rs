//! Webhook signature verification
//!
//! Signed webhooks carry a header of the form `t=<unix seconds>,v1=<hex>`
//! where the hex value is HMAC-SHA256 over `"<t>.<raw body>"` keyed with the
//! shared webhook secret. Several `v1` entries may be present while a secret
//! is being rotated; any match is accepted.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Verifies webhook signatures against a shared secret
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: Vec<u8>,
    tolerance_secs: i64,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("tolerance_secs", &self.tolerance_secs)
            .finish_non_exhaustive()
    }
}

impl WebhookVerifier {
    pub fn new(secret: &str, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            tolerance_secs: tolerance_secs.max(0),
        }
    }

    /// Compute the hex signature for `body` signed at `timestamp`
    pub fn sign(&self, body: &str, timestamp: i64) -> String {
        hex::encode(self.mac(body, timestamp))
    }

    /// Check `header` against `body`, with `now` in unix seconds
    pub fn verify(&self, body: &str, header: Option<&str>, now: i64) -> BillingResult<()> {
        let header = header.ok_or(BillingError::WebhookSignatureMissing)?;

        let mut timestamp: Option<i64> = None;
        let mut candidates: Vec<&str> = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
        if candidates.is_empty() {
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let skew_secs = now.checked_sub(timestamp).and_then(i64::checked_abs);
        match skew_secs {
            Some(skew_secs) if skew_secs <= self.tolerance_secs => {}
            Some(skew_secs) => {
                return Err(BillingError::WebhookTimestampOutOfTolerance { skew_secs })
            }
            None => {
                return Err(BillingError::WebhookTimestampOutOfTolerance {
                    skew_secs: i64::MAX,
                })
            }
        }

        let expected = self.mac(body, timestamp);
        let matched = candidates.iter().any(|candidate| {
            hex::decode(candidate)
                .map(|provided| bool::from(provided.ct_eq(&expected)))
                .unwrap_or(false)
        });

        if matched {
            Ok(())
        } else {
            Err(BillingError::WebhookSignatureInvalid)
        }
    }

    fn mac(&self, body: &str, timestamp: i64) -> Vec<u8> {
        // HMAC accepts keys of any length, so construction cannot fail
        let mut mac = match HmacSha256::new_from_slice(&self.secret) {
            Ok(mac) => mac,
            Err(_) => return Vec::new(),
        };
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }
}
