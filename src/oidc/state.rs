use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{ControlError, Result};

type HmacSha256 = Hmac<Sha256>;

const STATE_PREFIX: &str = "st_";

/// Binds the `state` handed out with an auth URL to the request that
/// produced it, so a callback only succeeds with the same method, redirect
/// URI and client nonce, before the request expires.
///
/// Format: `st_<unix expiry>.<base64url HMAC-SHA256>`.
#[derive(Clone)]
pub struct StateSigner {
    key: Vec<u8>,
}

impl std::fmt::Debug for StateSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSigner").finish_non_exhaustive()
    }
}

impl StateSigner {
    pub fn new(key: &[u8]) -> Self {
        Self { key: key.to_vec() }
    }

    fn mac(&self, method: &str, redirect_uri: &str, nonce: &str, expiry: i64) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC can take key of any size");
        for part in [method, redirect_uri, nonce] {
            mac.update(&(part.len() as u64).to_be_bytes());
            mac.update(part.as_bytes());
        }
        mac.update(&expiry.to_be_bytes());
        mac
    }

    pub fn issue(
        &self,
        method: &str,
        redirect_uri: &str,
        nonce: &str,
        expires_at: DateTime<Utc>,
    ) -> String {
        let expiry = expires_at.timestamp();
        let tag = self
            .mac(method, redirect_uri, nonce, expiry)
            .finalize()
            .into_bytes();
        format!("{}{}.{}", STATE_PREFIX, expiry, URL_SAFE_NO_PAD.encode(tag))
    }

    /// Check `state` was issued for these parameters and has not expired.
    /// Returns the expiry it carries.
    pub fn verify(
        &self,
        state: &str,
        method: &str,
        redirect_uri: &str,
        nonce: &str,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let malformed = || ControlError::ExternalProvider("malformed OIDC state".to_string());

        let (expiry, tag) = state
            .strip_prefix(STATE_PREFIX)
            .and_then(|rest| rest.split_once('.'))
            .ok_or_else(malformed)?;
        let expiry: i64 = expiry.parse().map_err(|_| malformed())?;
        let tag = URL_SAFE_NO_PAD.decode(tag).map_err(|_| malformed())?;

        self.mac(method, redirect_uri, nonce, expiry)
            .verify_slice(&tag)
            .map_err(|_| {
                ControlError::ExternalProvider(
                    "OIDC state does not match this auth request".to_string(),
                )
            })?;

        let expires_at = Utc.timestamp_opt(expiry, 0).single().ok_or_else(malformed)?;
        if now > expires_at {
            return Err(ControlError::ExternalProvider(
                "OIDC auth request expired".to_string(),
            ));
        }
        Ok(expires_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const URI: &str = "http://127.0.0.1:4649/oidc/callback";

    #[test]
    fn issued_state_verifies() {
        let signer = StateSigner::new(b"key");
        let now = Utc::now();
        let state = signer.issue("okta", URI, "n1", now + Duration::minutes(5));
        assert!(state.starts_with("st_"));
        assert!(signer.verify(&state, "okta", URI, "n1", now).is_ok());
    }

    #[test]
    fn any_changed_parameter_fails() {
        let signer = StateSigner::new(b"key");
        let now = Utc::now();
        let state = signer.issue("okta", URI, "n1", now + Duration::minutes(5));

        assert!(signer.verify(&state, "auth0", URI, "n1", now).is_err());
        assert!(signer.verify(&state, "okta", "http://evil/cb", "n1", now).is_err());
        assert!(signer.verify(&state, "okta", URI, "n2", now).is_err());
        assert!(StateSigner::new(b"other")
            .verify(&state, "okta", URI, "n1", now)
            .is_err());
    }

    #[test]
    fn expired_state_fails() {
        let signer = StateSigner::new(b"key");
        let now = Utc::now();
        let state = signer.issue("okta", URI, "n1", now - Duration::seconds(1));
        let err = signer.verify(&state, "okta", URI, "n1", now).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn tampered_expiry_fails() {
        let signer = StateSigner::new(b"key");
        let now = Utc::now();
        let state = signer.issue("okta", URI, "n1", now + Duration::minutes(5));
        let (_, tag) = state.split_once('.').unwrap();
        let forged = format!("st_{}.{}", (now + Duration::days(1)).timestamp(), tag);
        assert!(signer.verify(&forged, "okta", URI, "n1", now).is_err());
        assert!(signer.verify("garbage", "okta", URI, "n1", now).is_err());
    }
}
