//! Auth Guard.
//!
//! Resolves the caller's identity from a signed token before any session
//! work happens. Tokens are minted by the identity exchange in front of the
//! relay and look like:
//!
//! ```text
//! base64url(json{"sub", "email"?, "exp", "iat"?}) "." hex(HMAC-SHA256(secret, payload))
//! ```
//!
//! A token is looked up in the `Authorization: Bearer` header first, then the
//! session cookie, then the `token` query parameter.
//!
//! The identity resolved at connect time keeps its token's validity window
//! and is re-checked with [`AuthGuard::revalidate`] before every operation.
//! Logging out revokes every token of a user issued up to that moment.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tokio_tungstenite::tungstenite::handshake::server::Request;

use crate::config::AuthConfig;

type HmacSha256 = Hmac<Sha256>;

/// Longest accepted subject.
const MAX_SUBJECT_LEN: usize = 128;

/// Authentication failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No token, or a token that does not verify.
    #[error("unauthenticated")]
    Unauthenticated,

    /// A valid token past its validity window.
    #[error("expired")]
    Expired,
}

/// The authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    /// Stable user identifier; also names the owner's workspace directory.
    pub user_id: String,
    /// Email address, when the identity provider shared one.
    pub email: Option<String>,
    /// Expiry of the token this identity came from (Unix seconds).
    pub expires_at: Option<u64>,
    /// When that token was issued (Unix seconds); 0 if it did not say.
    pub issued_at: u64,
}

impl Identity {
    /// Creates an identity without an email or a token behind it.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: None,
            expires_at: None,
            issued_at: 0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    exp: u64,
    #[serde(default)]
    iat: u64,
}

/// Validates identity tokens on incoming handshakes and operations.
pub struct AuthGuard {
    secret: Vec<u8>,
    cookie_name: String,
    leeway: u64,
    /// User id to the time of their last logout.
    revoked: DashMap<String, u64>,
}

impl AuthGuard {
    /// Creates a guard from configuration.
    ///
    /// An empty secret is replaced by a random per-process key, which means
    /// only tokens issued by this process verify.
    pub fn new(config: &AuthConfig) -> Self {
        let secret = if config.secret.is_empty() {
            tracing::warn!(
                "No auth secret configured; using a random key, tokens will not survive a restart"
            );
            let mut key = vec![0u8; 32];
            rand::thread_rng().fill_bytes(&mut key);
            key
        } else {
            config.secret.as_bytes().to_vec()
        };

        Self {
            secret,
            cookie_name: config.cookie_name.clone(),
            leeway: config.leeway_secs,
            revoked: DashMap::new(),
        }
    }

    /// Resolves the identity carried by a WebSocket upgrade request.
    pub fn authenticate(&self, request: &Request) -> Result<Identity, AuthError> {
        let token = self
            .bearer_token(request)
            .or_else(|| self.cookie_token(request))
            .or_else(|| query_token(request))
            .ok_or(AuthError::Unauthenticated)?;

        self.verify(&token)
    }

    /// Verifies a raw token string.
    pub fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let (payload, signature) = token.split_once('.').ok_or(AuthError::Unauthenticated)?;
        let signature = hex::decode(signature).map_err(|_| AuthError::Unauthenticated)?;

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::Unauthenticated)?;

        let json = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| AuthError::Unauthenticated)?;
        let claims: Claims =
            serde_json::from_slice(&json).map_err(|_| AuthError::Unauthenticated)?;

        if !is_valid_subject(&claims.sub) {
            tracing::debug!("Rejecting token with unusable subject");
            return Err(AuthError::Unauthenticated);
        }

        let identity = Identity {
            user_id: claims.sub,
            email: claims.email,
            expires_at: Some(claims.exp),
            issued_at: claims.iat,
        };
        self.revalidate(&identity)?;
        Ok(identity)
    }

    /// Checks that an identity resolved earlier is still good.
    ///
    /// Fails with `Expired` once its token's expiry plus leeway has passed,
    /// and with `Unauthenticated` if the user logged out after the token was
    /// issued.
    pub fn revalidate(&self, identity: &Identity) -> Result<(), AuthError> {
        if let Some(exp) = identity.expires_at {
            if unix_now() > exp.saturating_add(self.leeway) {
                return Err(AuthError::Expired);
            }
        }

        if let Some(revoked_at) = self.revoked.get(&identity.user_id) {
            if identity.issued_at <= *revoked_at {
                tracing::debug!(user = %identity.user_id, "Rejecting revoked identity");
                return Err(AuthError::Unauthenticated);
            }
        }

        Ok(())
    }

    /// Revokes every token of `user_id` issued up to now.
    pub fn revoke(&self, user_id: &str) {
        let now = unix_now();
        self.revoked
            .entry(user_id.to_string())
            .and_modify(|at| *at = (*at).max(now))
            .or_insert(now);
        tracing::info!(user = %user_id, "Revoked identity tokens");
    }

    /// Issues a token for an identity, valid for `ttl`.
    pub fn issue(&self, identity: &Identity, ttl: Duration) -> Result<String, AuthError> {
        self.issue_with_expiry(identity, unix_now().saturating_add(ttl.as_secs()))
    }

    /// Issues a token with an absolute expiry (Unix seconds).
    pub fn issue_with_expiry(&self, identity: &Identity, exp: u64) -> Result<String, AuthError> {
        // A token minted right after a logout must outlive the revocation.
        let iat = match self.revoked.get(&identity.user_id) {
            Some(revoked_at) => unix_now().max(revoked_at.saturating_add(1)),
            None => unix_now(),
        };
        let claims = Claims {
            sub: identity.user_id.clone(),
            email: identity.email.clone(),
            exp,
            iat,
        };
        let json = serde_json::to_vec(&claims).map_err(|_| AuthError::Unauthenticated)?;
        let payload = URL_SAFE_NO_PAD.encode(json);

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        Ok(format!("{}.{}", payload, signature))
    }

    fn mac(&self) -> Result<HmacSha256, AuthError> {
        HmacSha256::new_from_slice(&self.secret).map_err(|_| AuthError::Unauthenticated)
    }

    fn bearer_token(&self, request: &Request) -> Option<String> {
        request
            .headers()
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
    }

    fn cookie_token(&self, request: &Request) -> Option<String> {
        request
            .headers()
            .get_all("cookie")
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == self.cookie_name)
            .map(|(_, value)| value.trim().to_string())
            .filter(|token| !token.is_empty())
    }
}

fn query_token(request: &Request) -> Option<String> {
    let query = request.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned())
        .filter(|token| !token.is_empty())
}

/// Subjects name directories, so only a conservative character set is allowed.
fn is_valid_subject(sub: &str) -> bool {
    !sub.is_empty()
        && sub.len() <= MAX_SUBJECT_LEN
        && sub != "."
        && sub != ".."
        && sub
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
