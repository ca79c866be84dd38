//! Bearer tokens for member requests
//!
//! Members verify HS256 tokens signed with the deployment's JWT secret. The
//! operator signs a superuser token for itself and renews it before expiry.

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iss: String,
    server_id: String,
    iat: i64,
    exp: i64,
}

/// JWT secret plus the lifetime of the tokens signed with it
#[derive(Clone, PartialEq, Eq)]
pub struct JwtAuthentication {
    secret: String,
    ttl: Duration,
}

impl std::fmt::Debug for JwtAuthentication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtAuthentication")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl JwtAuthentication {
    pub fn new(secret: impl Into<String>, ttl: Duration) -> Self {
        Self {
            secret: secret.into(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Sign a fresh token valid for `ttl`
    pub fn sign(&self) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            iss: "arangodb".to_string(),
            server_id: "operator".to_string(),
            iat: now,
            exp: now + i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX / 2),
        };
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
    }
}
