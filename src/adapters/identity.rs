//! Credential verification for channel attachment
//!
//! The streaming surface authenticates with bearer tokens issued by the
//! (out-of-scope) auth service; this adapter only verifies them.

use crate::error::{MatchmakingError, Result};
use crate::types::PlayerId;
use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Verifies a client credential and resolves the player behind it
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Returns the authenticated player id, or `unauthenticated`.
    async fn verify(&self, credential: &str) -> Result<PlayerId>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// Player id
    sub: String,
    /// Expiry, seconds since epoch
    exp: usize,
}

/// HS256 bearer token verifier
pub struct JwtIdentityVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

#[async_trait]
impl IdentityVerifier for JwtIdentityVerifier {
    async fn verify(&self, credential: &str) -> Result<PlayerId> {
        let data = decode::<Claims>(credential, &self.decoding_key, &self.validation).map_err(
            |e| MatchmakingError::Unauthenticated {
                message: format!("invalid token: {}", e),
            },
        )?;

        if data.claims.sub.is_empty() {
            return Err(MatchmakingError::Unauthenticated {
                message: "token carries no subject".to_string(),
            }
            .into());
        }

        Ok(data.claims.sub)
    }
}

/// Test double resolving credentials from a static map
#[derive(Debug, Default)]
pub struct StaticIdentityVerifier {
    tokens: HashMap<String, PlayerId>,
}

impl StaticIdentityVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, credential: &str, player_id: &str) -> Self {
        self.tokens
            .insert(credential.to_string(), player_id.to_string());
        self
    }
}

#[async_trait]
impl IdentityVerifier for StaticIdentityVerifier {
    async fn verify(&self, credential: &str) -> Result<PlayerId> {
        self.tokens.get(credential).cloned().ok_or_else(|| {
            MatchmakingError::Unauthenticated {
                message: "unknown credential".to_string(),
            }
            .into()
        })
    }
}
