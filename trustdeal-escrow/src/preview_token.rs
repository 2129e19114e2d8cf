//! Preview Tokens - Short-lived capabilities for viewing a deliverable
//!
//! A preview token is an HS256 JWT binding a job id to the wallet address of
//! the client that requested it. Tokens are stateless: expiry is the only way
//! a token stops working, and the same token may be redeemed repeatedly
//! within its window.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::models::WalletAddress;
use crate::{EscrowResult, error::EscrowError};

/// Configuration for preview tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewTokenConfig {
    /// Token lifetime in seconds
    pub ttl_secs: u64,
    /// Value of the `iss` claim
    pub issuer: String,
}

impl Default for PreviewTokenConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 600, // 10 minutes
            issuer: "trustdeal-escrow".to_string(),
        }
    }
}

/// Claims embedded in a preview token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewClaims {
    /// Requester wallet address.
    pub sub: WalletAddress,
    /// Job the token grants a preview of.
    pub job: Uuid,
    pub iss: String,
    /// Issued at (seconds since epoch).
    pub iat: i64,
    /// Expiry (seconds since epoch).
    pub exp: i64,
    /// Unique token id.
    pub jti: String,
}

/// A freshly signed token
#[derive(Debug, Clone)]
pub struct IssuedPreviewToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Signs and checks preview tokens with the process-wide signing secret.
pub struct PreviewTokenIssuer {
    config: PreviewTokenConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for PreviewTokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreviewTokenIssuer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PreviewTokenIssuer {
    pub fn new(
        config: PreviewTokenConfig,
        signing_secret: &[u8],
        clock: Arc<dyn Clock>,
    ) -> EscrowResult<Self> {
        if signing_secret.is_empty() {
            return Err(EscrowError::config("token signing secret is empty"));
        }
        if config.ttl_secs == 0 {
            return Err(EscrowError::config("preview token ttl must be positive"));
        }

        // Expiry is compared against the injected clock in `verify`.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_issuer(&[config.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(signing_secret),
            decoding_key: DecodingKey::from_secret(signing_secret),
            validation,
            config,
            clock,
        })
    }

    /// Issue a token for `requester` to preview `job_id`.
    pub fn issue(&self, job_id: Uuid, requester: &WalletAddress) -> EscrowResult<IssuedPreviewToken> {
        let now = self.clock.now();
        let ttl = i64::try_from(self.config.ttl_secs)
            .map_err(|_| EscrowError::config("preview token ttl out of range"))?;
        let exp = now.timestamp() + ttl;

        let claims = PreviewClaims {
            sub: requester.clone(),
            job: job_id,
            iss: self.config.issuer.clone(),
            iat: now.timestamp(),
            exp,
            jti: Uuid::new_v4().to_string(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| EscrowError::crypto(format!("token signing failed: {e}")))?;

        info!("Issued preview token {} for job {}", claims.jti, job_id);
        Ok(IssuedPreviewToken {
            token,
            expires_at: now + Duration::seconds(ttl),
        })
    }

    /// Check signature and expiry. Every failure is reported the same way.
    pub fn verify(&self, token: &str) -> Option<PreviewClaims> {
        let claims = match decode::<PreviewClaims>(token, &self.decoding_key, &self.validation) {
            Ok(data) => data.claims,
            Err(e) => {
                debug!("Preview token rejected: {}", e);
                return None;
            }
        };

        if self.clock.now().timestamp() >= claims.exp {
            debug!("Preview token {} expired", claims.jti);
            return None;
        }
        Some(claims)
    }

    /// Verify `token` and check it was issued to `presenter` for `job_id`.
    pub fn redeem(
        &self,
        token: &str,
        job_id: Uuid,
        presenter: &WalletAddress,
    ) -> EscrowResult<PreviewClaims> {
        let claims = self.verify(token).ok_or(EscrowError::InvalidOrExpiredToken)?;

        if claims.job != job_id {
            return Err(EscrowError::unauthorized(
                "Preview token was issued for a different job",
            ));
        }
        if &claims.sub != presenter {
            return Err(EscrowError::unauthorized(
                "Preview token was issued to a different requester",
            ));
        }
        Ok(claims)
    }
}
