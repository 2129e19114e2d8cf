//! Error types for the escrow core
//!
//! Every failure the deliverable lifecycle can produce, from cipher tag
//! mismatches to chain confirmation timeouts. Messages never carry key
//! material, plaintext or wallet addresses.

use thiserror::Error;

/// Main error type for escrow operations
#[derive(Error, Debug)]
pub enum EscrowError {
    /// Ciphertext tag did not verify (tampering or wrong key material)
    #[error("Authentication failure: ciphertext did not verify")]
    AuthenticationFailure,

    /// Bad signature and expiry collapse into this one kind
    #[error("Invalid or expired token")]
    InvalidOrExpiredToken,

    /// State machine transition errors
    #[error("Invalid state transition: {from_state} -> {to_state}: {reason}")]
    InvalidTransition {
        from_state: String,
        to_state: String,
        reason: String,
    },

    /// Caller is not the party allowed to perform the action
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Required data for the action is missing
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// Chain-side effect not observed within the polling budget
    #[error("Confirmation timeout: transaction {tx_ref} not confirmed after {attempts} attempts")]
    ConfirmationTimeout { tx_ref: String, attempts: u32 },

    /// The escrow contract call was executed but reverted
    #[error("Contract call reverted: {0}")]
    ContractReverted(String),

    /// Record lookup misses
    #[error("Not found: {0}")]
    NotFound(String),

    /// Request validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Cryptographic errors other than tag mismatch
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// External integration errors (blob storage, mirror node, ...)
    #[error("Integration error: {0}")]
    Integration(String),

    /// Filesystem errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EscrowError {
    /// Create a state transition error
    pub fn invalid_transition<S: Into<String>>(from_state: S, to_state: S, reason: S) -> Self {
        Self::InvalidTransition {
            from_state: from_state.into(),
            to_state: to_state.into(),
            reason: reason.into(),
        }
    }

    /// Create an authorization error
    pub fn unauthorized<S: Into<String>>(msg: S) -> Self {
        Self::Unauthorized(msg.into())
    }

    /// Create a precondition error
    pub fn precondition<S: Into<String>>(msg: S) -> Self {
        Self::PreconditionFailed(msg.into())
    }

    /// Create a confirmation timeout error
    pub fn confirmation_timeout<S: Into<String>>(tx_ref: S, attempts: u32) -> Self {
        Self::ConfirmationTimeout {
            tx_ref: tx_ref.into(),
            attempts,
        }
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a cryptographic error
    pub fn crypto<S: Into<String>>(msg: S) -> Self {
        Self::Crypto(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create an integration error
    pub fn integration<S: Into<String>>(msg: S) -> Self {
        Self::Integration(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the caller may usefully retry the same request later.
    ///
    /// Policy violations and cryptographic failures are never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConfirmationTimeout { .. } | Self::Integration(_))
    }

    /// HTTP status the web layer should answer with
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::PreconditionFailed(_) => 400,
            Self::InvalidOrExpiredToken | Self::Unauthorized(_) => 403,
            Self::NotFound(_) => 404,
            Self::InvalidTransition { .. } => 409,
            Self::AuthenticationFailure => 422,
            Self::ContractReverted(_) => 424,
            Self::Integration(_) => 502,
            Self::ConfirmationTimeout { .. } => 504,
            Self::Crypto(_)
            | Self::Config(_)
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Internal(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_errors_are_not_retryable() {
        assert!(!EscrowError::AuthenticationFailure.is_retryable());
        assert!(!EscrowError::InvalidOrExpiredToken.is_retryable());
        assert!(!EscrowError::unauthorized("client only").is_retryable());
        assert!(!EscrowError::invalid_transition("approved", "delivered", "monotonic").is_retryable());
        assert!(EscrowError::confirmation_timeout("0.0.1@1", 10).is_retryable());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(EscrowError::InvalidOrExpiredToken.status_code(), 403);
        assert_eq!(EscrowError::not_found("job").status_code(), 404);
        assert_eq!(EscrowError::precondition("no freelancer").status_code(), 400);
        assert_eq!(EscrowError::confirmation_timeout("tx", 3).status_code(), 504);
    }

    #[test]
    fn test_timeout_message_names_transaction() {
        let err = EscrowError::confirmation_timeout("0.0.42@1700000000.1", 5);
        assert_eq!(
            err.to_string(),
            "Confirmation timeout: transaction 0.0.42@1700000000.1 not confirmed after 5 attempts"
        );
    }
}
