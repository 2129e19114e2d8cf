//! Escrow core for encrypted freelance deliverables
//!
//! A client funds a job through an on-chain escrow contract, the freelancer
//! delivers a file that is stored encrypted, the client previews it through a
//! short-lived token, and approval releases a plaintext copy. This crate
//! implements:
//! - Streaming AES-256-GCM encryption of deliverables
//! - HS256 preview tokens bound to job and requester
//! - The job status state machine gating every cryptographic operation
//! - Confirmation of contract transactions through a mirror node

pub mod blob_store;
pub mod cipher_engine;
pub mod clock;
pub mod config;
pub mod error;
pub mod escrow_bridge;
pub mod gcm_stream;
pub mod job_manager;
pub mod job_store;
pub mod mocks;
pub mod models;
pub mod node;
pub mod preview_token;
pub mod secure_field;
pub mod telemetry;

use error::EscrowError;

pub use config::{EscrowConfig, EscrowSecrets};
pub use node::EscrowNode;

/// Result type alias for escrow operations
pub type EscrowResult<T> = Result<T, EscrowError>;
