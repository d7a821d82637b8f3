//! Credential broker capability.
//!
//! The broker mints short-lived cloud credentials from a role reference. The
//! concrete STS client lives outside this crate; the coordinator only sees
//! this trait. Broker calls happen outside any ledger transaction and carry
//! their own timeouts, so a hung provider cannot hold a database lock.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

/// Errors from credential issuance.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The request was malformed before any network call was made.
    #[error("invalid broker input: {reason}")]
    InvalidInput {
        /// What was wrong.
        reason: String,
    },

    /// The provider refused or failed to issue.
    #[error("credential issuance failed: {message}")]
    Issuance {
        /// Provider-reported failure.
        message: String,
    },
}

/// Inputs to one issuance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssumeRoleInput {
    /// Role to assume.
    pub role_arn: String,
    /// Provider region; empty means provider default.
    pub region: String,
    /// Credential lifetime in seconds.
    pub ttl_seconds: i64,
    /// Subject the session is attributed to.
    pub subject: String,
}

/// Ephemeral credentials returned by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Access key id.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
    /// Session token.
    pub session_token: String,
    /// Expiry time.
    pub expires_at: DateTime<Utc>,
}

/// Capability that mints ephemeral credentials.
pub trait CredentialBroker: Send + Sync {
    /// Assumes a role and returns ephemeral credentials.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] on invalid input or provider failure. The
    /// caller treats every failure as retryable.
    fn assume_role(&self, input: &AssumeRoleInput) -> Result<Credentials, BrokerError>;
}

/// Validates inputs shared by every broker implementation.
///
/// # Errors
///
/// Returns [`BrokerError::InvalidInput`] for an empty role or a
/// non-positive TTL.
pub fn validate_input(input: &AssumeRoleInput) -> Result<(), BrokerError> {
    if input.role_arn.is_empty() {
        return Err(BrokerError::InvalidInput {
            reason: "missing role arn".to_string(),
        });
    }
    if input.ttl_seconds <= 0 {
        return Err(BrokerError::InvalidInput {
            reason: format!("invalid ttl: {}", input.ttl_seconds),
        });
    }
    Ok(())
}

/// Broker returning placeholder credentials for local development and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct DevBroker;

impl CredentialBroker for DevBroker {
    fn assume_role(&self, input: &AssumeRoleInput) -> Result<Credentials, BrokerError> {
        validate_input(input)?;
        Ok(Credentials {
            access_key_id: "DEV_ACCESS_KEY".to_string(),
            secret_access_key: "DEV_SECRET_KEY".to_string(),
            session_token: "DEV_SESSION_TOKEN".to_string(),
            expires_at: Utc::now() + Duration::seconds(input.ttl_seconds),
        })
    }
}
