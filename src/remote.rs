//! Client-side contract for the bus's access-control service.
//!
//! The wire formats of these operations belong to the bus and are not
//! redefined here; this trait is the seam the rest of the library (and
//! the tests, through mock implementations) talk through.

use async_trait::async_trait;
use secrecy::Secret;
use std::time::Duration;
use thiserror::Error;

use crate::chain::types::Login;

/// Transport-class and application-class failures of a remote bus call.
///
/// Transient transport faults are retried transparently against alternate
/// replicas; a definitive application-level answer never is.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus unreachable at {endpoint}: {reason}")]
    Unreachable { endpoint: String, reason: String },

    #[error("bus call timed out after {0:?}")]
    Timeout(Duration),

    #[error("communication failure: {0}")]
    Comms(String),

    #[error("bus rejected the call: {0}")]
    Rejected(String),
}

/// Failures the replica failover path may transparently retry.
///
/// Only transport-class faults qualify; a definitive application-level
/// reply must never be re-issued.
pub trait TransientFault {
    fn is_transient(&self) -> bool;
}

impl TransientFault for BusError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            BusError::Unreachable { .. } | BusError::Timeout(_) | BusError::Comms(_)
        )
    }
}

/// Authentication failures and session-state violations.
#[derive(Debug, Error)]
pub enum LoginError {
    #[error("access denied for entity {entity}")]
    AccessDenied { entity: String },

    #[error("unknown authentication domain: {domain}")]
    UnknownDomain { domain: String },

    #[error("too many failed login attempts; retry after {penalty_secs}s")]
    TooManyAttempts { penalty_secs: u32 },

    #[error("no certificate registered for entity {entity}")]
    MissingCertificate { entity: String },

    #[error("session already has a login or a login attempt in flight")]
    AlreadyLoggedIn,

    #[error("session is not logged in")]
    NotLoggedIn,

    #[error("chain targets entity {target}, not this session's entity")]
    WrongTarget { target: String },

    #[error("access-control service failure: {0}")]
    ServiceFailure(String),

    #[error(transparent)]
    Bus(#[from] BusError),
}

impl TransientFault for LoginError {
    fn is_transient(&self) -> bool {
        matches!(self, LoginError::Bus(e) if e.is_transient())
    }
}

/// Bus identity advertised to clients: the bus id every chain is stamped
/// with, and the public key login payloads are encrypted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusIdentity {
    pub bus_id: String,
    /// DER-encoded RSA public key.
    pub public_key_der: Vec<u8>,
}

/// Opaque authentication payload, already encrypted to the bus key.
///
/// Authentication data is never sent in the clear; callers build this
/// through [`crate::crypto::seal_auth`].
#[derive(Debug, Clone)]
pub struct EncryptedAuth {
    pub payload: Vec<u8>,
}

/// Challenge issued by the bus during the certificate login flow,
/// encrypted to the entity's registered public key.
#[derive(Debug, Clone)]
pub struct CertificateChallenge {
    pub attempt: String,
    pub encrypted: Vec<u8>,
}

/// Continuation handle for a shared-secret login started elsewhere.
pub struct SharedAuthSecret {
    pub attempt: String,
    pub secret: Secret<Vec<u8>>,
}

impl std::fmt::Debug for SharedAuthSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedAuthSecret")
            .field("attempt", &self.attempt)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Outcome of a lease renewal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewAnswer {
    /// Lease extended; the new validity window in seconds.
    Granted { validity_secs: u32 },
    /// The bus no longer knows the login. Definitive: the login is gone.
    UnknownLogin,
}

/// Remote operations consumed from the bus's access-control service.
#[async_trait]
pub trait AccessControl: Send + Sync {
    /// Fetch the bus id and public key. Needed before any login handshake
    /// can encrypt its payload.
    async fn bus_identity(&self) -> Result<BusIdentity, BusError>;

    async fn login_by_password(
        &self,
        entity: &str,
        domain: &str,
        auth: EncryptedAuth,
    ) -> Result<Login, LoginError>;

    /// Open a certificate login attempt; the bus answers with a challenge
    /// only the holder of the registered private key can decrypt.
    async fn start_certificate_login(
        &self,
        entity: &str,
    ) -> Result<CertificateChallenge, LoginError>;

    /// Answer a certificate challenge with the decrypted proof, sealed
    /// back to the bus key.
    async fn login_by_certificate(
        &self,
        attempt: &str,
        auth: EncryptedAuth,
    ) -> Result<Login, LoginError>;

    /// Start a shared-secret handshake on behalf of the current login.
    async fn start_shared_auth(&self, login_id: &str) -> Result<SharedAuthSecret, LoginError>;

    /// Complete a shared-secret handshake started by another session.
    async fn login_by_shared_auth(
        &self,
        secret: &SharedAuthSecret,
        auth: EncryptedAuth,
    ) -> Result<Login, LoginError>;

    async fn renew_lease(&self, login_id: &str) -> Result<RenewAnswer, BusError>;

    /// Invalidate the login on the bus. `Ok(())` means the bus confirmed.
    async fn logout(&self, login_id: &str) -> Result<(), BusError>;

    async fn is_valid(&self, login_id: &str) -> Result<bool, BusError>;

    /// Batched validity check; the answer vector is positionally aligned
    /// with the queried ids.
    async fn are_valid(&self, login_ids: &[String]) -> Result<Vec<bool>, BusError>;

    /// Administratively revoke a login (requires authorization bus-side).
    async fn invalidate_login(&self, login_id: &str) -> Result<bool, BusError>;
}
