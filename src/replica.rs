//! Fault-tolerant selection over interchangeable bus replicas.
//!
//! The selector is process-wide shared state: an ordered, non-empty list
//! of endpoints and a cursor naming the one in use. The outbound call
//! path reacts to transient transport faults by advancing the cursor,
//! re-resolving the bus-facing remote references against the new
//! endpoint, and redirecting the in-flight call, bounded so a fully-dead
//! replica set surfaces the fault instead of looping forever.

use async_trait::async_trait;
use log::{info, warn};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::chain::types::Login;
use crate::remote::{
    AccessControl, BusError, BusIdentity, CertificateChallenge, EncryptedAuth, LoginError,
    RenewAnswer, SharedAuthSecret, TransientFault,
};

/// One bus replica's network address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplicaEndpoint {
    pub host: String,
    pub port: u16,
}

impl ReplicaEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ReplicaEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Ordered replica list with a wrapping cursor.
pub struct ReplicaSelector {
    endpoints: Vec<ReplicaEndpoint>,
    cursor: AtomicUsize,
}

impl ReplicaSelector {
    /// Build a selector over a non-empty endpoint list; `None` when the
    /// list is empty.
    pub fn new(endpoints: Vec<ReplicaEndpoint>) -> Option<Self> {
        if endpoints.is_empty() {
            return None;
        }
        Some(Self {
            endpoints,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// The endpoint currently in use.
    pub fn current(&self) -> ReplicaEndpoint {
        self.endpoints[self.cursor.load(Ordering::SeqCst) % self.endpoints.len()].clone()
    }

    /// Move the cursor to the next replica, wrapping around, and return
    /// the newly selected endpoint.
    pub fn advance(&self) -> ReplicaEndpoint {
        let previous = self
            .cursor
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                Some((c + 1) % self.endpoints.len())
            })
            .unwrap_or(0);
        self.endpoints[(previous + 1) % self.endpoints.len()].clone()
    }
}

impl fmt::Debug for ReplicaSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaSelector")
            .field("endpoints", &self.endpoints)
            .field("cursor", &self.cursor.load(Ordering::SeqCst))
            .finish()
    }
}

/// Run a bus call with transparent failover.
///
/// The call is attempted against the current endpoint; each transient
/// transport fault advances the cursor and redirects the call to the next
/// replica, for at most as many retries as there are known replicas. A
/// definitive application-level answer is returned immediately and never
/// re-issued, preserving at-most-once delivery of acknowledged calls.
pub async fn with_failover<T, E, F, Fut>(selector: &ReplicaSelector, mut call: F) -> Result<T, E>
where
    E: TransientFault + fmt::Display,
    F: FnMut(ReplicaEndpoint) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let retries = selector.len();
    let mut endpoint = selector.current();
    let mut attempt = 0;
    loop {
        match call(endpoint.clone()).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < retries => {
                attempt += 1;
                let next = selector.advance();
                warn!("replica {endpoint} failed ({e}); redirecting to {next}");
                endpoint = next;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Resolves a bus-facing remote reference for one endpoint.
///
/// Connections are expected to be lazy; a connector answer is the handle
/// calls go through, not proof the replica is up.
pub trait EndpointConnector: Send + Sync {
    fn connect(&self, endpoint: &ReplicaEndpoint) -> Arc<dyn AccessControl>;
}

/// Access-control facade that fails over across replicas.
///
/// Holds the reference resolved against the endpoint in use and
/// re-resolves it whenever the selector moves on, so callers never see a
/// transient fault a sibling replica could have absorbed.
pub struct FailoverBus {
    selector: Arc<ReplicaSelector>,
    connector: Arc<dyn EndpointConnector>,
    live: RwLock<Option<(ReplicaEndpoint, Arc<dyn AccessControl>)>>,
}

impl FailoverBus {
    pub fn new(selector: Arc<ReplicaSelector>, connector: Arc<dyn EndpointConnector>) -> Self {
        Self {
            selector,
            connector,
            live: RwLock::new(None),
        }
    }

    pub fn selector(&self) -> &Arc<ReplicaSelector> {
        &self.selector
    }

    /// The reference for `endpoint`, reusing the live one when it still
    /// points there.
    async fn resolved(&self, endpoint: &ReplicaEndpoint) -> Arc<dyn AccessControl> {
        {
            let live = self.live.read().await;
            if let Some((live_endpoint, client)) = live.as_ref() {
                if live_endpoint == endpoint {
                    return client.clone();
                }
            }
        }
        info!("resolving bus references against {endpoint}");
        let client = self.connector.connect(endpoint);
        let mut live = self.live.write().await;
        *live = Some((endpoint.clone(), client.clone()));
        client
    }
}

#[async_trait]
impl AccessControl for FailoverBus {
    async fn bus_identity(&self) -> Result<BusIdentity, BusError> {
        with_failover(&self.selector, |endpoint| async move {
            self.resolved(&endpoint).await.bus_identity().await
        })
        .await
    }

    async fn login_by_password(
        &self,
        entity: &str,
        domain: &str,
        auth: EncryptedAuth,
    ) -> Result<Login, LoginError> {
        let auth = &auth;
        with_failover(&self.selector, |endpoint| async move {
            self.resolved(&endpoint)
                .await
                .login_by_password(entity, domain, auth.clone())
                .await
        })
        .await
    }

    async fn start_certificate_login(
        &self,
        entity: &str,
    ) -> Result<CertificateChallenge, LoginError> {
        with_failover(&self.selector, |endpoint| async move {
            self.resolved(&endpoint)
                .await
                .start_certificate_login(entity)
                .await
        })
        .await
    }

    async fn login_by_certificate(
        &self,
        attempt: &str,
        auth: EncryptedAuth,
    ) -> Result<Login, LoginError> {
        let auth = &auth;
        with_failover(&self.selector, |endpoint| async move {
            self.resolved(&endpoint)
                .await
                .login_by_certificate(attempt, auth.clone())
                .await
        })
        .await
    }

    async fn start_shared_auth(&self, login_id: &str) -> Result<SharedAuthSecret, LoginError> {
        with_failover(&self.selector, |endpoint| async move {
            self.resolved(&endpoint).await.start_shared_auth(login_id).await
        })
        .await
    }

    async fn login_by_shared_auth(
        &self,
        secret: &SharedAuthSecret,
        auth: EncryptedAuth,
    ) -> Result<Login, LoginError> {
        let auth = &auth;
        with_failover(&self.selector, |endpoint| async move {
            self.resolved(&endpoint)
                .await
                .login_by_shared_auth(secret, auth.clone())
                .await
        })
        .await
    }

    async fn renew_lease(&self, login_id: &str) -> Result<RenewAnswer, BusError> {
        with_failover(&self.selector, |endpoint| async move {
            self.resolved(&endpoint).await.renew_lease(login_id).await
        })
        .await
    }

    async fn logout(&self, login_id: &str) -> Result<(), BusError> {
        with_failover(&self.selector, |endpoint| async move {
            self.resolved(&endpoint).await.logout(login_id).await
        })
        .await
    }

    async fn is_valid(&self, login_id: &str) -> Result<bool, BusError> {
        with_failover(&self.selector, |endpoint| async move {
            self.resolved(&endpoint).await.is_valid(login_id).await
        })
        .await
    }

    async fn are_valid(&self, login_ids: &[String]) -> Result<Vec<bool>, BusError> {
        with_failover(&self.selector, |endpoint| async move {
            self.resolved(&endpoint).await.are_valid(login_ids).await
        })
        .await
    }

    async fn invalidate_login(&self, login_id: &str) -> Result<bool, BusError> {
        with_failover(&self.selector, |endpoint| async move {
            self.resolved(&endpoint).await.invalidate_login(login_id).await
        })
        .await
    }
}
