//! Inbound identity validation against the bus.

use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;

use crate::chain::cache::{CacheAnswer, IdentityKey, LoginCache};
use crate::chain::error::ValidationError;
use crate::remote::AccessControl;

/// Seam between the inbound interception hook and the bus.
///
/// Abstracted so servers can be exercised against mock implementations.
#[async_trait]
pub trait LoginValidator: Send + Sync {
    /// Check that the identity is (still) valid on its bus.
    ///
    /// An `Ok(())` answer means the servant call may proceed. Both a
    /// definitive negative answer and a transport failure are errors: an
    /// identity that cannot be verified is never trusted.
    async fn validate(&self, identity: &IdentityKey) -> Result<(), ValidationError>;
}

/// Cache-first validator backed by the bus's `is_valid` operation.
pub struct BusLoginValidator {
    bus: Arc<dyn AccessControl>,
    cache: Arc<LoginCache>,
}

impl BusLoginValidator {
    pub fn new(bus: Arc<dyn AccessControl>, cache: Arc<LoginCache>) -> Self {
        Self { bus, cache }
    }

    pub fn cache(&self) -> &Arc<LoginCache> {
        &self.cache
    }
}

#[async_trait]
impl LoginValidator for BusLoginValidator {
    async fn validate(&self, identity: &IdentityKey) -> Result<(), ValidationError> {
        if self.cache.lookup(identity) == CacheAnswer::Fresh {
            debug!("cache hit for login {}", &identity.login_id);
            return Ok(());
        }

        debug!("cache miss for login {}, asking the bus", &identity.login_id);
        match self.bus.is_valid(&identity.login_id).await {
            Ok(true) => {
                self.cache.insert(identity.clone());
                Ok(())
            }
            Ok(false) => {
                warn!("bus rejected login {}", &identity.login_id);
                self.cache.remove(identity);
                Err(ValidationError::Invalid {
                    login_id: identity.login_id.clone(),
                })
            }
            Err(e) => Err(ValidationError::Bus(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::types::Login;
    use crate::remote::{
        BusError, BusIdentity, CertificateChallenge, EncryptedAuth, LoginError, RenewAnswer,
        SharedAuthSecret,
    };
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Bus double answering validity from a fixed set and counting the
    /// remote round trips it is asked for.
    pub struct MockBus {
        pub valid: Mutex<HashSet<String>>,
        pub round_trips: AtomicUsize,
        pub fail_transport: bool,
    }

    impl MockBus {
        pub fn with_valid(ids: &[&str]) -> Self {
            Self {
                valid: Mutex::new(ids.iter().map(|s| s.to_string()).collect()),
                round_trips: AtomicUsize::new(0),
                fail_transport: false,
            }
        }
    }

    #[async_trait]
    impl AccessControl for MockBus {
        async fn bus_identity(&self) -> Result<BusIdentity, BusError> {
            Ok(BusIdentity {
                bus_id: "bus-1".into(),
                public_key_der: Vec::new(),
            })
        }

        async fn login_by_password(
            &self,
            _entity: &str,
            _domain: &str,
            _auth: EncryptedAuth,
        ) -> Result<Login, LoginError> {
            Err(LoginError::ServiceFailure("not wired".into()))
        }

        async fn start_certificate_login(
            &self,
            entity: &str,
        ) -> Result<CertificateChallenge, LoginError> {
            Err(LoginError::MissingCertificate {
                entity: entity.into(),
            })
        }

        async fn login_by_certificate(
            &self,
            _attempt: &str,
            _auth: EncryptedAuth,
        ) -> Result<Login, LoginError> {
            Err(LoginError::ServiceFailure("not wired".into()))
        }

        async fn start_shared_auth(&self, _login_id: &str) -> Result<SharedAuthSecret, LoginError> {
            Err(LoginError::ServiceFailure("not wired".into()))
        }

        async fn login_by_shared_auth(
            &self,
            _secret: &SharedAuthSecret,
            _auth: EncryptedAuth,
        ) -> Result<Login, LoginError> {
            Err(LoginError::ServiceFailure("not wired".into()))
        }

        async fn renew_lease(&self, _login_id: &str) -> Result<RenewAnswer, BusError> {
            Ok(RenewAnswer::UnknownLogin)
        }

        async fn logout(&self, _login_id: &str) -> Result<(), BusError> {
            Ok(())
        }

        async fn is_valid(&self, login_id: &str) -> Result<bool, BusError> {
            self.round_trips.fetch_add(1, Ordering::SeqCst);
            if self.fail_transport {
                return Err(BusError::Comms("wire down".into()));
            }
            Ok(self.valid.lock().unwrap().contains(login_id))
        }

        async fn are_valid(&self, login_ids: &[String]) -> Result<Vec<bool>, BusError> {
            self.round_trips.fetch_add(1, Ordering::SeqCst);
            if self.fail_transport {
                return Err(BusError::Comms("wire down".into()));
            }
            let valid = self.valid.lock().unwrap();
            Ok(login_ids.iter().map(|id| valid.contains(id)).collect())
        }

        async fn invalidate_login(&self, login_id: &str) -> Result<bool, BusError> {
            Ok(self.valid.lock().unwrap().remove(login_id))
        }
    }

    fn identity(id: &str) -> IdentityKey {
        IdentityKey::new("bus-1", id)
    }

    #[tokio::test]
    async fn test_miss_validates_remotely_then_caches() {
        let bus = Arc::new(MockBus::with_valid(&["a1"]));
        let validator = BusLoginValidator::new(bus.clone(), Arc::new(LoginCache::new(4)));

        validator.validate(&identity("a1")).await.unwrap();
        validator.validate(&identity("a1")).await.unwrap();

        // Second call is served from the cache.
        assert_eq!(bus.round_trips.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_login_rejected_and_not_cached() {
        let bus = Arc::new(MockBus::with_valid(&[]));
        let validator = BusLoginValidator::new(bus.clone(), Arc::new(LoginCache::new(4)));

        let err = validator.validate(&identity("ghost")).await.unwrap_err();
        assert!(matches!(err, ValidationError::Invalid { .. }));
        assert!(validator.cache().is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure_is_an_error() {
        let mut bus = MockBus::with_valid(&["a1"]);
        bus.fail_transport = true;
        let validator = BusLoginValidator::new(Arc::new(bus), Arc::new(LoginCache::new(4)));

        let err = validator.validate(&identity("a1")).await.unwrap_err();
        assert!(matches!(err, ValidationError::Bus(_)));
    }

    #[tokio::test]
    async fn test_revalidation_task_drops_only_negatives() {
        use crate::chain::cache::RevalidationTask;
        use std::time::Duration;

        let bus = Arc::new(MockBus::with_valid(&["a1", "b2"]));
        let cache = Arc::new(LoginCache::new(4));
        cache.insert(identity("a1"));
        cache.insert(identity("b2"));

        // "b2" goes stale before the next batch runs.
        bus.valid.lock().unwrap().remove("b2");

        let task = RevalidationTask::spawn(
            cache.clone(),
            bus.clone(),
            "bus-1".into(),
            Duration::from_millis(20),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.shutdown().await;

        assert!(bus.round_trips.load(Ordering::SeqCst) >= 1);
        assert_eq!(cache.lookup(&identity("a1")), CacheAnswer::Fresh);
        assert_eq!(cache.lookup(&identity("b2")), CacheAnswer::Unknown);
    }
}
