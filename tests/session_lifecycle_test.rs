//! Session lifecycle scenarios against a scripted bus.

use async_trait::async_trait;
use secrecy::{ExposeSecret, Secret};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use buslink::crypto::{self, SessionKeyPair};
use buslink::remote::{
    AccessControl, BusError, BusIdentity, CertificateChallenge, EncryptedAuth, LoginError,
    RenewAnswer, SharedAuthSecret,
};
use buslink::config::SessionOptions;
use buslink::session::{Session, SessionState};
use buslink::Login;

const TEST_KEY_BITS: usize = 1024;

#[derive(Clone, Copy)]
enum RenewScript {
    Granted(u32),
    Unknown,
    Transient,
}

/// Scripted access-control service for one test.
struct ScriptedBus {
    bus_keys: SessionKeyPair,
    identity: BusIdentity,
    validity: u32,
    login_delay: Duration,
    renew: Mutex<RenewScript>,
    logout_ok: bool,
    passwords: Mutex<HashMap<String, String>>,
    registered: Mutex<HashMap<String, Vec<u8>>>,
    shared_attempts: Mutex<HashMap<String, (String, Vec<u8>)>>,
    valid: Mutex<HashSet<String>>,
    login_seq: AtomicUsize,
    logout_calls: AtomicUsize,
    renew_calls: AtomicUsize,
}

impl ScriptedBus {
    fn new(validity: u32) -> Self {
        let bus_keys = SessionKeyPair::generate_with_bits(TEST_KEY_BITS).unwrap();
        let identity = BusIdentity {
            bus_id: "bus-1".into(),
            public_key_der: bus_keys.public_key_der().to_vec(),
        };
        Self {
            bus_keys,
            identity,
            validity,
            login_delay: Duration::ZERO,
            renew: Mutex::new(RenewScript::Granted(60)),
            logout_ok: true,
            passwords: Mutex::new(HashMap::new()),
            registered: Mutex::new(HashMap::new()),
            shared_attempts: Mutex::new(HashMap::new()),
            valid: Mutex::new(HashSet::new()),
            login_seq: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            renew_calls: AtomicUsize::new(0),
        }
    }

    fn with_password(self, entity: &str, password: &str) -> Self {
        self.passwords
            .lock()
            .unwrap()
            .insert(entity.into(), password.into());
        self
    }

    fn grant(&self, entity: &str) -> Login {
        let n = self.login_seq.fetch_add(1, Ordering::SeqCst);
        let login = Login::new(format!("login-{n}"), entity, self.validity);
        self.valid.lock().unwrap().insert(login.id.clone());
        login
    }

    /// Check the sealed blob's secret half against an expected secret.
    fn check_auth(&self, auth: &EncryptedAuth, expected_secret: &[u8]) -> bool {
        match self.bus_keys.decrypt(&auth.payload) {
            Ok(blob) => {
                blob.len() == 64 && blob[32..] == Sha256::digest(expected_secret)[..]
            }
            Err(_) => false,
        }
    }
}

#[async_trait]
impl AccessControl for ScriptedBus {
    async fn bus_identity(&self) -> Result<BusIdentity, BusError> {
        Ok(self.identity.clone())
    }

    async fn login_by_password(
        &self,
        entity: &str,
        domain: &str,
        auth: EncryptedAuth,
    ) -> Result<Login, LoginError> {
        tokio::time::sleep(self.login_delay).await;
        if domain != "test" {
            return Err(LoginError::UnknownDomain {
                domain: domain.into(),
            });
        }
        let expected = self
            .passwords
            .lock()
            .unwrap()
            .get(entity)
            .cloned()
            .ok_or_else(|| LoginError::AccessDenied {
                entity: entity.into(),
            })?;
        if !self.check_auth(&auth, expected.as_bytes()) {
            return Err(LoginError::AccessDenied {
                entity: entity.into(),
            });
        }
        Ok(self.grant(entity))
    }

    async fn start_certificate_login(
        &self,
        entity: &str,
    ) -> Result<CertificateChallenge, LoginError> {
        let registered = self.registered.lock().unwrap().get(entity).cloned();
        let Some(public_der) = registered else {
            return Err(LoginError::MissingCertificate {
                entity: entity.into(),
            });
        };
        let challenge = Sha256::digest(entity.as_bytes()).to_vec();
        let encrypted = crypto::encrypt_to(&public_der, &challenge)
            .map_err(|e| LoginError::ServiceFailure(e.to_string()))?;
        Ok(CertificateChallenge {
            attempt: format!("cert:{entity}"),
            encrypted,
        })
    }

    async fn login_by_certificate(
        &self,
        attempt: &str,
        auth: EncryptedAuth,
    ) -> Result<Login, LoginError> {
        let Some(entity) = attempt.strip_prefix("cert:") else {
            return Err(LoginError::ServiceFailure("unknown attempt".into()));
        };
        let challenge = Sha256::digest(entity.as_bytes()).to_vec();
        if !self.check_auth(&auth, &challenge) {
            return Err(LoginError::AccessDenied {
                entity: entity.into(),
            });
        }
        Ok(self.grant(entity))
    }

    async fn start_shared_auth(&self, login_id: &str) -> Result<SharedAuthSecret, LoginError> {
        if !self.valid.lock().unwrap().contains(login_id) {
            return Err(LoginError::ServiceFailure("unknown login".into()));
        }
        let attempt = format!("shared:{login_id}");
        let secret = Sha256::digest(attempt.as_bytes()).to_vec();
        self.shared_attempts
            .lock()
            .unwrap()
            .insert(attempt.clone(), ("shared-entity".into(), secret.clone()));
        Ok(SharedAuthSecret {
            attempt,
            secret: Secret::new(secret),
        })
    }

    async fn login_by_shared_auth(
        &self,
        secret: &SharedAuthSecret,
        auth: EncryptedAuth,
    ) -> Result<Login, LoginError> {
        let stored = self.shared_attempts.lock().unwrap().remove(&secret.attempt);
        let Some((entity, expected)) = stored else {
            return Err(LoginError::ServiceFailure("unknown attempt".into()));
        };
        if secret.secret.expose_secret() != &expected || !self.check_auth(&auth, &expected) {
            return Err(LoginError::AccessDenied { entity });
        }
        Ok(self.grant(&entity))
    }

    async fn renew_lease(&self, _login_id: &str) -> Result<RenewAnswer, BusError> {
        self.renew_calls.fetch_add(1, Ordering::SeqCst);
        match *self.renew.lock().unwrap() {
            RenewScript::Granted(validity_secs) => Ok(RenewAnswer::Granted { validity_secs }),
            RenewScript::Unknown => Ok(RenewAnswer::UnknownLogin),
            RenewScript::Transient => Err(BusError::Comms("flaky wire".into())),
        }
    }

    async fn logout(&self, login_id: &str) -> Result<(), BusError> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        if !self.logout_ok {
            return Err(BusError::Comms("bus went away".into()));
        }
        self.valid.lock().unwrap().remove(login_id);
        Ok(())
    }

    async fn is_valid(&self, login_id: &str) -> Result<bool, BusError> {
        Ok(self.valid.lock().unwrap().contains(login_id))
    }

    async fn are_valid(&self, login_ids: &[String]) -> Result<Vec<bool>, BusError> {
        let valid = self.valid.lock().unwrap();
        Ok(login_ids.iter().map(|id| valid.contains(id)).collect())
    }

    async fn invalidate_login(&self, login_id: &str) -> Result<bool, BusError> {
        Ok(self.valid.lock().unwrap().remove(login_id))
    }
}

fn session_over(bus: Arc<ScriptedBus>) -> Arc<Session> {
    let _ = env_logger::builder().is_test(true).try_init();
    let keys = SessionKeyPair::generate_with_bits(TEST_KEY_BITS).unwrap();
    Session::with_keys(bus, SessionOptions::default(), keys)
}

#[tokio::test]
async fn test_password_login_and_logout() {
    let bus = Arc::new(ScriptedBus::new(60).with_password("alice", "hunter2"));
    let session = session_over(bus.clone());

    let login = session
        .login_by_password("alice", "hunter2", "test")
        .await
        .unwrap();
    assert_eq!(login.entity, "alice");
    assert_eq!(session.current_login().unwrap().id, login.id);
    assert_eq!(session.state(), SessionState::LoggedIn(login.clone()));
    assert_eq!(session.bus_id().as_deref(), Some("bus-1"));

    assert!(session.logout().await);
    assert_eq!(session.current_login(), None);
    assert_eq!(session.state(), SessionState::LoggedOut);
    assert_eq!(bus.logout_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_logout_is_idempotent() {
    let bus = Arc::new(ScriptedBus::new(60).with_password("alice", "pw"));
    let session = session_over(bus.clone());

    // Logged out already: a no-op with a negative answer.
    assert!(!session.logout().await);
    assert_eq!(bus.logout_calls.load(Ordering::SeqCst), 0);

    session.login_by_password("alice", "pw", "test").await.unwrap();
    assert!(session.logout().await);
    assert!(!session.logout().await);
    assert_eq!(bus.logout_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_local_logout_wins_over_remote_failure() {
    let mut bus = ScriptedBus::new(60).with_password("alice", "pw");
    bus.logout_ok = false;
    let session = session_over(Arc::new(bus));

    session.login_by_password("alice", "pw", "test").await.unwrap();
    // The bus never confirms, but this session must not claim to be
    // authenticated afterwards.
    assert!(!session.logout().await);
    assert_eq!(session.current_login(), None);
}

#[tokio::test]
async fn test_wrong_password_rejected_and_state_reset() {
    let bus = Arc::new(ScriptedBus::new(60).with_password("alice", "right"));
    let session = session_over(bus);

    let err = session
        .login_by_password("alice", "wrong", "test")
        .await
        .unwrap_err();
    assert!(matches!(err, LoginError::AccessDenied { .. }));
    assert_eq!(session.state(), SessionState::LoggedOut);

    // The failed attempt does not poison the session.
    session
        .login_by_password("alice", "right", "test")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_unknown_domain_rejected() {
    let bus = Arc::new(ScriptedBus::new(60).with_password("alice", "pw"));
    let session = session_over(bus);
    let err = session
        .login_by_password("alice", "pw", "prod")
        .await
        .unwrap_err();
    assert!(matches!(err, LoginError::UnknownDomain { .. }));
}

#[tokio::test]
async fn test_second_login_fails_and_leaves_login_unchanged() {
    let bus = Arc::new(ScriptedBus::new(60).with_password("alice", "pw"));
    let session = session_over(bus);

    let first = session.login_by_password("alice", "pw", "test").await.unwrap();
    let err = session
        .login_by_password("alice", "pw", "test")
        .await
        .unwrap_err();
    assert!(matches!(err, LoginError::AlreadyLoggedIn));
    assert_eq!(session.current_login().unwrap().id, first.id);
}

#[tokio::test]
async fn test_login_while_authenticating_fails() {
    let mut bus = ScriptedBus::new(60).with_password("alice", "pw");
    bus.login_delay = Duration::from_millis(200);
    let session = session_over(Arc::new(bus));

    let racing = {
        let session = session.clone();
        tokio::spawn(async move { session.login_by_password("alice", "pw", "test").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = session
        .login_by_password("alice", "pw", "test")
        .await
        .unwrap_err();
    assert!(matches!(err, LoginError::AlreadyLoggedIn));

    racing.await.unwrap().unwrap();
    assert!(session.current_login().is_some());
}

#[tokio::test]
async fn test_certificate_login_flow() {
    let bus = ScriptedBus::new(60);
    let registered = SessionKeyPair::generate_with_bits(TEST_KEY_BITS).unwrap();
    bus.registered
        .lock()
        .unwrap()
        .insert("service".into(), registered.public_key_der().to_vec());
    let session = session_over(Arc::new(bus));

    let login = session
        .login_by_private_key("service", &registered)
        .await
        .unwrap();
    assert_eq!(login.entity, "service");
}

#[tokio::test]
async fn test_certificate_login_without_registration() {
    let bus = Arc::new(ScriptedBus::new(60));
    let key = SessionKeyPair::generate_with_bits(TEST_KEY_BITS).unwrap();
    let session = session_over(bus);

    let err = session.login_by_private_key("ghost", &key).await.unwrap_err();
    assert!(matches!(err, LoginError::MissingCertificate { .. }));
    assert_eq!(session.state(), SessionState::LoggedOut);
}

#[tokio::test]
async fn test_shared_auth_continuation() {
    let bus = Arc::new(ScriptedBus::new(60).with_password("alice", "pw"));
    let first = session_over(bus.clone());
    first.login_by_password("alice", "pw", "test").await.unwrap();

    let secret = first.start_shared_auth().await.unwrap();

    let second = session_over(bus);
    let login = second.login_by_shared_auth(&secret).await.unwrap();
    assert_eq!(login.entity, "shared-entity");
    assert!(second.current_login().is_some());
}

#[tokio::test]
async fn test_start_shared_auth_requires_login() {
    let bus = Arc::new(ScriptedBus::new(60));
    let session = session_over(bus);
    let err = session.start_shared_auth().await.unwrap_err();
    assert!(matches!(err, LoginError::NotLoggedIn));
}

#[tokio::test]
async fn test_forced_invalidation_notifies_before_clearing() {
    let bus = ScriptedBus::new(1).with_password("alice", "pw");
    *bus.renew.lock().unwrap() = RenewScript::Unknown;
    let session = session_over(Arc::new(bus));

    let mut subscription = session.subscribe_invalidation();
    let held = session.login_by_password("alice", "pw", "test").await.unwrap();

    // The 1s lease expires and renewal answers "unknown login".
    let event = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
        .await
        .expect("invalidation was never delivered")
        .unwrap();

    // Observers see the login that was held, not an empty slot.
    assert_eq!(event.login.id, held.id);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(session.current_login(), None);
    assert_eq!(session.state(), SessionState::LoggedOut);
}

#[tokio::test]
async fn test_every_subscriber_is_notified() {
    let bus = ScriptedBus::new(1).with_password("alice", "pw");
    *bus.renew.lock().unwrap() = RenewScript::Unknown;
    let session = session_over(Arc::new(bus));

    let mut first = session.subscribe_invalidation();
    let dropped = session.subscribe_invalidation();
    let mut last = session.subscribe_invalidation();
    drop(dropped);

    session.login_by_password("alice", "pw", "test").await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), first.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.login.entity, "alice");
    // A dropped subscriber in the middle does not starve later ones.
    assert!(last.try_recv().is_some());
}

#[tokio::test]
async fn test_renewal_adopts_new_validity_window() {
    let bus = ScriptedBus::new(1).with_password("alice", "pw");
    *bus.renew.lock().unwrap() = RenewScript::Granted(9);
    let bus = Arc::new(bus);
    let session = session_over(bus.clone());

    session.login_by_password("alice", "pw", "test").await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert!(bus.renew_calls.load(Ordering::SeqCst) >= 1);
    // The held login was replaced wholesale with the renewed window.
    assert_eq!(session.current_login().unwrap().validity_secs, 9);
    assert!(matches!(session.state(), SessionState::LoggedIn(_)));
}

#[tokio::test]
async fn test_transient_renewal_failure_keeps_login() {
    let bus = ScriptedBus::new(1).with_password("alice", "pw");
    *bus.renew.lock().unwrap() = RenewScript::Transient;
    let bus = Arc::new(bus);
    let session = session_over(bus.clone());

    let login = session.login_by_password("alice", "pw", "test").await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert!(bus.renew_calls.load(Ordering::SeqCst) >= 1);
    // Only a definitive negative forces invalidation.
    assert_eq!(session.current_login().unwrap().id, login.id);
}

#[tokio::test]
async fn test_renewal_stops_after_logout() {
    let bus = Arc::new(ScriptedBus::new(1).with_password("alice", "pw"));
    let session = session_over(bus.clone());

    session.login_by_password("alice", "pw", "test").await.unwrap();
    session.logout().await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(bus.renew_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_wait_login_times_out_neutrally() {
    let bus = Arc::new(ScriptedBus::new(60).with_password("alice", "pw"));
    let session = session_over(bus);

    assert_eq!(
        session.wait_login(Some(Duration::from_millis(50))).await,
        None
    );

    // The timed-out wait left nothing disturbed for the next caller.
    let waiter = {
        let session = session.clone();
        tokio::spawn(async move { session.wait_login(Some(Duration::from_secs(5))).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    session.login_by_password("alice", "pw", "test").await.unwrap();

    let login = waiter.await.unwrap().expect("waiter missed the login");
    assert_eq!(login.entity, "alice");
}
