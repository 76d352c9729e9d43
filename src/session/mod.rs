//! Per-identity login lifecycle.
//!
//! A [`Session`] is the unit of authentication: it owns at most one
//! bus-issued login, one keypair, the joined-chain bindings of its
//! execution contexts, and the background task renewing its lease. A
//! process may hold many sessions, to one bus or several, without
//! interference; there is no process-wide session singleton.
//!
//! All state transitions are serialized under one internal lock, and the
//! current login is published through a watch channel so readers always
//! see an atomic snapshot.

mod observer;
mod renewer;

pub use observer::{InvalidationEvent, InvalidationSubscription};

use log::{info, warn};
use once_cell::sync::OnceCell;
use secrecy::ExposeSecret;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use crate::chain::types::{CallChain, Login};
use crate::config::SessionOptions;
use crate::crypto::{self, KeyError, SessionKeyPair};
use crate::remote::{AccessControl, BusError, BusIdentity, LoginError, SharedAuthSecret};
use crate::session::observer::ObserverRegistry;
use crate::session::renewer::Renewer;

/// Where a session stands in its login lifecycle.
///
/// `Invalid` is a transient marker held while a forced invalidation fans
/// out, so the last-known login can still be inspected by observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    LoggedOut,
    Authenticating,
    LoggedIn(Login),
    Invalid(Login),
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of one logical thread of control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

/// One execution context: the scope a joined chain is bound to.
///
/// Chain bindings are keyed per context, never per process, so two
/// concurrent requests sharing a session cannot see each other's joined
/// chain.
#[derive(Debug)]
pub struct CallContext {
    id: ContextId,
}

impl CallContext {
    pub fn new() -> Self {
        Self {
            id: ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

/// One authenticated identity on one bus.
pub struct Session {
    bus: Arc<dyn AccessControl>,
    keys: SessionKeyPair,
    options: SessionOptions,
    bus_identity: OnceCell<BusIdentity>,
    state: Mutex<SessionState>,
    login_tx: watch::Sender<Option<Login>>,
    observers: ObserverRegistry,
    chains: Mutex<HashMap<ContextId, CallChain>>,
    renewer: Mutex<Option<Renewer>>,
}

impl Session {
    /// Create a session against one bus.
    ///
    /// The keypair comes from the `access.key` option when set, otherwise
    /// a fresh one is generated.
    pub fn new(bus: Arc<dyn AccessControl>, options: SessionOptions) -> Result<Arc<Self>, KeyError> {
        let keys = match &options.access_key_path {
            Some(path) => SessionKeyPair::from_pkcs8_pem_file(path)?,
            None => SessionKeyPair::generate()?,
        };
        Ok(Self::with_keys(bus, options, keys))
    }

    /// Create a session with explicit key material.
    pub fn with_keys(
        bus: Arc<dyn AccessControl>,
        options: SessionOptions,
        keys: SessionKeyPair,
    ) -> Arc<Self> {
        let (login_tx, _) = watch::channel(None);
        Arc::new(Self {
            bus,
            keys,
            options,
            bus_identity: OnceCell::new(),
            state: Mutex::new(SessionState::LoggedOut),
            login_tx,
            observers: ObserverRegistry::default(),
            chains: Mutex::new(HashMap::new()),
            renewer: Mutex::new(None),
        })
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// The bus id this session authenticated against, once known.
    pub fn bus_id(&self) -> Option<String> {
        self.bus_identity.get().map(|b| b.bus_id.clone())
    }

    /// Atomic snapshot of the held login.
    pub fn current_login(&self) -> Option<Login> {
        self.login_tx.borrow().clone()
    }

    /// Entity of the held login.
    pub fn entity(&self) -> Option<String> {
        self.current_login().map(|l| l.entity)
    }

    /// Snapshot of the lifecycle state.
    pub fn state(&self) -> SessionState {
        self.lock_state().clone()
    }

    /// Subscribe to forced-invalidation events.
    pub fn subscribe_invalidation(&self) -> InvalidationSubscription {
        self.observers.subscribe()
    }

    // ---- Login flows ------------------------------------------------

    /// Authenticate with entity, password and domain.
    pub async fn login_by_password(
        self: &Arc<Self>,
        entity: &str,
        password: &str,
        domain: &str,
    ) -> Result<Login, LoginError> {
        self.begin_authentication()?;
        let result = async {
            let bus_identity = self.ensure_bus_identity().await?;
            let auth = crypto::seal_auth(
                &bus_identity.public_key_der,
                self.keys.public_key_der(),
                password.as_bytes(),
            )
            .map_err(|e| LoginError::ServiceFailure(e.to_string()))?;
            self.bus.login_by_password(entity, domain, auth).await
        }
        .await;
        self.settle_authentication(result)
    }

    /// Authenticate with the entity's registered private key.
    ///
    /// The bus challenges with bytes encrypted to the registered public
    /// key; the proof is the decrypted challenge sealed back to the bus.
    pub async fn login_by_private_key(
        self: &Arc<Self>,
        entity: &str,
        key: &SessionKeyPair,
    ) -> Result<Login, LoginError> {
        self.begin_authentication()?;
        let result = async {
            let bus_identity = self.ensure_bus_identity().await?;
            let challenge = self.bus.start_certificate_login(entity).await?;
            let answer = key
                .decrypt(&challenge.encrypted)
                .map_err(|_| LoginError::AccessDenied {
                    entity: entity.to_string(),
                })?;
            let auth = crypto::seal_auth(
                &bus_identity.public_key_der,
                self.keys.public_key_der(),
                &answer,
            )
            .map_err(|e| LoginError::ServiceFailure(e.to_string()))?;
            self.bus.login_by_certificate(&challenge.attempt, auth).await
        }
        .await;
        self.settle_authentication(result)
    }

    /// Open a shared-secret handshake for another session to continue.
    pub async fn start_shared_auth(&self) -> Result<SharedAuthSecret, LoginError> {
        let login = self.current_login().ok_or(LoginError::NotLoggedIn)?;
        self.bus.start_shared_auth(&login.id).await
    }

    /// Continue a shared-secret handshake started elsewhere.
    pub async fn login_by_shared_auth(
        self: &Arc<Self>,
        secret: &SharedAuthSecret,
    ) -> Result<Login, LoginError> {
        self.begin_authentication()?;
        let result = async {
            let bus_identity = self.ensure_bus_identity().await?;
            let auth = crypto::seal_auth(
                &bus_identity.public_key_der,
                self.keys.public_key_der(),
                secret.secret.expose_secret(),
            )
            .map_err(|e| LoginError::ServiceFailure(e.to_string()))?;
            self.bus.login_by_shared_auth(secret, auth).await
        }
        .await;
        self.settle_authentication(result)
    }

    /// Invalidate the login locally and on the bus.
    ///
    /// Returns whether the bus confirmed the invalidation. The local
    /// logout always happens first: this session never claims to be
    /// authenticated after `logout` was called, whatever the bus said.
    /// Calling on a logged-out session is a no-op answering `false`.
    pub async fn logout(&self) -> bool {
        let login = {
            let mut state = self.lock_state();
            if let SessionState::LoggedIn(login) = &*state {
                let login = login.clone();
                *state = SessionState::LoggedOut;
                Some(login)
            } else {
                None
            }
        };
        let Some(login) = login else {
            return false;
        };
        self.stop_renewer();
        self.login_tx.send_replace(None);
        info!("logged out login {}", login.short_id());
        match self.bus.logout(&login.id).await {
            Ok(()) => true,
            Err(e) => {
                warn!("bus did not confirm logout of {}: {e}", login.short_id());
                false
            }
        }
    }

    /// Block until a login is held.
    ///
    /// Returns `None` on timeout without disturbing the wait of any other
    /// caller; a subsequent call can pick the wait back up.
    pub async fn wait_login(&self, timeout: Option<Duration>) -> Option<Login> {
        let mut rx = self.login_tx.subscribe();
        let wait = async move {
            loop {
                if let Some(login) = rx.borrow_and_update().clone() {
                    return Some(login);
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.unwrap_or(None),
            None => wait.await,
        }
    }

    // ---- Joined chains ----------------------------------------------

    /// Bind a chain to an execution context so calls made from within it
    /// carry the chain as their lineage.
    ///
    /// Only a session whose entity equals the chain's target may join it.
    pub fn join_chain(&self, ctx: &CallContext, chain: CallChain) -> Result<(), LoginError> {
        let login = self.current_login().ok_or(LoginError::NotLoggedIn)?;
        if chain.target != login.entity {
            return Err(LoginError::WrongTarget {
                target: chain.target,
            });
        }
        self.lock_chains().insert(ctx.id(), chain);
        Ok(())
    }

    /// Unbind the context's joined chain, returning it.
    pub fn exit_chain(&self, ctx: &CallContext) -> Option<CallChain> {
        self.lock_chains().remove(&ctx.id())
    }

    /// Snapshot of the context's joined chain.
    pub fn joined_chain(&self, ctx: &CallContext) -> Option<CallChain> {
        self.lock_chains().get(&ctx.id()).cloned()
    }

    /// Build the chain an outbound call from `ctx` should carry.
    ///
    /// Extends the joined chain when one is bound, otherwise starts a
    /// fresh chain with zero originators. `None` while logged out or
    /// before the bus identity is known.
    pub fn chain_for(&self, ctx: &CallContext, target: &str) -> Option<CallChain> {
        let login = self.current_login()?;
        let bus_id = self.bus_id()?;
        Some(match self.joined_chain(ctx) {
            Some(joined) => joined.extended(login, target),
            None => CallChain::root(bus_id, target, login),
        })
    }

    // ---- Internals --------------------------------------------------

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_chains(&self) -> std::sync::MutexGuard<'_, HashMap<ContextId, CallChain>> {
        self.chains.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn ensure_bus_identity(&self) -> Result<BusIdentity, BusError> {
        if let Some(identity) = self.bus_identity.get() {
            return Ok(identity.clone());
        }
        let fetched = self.bus.bus_identity().await?;
        Ok(self.bus_identity.get_or_init(|| fetched).clone())
    }

    /// Reserve the single authentication slot.
    fn begin_authentication(&self) -> Result<(), LoginError> {
        let mut state = self.lock_state();
        match &*state {
            SessionState::LoggedOut => {
                *state = SessionState::Authenticating;
                Ok(())
            }
            _ => Err(LoginError::AlreadyLoggedIn),
        }
    }

    /// Adopt the handshake outcome reserved by `begin_authentication`.
    fn settle_authentication(
        self: &Arc<Self>,
        result: Result<Login, LoginError>,
    ) -> Result<Login, LoginError> {
        match result {
            Ok(login) => {
                {
                    let mut state = self.lock_state();
                    *state = SessionState::LoggedIn(login.clone());
                }
                self.login_tx.send_replace(Some(login.clone()));
                let renewer =
                    Renewer::spawn(Arc::downgrade(self), self.bus.clone(), login.clone());
                *self.renewer.lock().unwrap_or_else(|e| e.into_inner()) = Some(renewer);
                info!("logged in as {login}");
                Ok(login)
            }
            Err(e) => {
                let mut state = self.lock_state();
                if matches!(*state, SessionState::Authenticating) {
                    *state = SessionState::LoggedOut;
                }
                Err(e)
            }
        }
    }

    /// Adopt a renewed validity window, replacing the login wholesale.
    pub(crate) fn adopt_validity(&self, validity_secs: u32) {
        let updated = {
            let mut state = self.lock_state();
            if let SessionState::LoggedIn(login) = &*state {
                let updated = Login {
                    validity_secs,
                    ..login.clone()
                };
                *state = SessionState::LoggedIn(updated.clone());
                Some(updated)
            } else {
                None
            }
        };
        if let Some(login) = updated {
            self.login_tx.send_replace(Some(login));
        }
    }

    /// React to the bus invalidating the held login.
    ///
    /// Transition order is fixed: state turns `Invalid` first, then every
    /// subscriber is notified with the last-known login, and only then is
    /// the login cleared. Re-authentication is the observers' decision,
    /// never this library's.
    pub(crate) fn force_invalidate(&self) {
        let login = {
            let mut state = self.lock_state();
            if let SessionState::LoggedIn(login) = &*state {
                let login = login.clone();
                *state = SessionState::Invalid(login.clone());
                Some(login)
            } else {
                None
            }
        };
        let Some(login) = login else {
            return;
        };
        self.stop_renewer();
        warn!(
            "login {} invalidated by the bus; notifying {} observers",
            login.short_id(),
            self.observers.len()
        );
        self.observers.notify_all(&login);
        {
            let mut state = self.lock_state();
            *state = SessionState::LoggedOut;
        }
        self.login_tx.send_replace(None);
    }

    fn stop_renewer(&self) {
        if let Some(renewer) = self
            .renewer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            renewer.stop();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("bus_id", &self.bus_id())
            .finish()
    }
}
