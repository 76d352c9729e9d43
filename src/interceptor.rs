//! Call interception pipeline.
//!
//! The outbound hook attaches the calling identity to every request made
//! through a session; the inbound hook extracts, resolves and validates
//! it before servant code runs. No internal fault ever escapes into
//! servant code from here: everything is caught at the boundary and
//! mapped to a permission-denied fault with a sub-code naming the cause.

use log::{debug, warn};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use thiserror::Error;

use crate::chain::cache::IdentityKey;
use crate::chain::codec::{
    decode_chain, decode_credential, encode_chain, encode_credential, CHAIN_CONTEXT_TAG,
    LEGACY_CONTEXT_TAG,
};
use crate::chain::error::ValidationError;
use crate::chain::types::{CallChain, Credential};
use crate::chain::validator::LoginValidator;
use crate::remote::LoginError;
use crate::session::{CallContext, Session};

/// Operations that exist purely for transport bookkeeping. They carry no
/// identity and must never require authentication.
pub const META_OPERATIONS: &[&str] = &[
    "_is_a",
    "_non_existent",
    "_interface",
    "_component",
    "_get_policy",
];

/// One outbound or inbound call, as the interception hooks see it.
///
/// `contexts` is the per-call side channel: one entry per fixed 4-byte
/// tag. Responses carry none.
#[derive(Debug, Clone)]
pub struct CallRequest {
    /// Target object identifier.
    pub object: String,
    /// Operation name.
    pub operation: String,
    /// Entity the target object belongs to.
    pub target_entity: String,
    /// Side-channel context entries.
    pub contexts: HashMap<[u8; 4], Vec<u8>>,
}

impl CallRequest {
    pub fn new(
        object: impl Into<String>,
        operation: impl Into<String>,
        target_entity: impl Into<String>,
    ) -> Self {
        Self {
            object: object.into(),
            operation: operation.into(),
            target_entity: target_entity.into(),
            contexts: HashMap::new(),
        }
    }

    /// Whether this call is a transport-bookkeeping probe.
    pub fn is_meta(&self) -> bool {
        META_OPERATIONS.contains(&self.operation.as_str())
    }
}

/// Cause of an inbound rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeniedCode {
    /// The call carried no decodable identity.
    NoLogin,
    /// The identity failed remote validation, or could not be validated.
    InvalidLogin,
    /// No session could vouch for the call.
    UnverifiedLogin,
    /// The identity was issued by a different bus than the one the
    /// resolved session is authenticated against.
    UnknownBus,
}

/// Permission-denied fault raised before servant code runs.
#[derive(Debug, Error)]
#[error("permission denied ({code:?}): {detail}")]
pub struct PermissionDenied {
    pub code: DeniedCode,
    pub detail: String,
}

impl PermissionDenied {
    fn new(code: DeniedCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

/// The identity an inbound call carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundIdentity {
    Chain(CallChain),
    Legacy(Credential),
}

/// Outcome of the inbound hook.
#[derive(Debug)]
pub enum InboundDecision {
    /// Meta-operation; proceeds without identity.
    Exempt,
    /// Identity extracted, resolved and validated; the servant may run.
    Accepted {
        session: Arc<Session>,
        identity: InboundIdentity,
    },
}

/// Dispatch callback resolving which session authorizes an inbound call:
/// `(bus_id, login_id, object, operation) -> session`.
pub type DispatchFn = dyn Fn(&str, &str, &str, &str) -> Option<Arc<Session>> + Send + Sync;

/// The pair of hooks every call runs through.
pub struct Interceptor {
    validator: Arc<dyn LoginValidator>,
    default_session: RwLock<Option<Arc<Session>>>,
    dispatch: RwLock<Option<Box<DispatchFn>>>,
}

impl Interceptor {
    pub fn new(validator: Arc<dyn LoginValidator>) -> Self {
        Self {
            validator,
            default_session: RwLock::new(None),
            dispatch: RwLock::new(None),
        }
    }

    /// Set the session inbound calls fall back to when no dispatch
    /// callback is registered or it declines.
    pub fn set_default_session(&self, session: Arc<Session>) {
        *self
            .default_session
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(session);
    }

    /// Register the dispatch callback.
    pub fn set_dispatch<F>(&self, dispatch: F)
    where
        F: Fn(&str, &str, &str, &str) -> Option<Arc<Session>> + Send + Sync + 'static,
    {
        *self.dispatch.write().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(dispatch));
    }

    /// Outbound hook: attach the calling identity to a request.
    ///
    /// Meta-operations are left untouched. The chain extends the
    /// context's joined chain when one is bound; when the legacy protocol
    /// is enabled the flat credential rides along under its own tag.
    pub fn outbound(
        &self,
        session: &Session,
        ctx: &CallContext,
        request: &mut CallRequest,
    ) -> Result<(), LoginError> {
        if request.is_meta() {
            return Ok(());
        }
        let chain = session
            .chain_for(ctx, &request.target_entity)
            .ok_or(LoginError::NotLoggedIn)?;
        request
            .contexts
            .insert(CHAIN_CONTEXT_TAG, encode_chain(&chain));
        if !session.options().legacy_disable {
            let credential = Credential::from_chain(&chain, session.options().legacy_delegate);
            request
                .contexts
                .insert(LEGACY_CONTEXT_TAG, encode_credential(&credential));
        }
        debug!(
            "attached chain {chain} to {}:{}",
            request.object, request.operation
        );
        Ok(())
    }

    /// Inbound hook: extract, resolve and validate the calling identity.
    ///
    /// An `Err` answer means the servant method must not execute.
    pub async fn inbound(&self, request: &CallRequest) -> Result<InboundDecision, PermissionDenied> {
        if request.is_meta() {
            return Ok(InboundDecision::Exempt);
        }

        let identity = self.extract(request)?;
        let session = self.resolve(request, &identity)?;
        self.validate(&session, &identity).await?;

        Ok(InboundDecision::Accepted { session, identity })
    }

    /// Step one: pull the identity out of the side channel.
    fn extract(&self, request: &CallRequest) -> Result<InboundIdentity, PermissionDenied> {
        if let Some(raw) = request.contexts.get(&CHAIN_CONTEXT_TAG) {
            return match decode_chain(raw) {
                Ok(chain) => Ok(InboundIdentity::Chain(chain)),
                Err(e) => {
                    warn!("rejecting {}: undecodable chain: {e}", request.operation);
                    Err(PermissionDenied::new(DeniedCode::NoLogin, e.to_string()))
                }
            };
        }
        if let Some(raw) = request.contexts.get(&LEGACY_CONTEXT_TAG) {
            return match decode_credential(raw) {
                Ok(credential) => Ok(InboundIdentity::Legacy(credential)),
                Err(e) => {
                    warn!(
                        "rejecting {}: undecodable credential: {e}",
                        request.operation
                    );
                    Err(PermissionDenied::new(DeniedCode::NoLogin, e.to_string()))
                }
            };
        }
        Err(PermissionDenied::new(
            DeniedCode::NoLogin,
            "call carried no identity",
        ))
    }

    /// Step two: decide which local session authorizes the call.
    fn resolve(
        &self,
        request: &CallRequest,
        identity: &InboundIdentity,
    ) -> Result<Arc<Session>, PermissionDenied> {
        let (claimed_bus, login_id) = match identity {
            InboundIdentity::Chain(chain) => (chain.bus_id.as_str(), chain.caller.id.as_str()),
            InboundIdentity::Legacy(credential) => ("", credential.identifier.as_str()),
        };

        let dispatched = {
            let dispatch = self.dispatch.read().unwrap_or_else(|e| e.into_inner());
            match dispatch.as_ref() {
                Some(callback) => {
                    // Dispatch is application code; a panic in it must not
                    // escape into the transport.
                    match catch_unwind(AssertUnwindSafe(|| {
                        callback(claimed_bus, login_id, &request.object, &request.operation)
                    })) {
                        Ok(session) => session,
                        Err(_) => {
                            warn!("dispatch callback panicked for {}", request.operation);
                            return Err(PermissionDenied::new(
                                DeniedCode::UnverifiedLogin,
                                "dispatch failure",
                            ));
                        }
                    }
                }
                None => None,
            }
        };

        let session = match dispatched.or_else(|| {
            self.default_session
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        }) {
            Some(session) => session,
            None => {
                return Err(PermissionDenied::new(
                    DeniedCode::UnverifiedLogin,
                    "no session resolved for the call",
                ))
            }
        };

        let Some(session_bus) = session.bus_id() else {
            return Err(PermissionDenied::new(
                DeniedCode::UnverifiedLogin,
                "resolved session is not authenticated",
            ));
        };

        match identity {
            InboundIdentity::Chain(chain) => {
                if chain.bus_id != session_bus {
                    warn!(
                        "rejecting {}: chain from bus {} offered to bus {}",
                        request.operation, chain.bus_id, session_bus
                    );
                    return Err(PermissionDenied::new(
                        DeniedCode::UnknownBus,
                        format!("chain was issued by bus {}", chain.bus_id),
                    ));
                }
                if session.entity().as_deref() != Some(chain.target.as_str()) {
                    return Err(PermissionDenied::new(
                        DeniedCode::UnverifiedLogin,
                        format!("chain targets {}", chain.target),
                    ));
                }
            }
            InboundIdentity::Legacy(_) => {
                if session.options().legacy_disable {
                    return Err(PermissionDenied::new(
                        DeniedCode::NoLogin,
                        "legacy credentials are disabled",
                    ));
                }
            }
        }

        Ok(session)
    }

    /// Step three: check the identity against the cache, then the bus.
    async fn validate(
        &self,
        session: &Arc<Session>,
        identity: &InboundIdentity,
    ) -> Result<(), PermissionDenied> {
        let login_id = match identity {
            InboundIdentity::Chain(chain) => chain.caller.id.clone(),
            InboundIdentity::Legacy(credential) => credential.identifier.clone(),
        };
        // resolve() guaranteed the session knows its bus.
        let Some(bus_id) = session.bus_id() else {
            return Err(PermissionDenied::new(
                DeniedCode::UnverifiedLogin,
                "resolved session is not authenticated",
            ));
        };
        let key = IdentityKey::new(bus_id, login_id);
        match self.validator.validate(&key).await {
            Ok(()) => Ok(()),
            Err(ValidationError::Invalid { login_id }) => Err(PermissionDenied::new(
                DeniedCode::InvalidLogin,
                format!("login {login_id} is not valid"),
            )),
            Err(ValidationError::Bus(e)) => {
                warn!("validation of {} failed: {e}", key.login_id);
                Err(PermissionDenied::new(
                    DeniedCode::InvalidLogin,
                    "identity could not be validated",
                ))
            }
        }
    }
}
