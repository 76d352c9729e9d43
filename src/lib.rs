//! Client-side access library for a replicated bus middleware.
//!
//! A process authenticates to a bus through a [`session::Session`],
//! keeps that authentication alive via background lease renewal, and
//! makes/receives remote calls whose origin is traceable through nested
//! invocations as a bus-signed [`chain::CallChain`]. The
//! [`interceptor::Interceptor`] pair of hooks injects the identity on
//! every outbound call and extracts/validates it on every inbound one,
//! consulting a bounded [`chain::LoginCache`] and failing over across
//! [`replica::ReplicaSelector`] endpoints on transient transport faults.
//!
//! ```no_run
//! use std::sync::Arc;
//! use buslink::config::SessionOptions;
//! use buslink::session::{CallContext, Session};
//!
//! # async fn example(bus: Arc<dyn buslink::remote::AccessControl>) {
//! let session = Session::new(bus, SessionOptions::from_env()).unwrap();
//! session
//!     .login_by_password("entity", "secret", "domain")
//!     .await
//!     .unwrap();
//!
//! let ctx = CallContext::new();
//! if let Some(chain) = session.chain_for(&ctx, "storage") {
//!     // attach to an outbound request through an Interceptor
//!     let _ = chain;
//! }
//! # }
//! ```

pub mod chain;
pub mod config;
pub mod crypto;
pub mod interceptor;
pub mod remote;
pub mod replica;
pub mod session;

pub use chain::{CallChain, Credential, DelegateMode, Login, LoginCache};
pub use interceptor::{CallRequest, DeniedCode, Interceptor, PermissionDenied};
pub use remote::{AccessControl, BusError, LoginError};
pub use replica::{EndpointConnector, FailoverBus, ReplicaEndpoint, ReplicaSelector};
pub use session::{CallContext, Session, SessionState};
