//! Call-chain identity model and validation.
//!
//! This module holds the value types for bus-issued logins and signed call
//! chains, the versioned wire codec used to move them through a call's
//! side-channel context, and the server-side machinery that validates
//! inbound identities against the bus without paying one round trip per
//! call.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌─────────────────┐
//! │ chain codec │────▶│  LoginCache  │────▶│  LoginValidator │
//! │ (wire form) │     │ (strict LRU) │     │     (trait)     │
//! └─────────────┘     └──────────────┘     └─────────────────┘
//!        │                    │                     │
//!        ▼                    ▼                     ▼
//! ┌─────────────┐     ┌──────────────┐     ┌─────────────────┐
//! │  CallChain  │     │ revalidation │     │BusLoginValidator│
//! │   Login     │     │  task (5min) │     │     (impl)      │
//! └─────────────┘     └──────────────┘     └─────────────────┘
//! ```
//!
//! Decoding never verifies a chain's signature; the bus produces it and
//! only the bus can check it. Trust on the receiving side comes from the
//! validator asking the bus whether the caller's login is still alive.

pub mod cache;
pub mod codec;
pub mod error;
pub mod types;
pub mod validator;

pub use cache::{CacheAnswer, IdentityKey, LoginCache, RevalidationTask};
pub use codec::{decode_chain, decode_credential, encode_chain, encode_credential};
pub use error::{ChainCodecError, ValidationError};
pub use types::{CallChain, Credential, DelegateMode, Login};
pub use validator::{BusLoginValidator, LoginValidator};
