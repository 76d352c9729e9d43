//! Value types for logins, call chains and the legacy flat credential.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A bus-issued, time-bounded proof of authenticated identity.
///
/// Created by the bus on successful authentication. A login is immutable;
/// a session replaces its held login wholesale on relogin or renewal and
/// never mutates fields in place.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Login {
    /// Opaque identifier assigned by the bus.
    pub id: String,

    /// The authenticated entity name.
    pub entity: String,

    /// Validity window in seconds; the lease must be renewed before it
    /// runs out or the bus invalidates the login.
    pub validity_secs: u32,
}

impl Login {
    pub fn new(
        id: impl Into<String>,
        entity: impl Into<String>,
        validity_secs: u32,
    ) -> Self {
        Self {
            id: id.into(),
            entity: entity.into(),
            validity_secs,
        }
    }

    /// Abbreviated id for log lines.
    pub fn short_id(&self) -> &str {
        let end = self.id.len().min(8);
        &self.id[..end]
    }
}

impl fmt::Display for Login {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.entity, self.short_id())
    }
}

/// Provenance record of a nested remote call.
///
/// `originators` lists, oldest first, every login that initiated an
/// earlier link in the chain; `caller` is the login that made the
/// immediately-preceding call; `target` is the entity the chain was
/// generated for. The bus, not the client, produces `signature`. A chain
/// may only be joined by a session whose own entity equals `target`.
///
/// Chains compare by value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallChain {
    pub bus_id: String,
    pub target: String,
    pub originators: Vec<Login>,
    pub caller: Login,
    pub signature: Vec<u8>,
}

impl CallChain {
    /// Start a fresh chain with zero originators.
    ///
    /// Fresh chains carry an empty signature: signing is the bus's job and
    /// the receiving side trusts remote validation, not local inspection.
    pub fn root(bus_id: impl Into<String>, target: impl Into<String>, caller: Login) -> Self {
        Self {
            bus_id: bus_id.into(),
            target: target.into(),
            originators: Vec::new(),
            caller,
            signature: Vec::new(),
        }
    }

    /// Extend this chain with a new caller link.
    ///
    /// The previous caller is appended to the originator sequence and
    /// `caller` becomes the new immediate link. The old signature no
    /// longer binds the extended tuple, so it is cleared.
    pub fn extended(&self, caller: Login, target: impl Into<String>) -> Self {
        let mut originators = self.originators.clone();
        originators.push(self.caller.clone());
        Self {
            bus_id: self.bus_id.clone(),
            target: target.into(),
            originators,
            caller,
            signature: Vec::new(),
        }
    }

    /// The oldest login in the chain, falling back to the caller for
    /// chains with no originators.
    pub fn oldest(&self) -> &Login {
        self.originators.first().unwrap_or(&self.caller)
    }
}

impl fmt::Display for CallChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for origin in &self.originators {
            write!(f, "{}->", origin.entity)?;
        }
        write!(f, "{}=>{}", self.caller.entity, self.target)
    }
}

/// How the legacy credential's `delegate` field is populated when a chain
/// is bridged down to the flat format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelegateMode {
    /// Delegate names the chain's immediate caller.
    Caller,
    /// Delegate names the oldest originator.
    Originator,
}

impl FromStr for DelegateMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "caller" => Ok(DelegateMode::Caller),
            "originator" => Ok(DelegateMode::Originator),
            other => Err(format!("unknown delegate mode: {other}")),
        }
    }
}

/// Legacy flat credential: one level of indirection instead of a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Login id of the caller.
    pub identifier: String,

    /// Entity owning the login.
    pub owner: String,

    /// Entity the call is forwarded on behalf of; empty when the call is
    /// not delegated.
    pub delegate: String,
}

impl Credential {
    /// Bridge a chain down to the flat format.
    ///
    /// With `DelegateMode::Originator` and an empty originator list the
    /// delegate stays empty: one-level indirection has nothing to name.
    pub fn from_chain(chain: &CallChain, mode: DelegateMode) -> Self {
        let delegate = if chain.originators.is_empty() {
            String::new()
        } else {
            match mode {
                DelegateMode::Caller => chain.caller.entity.clone(),
                DelegateMode::Originator => chain.oldest().entity.clone(),
            }
        };
        Self {
            identifier: chain.caller.id.clone(),
            owner: chain.caller.entity.clone(),
            delegate,
        }
    }
}
