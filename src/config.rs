//! Session creation options.
//!
//! Recognized options, resolved from the environment with defaults:
//!
//! | option            | variable                    | default            |
//! |-------------------|-----------------------------|--------------------|
//! | `access.key`      | `ACCESS_KEY_PATH`           | fresh keypair      |
//! | `legacy.disable`  | `LEGACY_DISABLE`            | `false`            |
//! | `legacy.delegate` | `LEGACY_DELEGATE`           | `caller`           |
//! | replica list      | `BUS_REPLICAS`              | `localhost:2089`   |
//! | cache capacity    | `CACHE_CAPACITY`            | 20                 |
//! | revalidation      | `REVALIDATION_INTERVAL_SECS`| 300                |

use std::env;
use std::time::Duration;

use crate::chain::cache::{DEFAULT_CACHE_CAPACITY, DEFAULT_REVALIDATION_INTERVAL};
use crate::chain::types::DelegateMode;
use crate::replica::ReplicaEndpoint;

/// Default port a bus replica listens on.
pub const DEFAULT_BUS_PORT: u16 = 2089;

/// Options consumed when a session is created.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Path to a PKCS#8 private key for the session keypair; a fresh
    /// keypair is generated when absent.
    pub access_key_path: Option<String>,

    /// Disables the flat-credential fallback protocol.
    pub legacy_disable: bool,

    /// How the flat credential's delegate field is populated when a chain
    /// is bridged down to the legacy format.
    pub legacy_delegate: DelegateMode,

    /// Known bus replicas, in failover order.
    pub replicas: Vec<ReplicaEndpoint>,

    /// Validation-cache capacity.
    pub cache_capacity: usize,

    /// Interval between batched cache revalidations.
    pub revalidation_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            access_key_path: None,
            legacy_disable: false,
            legacy_delegate: DelegateMode::Caller,
            replicas: vec![ReplicaEndpoint::new("localhost", DEFAULT_BUS_PORT)],
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            revalidation_interval: DEFAULT_REVALIDATION_INTERVAL,
        }
    }
}

impl SessionOptions {
    /// Load options from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            access_key_path: env::var("ACCESS_KEY_PATH").ok(),
            legacy_disable: env::var("LEGACY_DISABLE")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
            legacy_delegate: env::var("LEGACY_DELEGATE")
                .unwrap_or_else(|_| "caller".to_string())
                .parse()
                .unwrap_or(DelegateMode::Caller),
            replicas: env::var("BUS_REPLICAS")
                .map(|spec| parse_replicas(&spec))
                .ok()
                .filter(|list| !list.is_empty())
                .unwrap_or(defaults.replicas),
            cache_capacity: env::var("CACHE_CAPACITY")
                .unwrap_or_else(|_| DEFAULT_CACHE_CAPACITY.to_string())
                .parse()
                .unwrap_or(DEFAULT_CACHE_CAPACITY),
            revalidation_interval: env::var("REVALIDATION_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_REVALIDATION_INTERVAL),
        }
    }
}

/// Parse a comma-separated `host:port` list; entries without a port get
/// the default bus port, empty entries are skipped.
pub fn parse_replicas(spec: &str) -> Vec<ReplicaEndpoint> {
    spec.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.rsplit_once(':') {
            Some((host, port)) => ReplicaEndpoint::new(
                host,
                port.parse().unwrap_or(DEFAULT_BUS_PORT),
            ),
            None => ReplicaEndpoint::new(entry, DEFAULT_BUS_PORT),
        })
        .collect()
}
