//! Background lease renewal.
//!
//! One task per authenticated session. The loop sleeps out most of the
//! login's validity window, renews, and adopts the new window. Only a
//! definitive "unknown login" answer forces invalidation; transient
//! transport failures retry on a short delay with the same login. The
//! loop stops promptly on logout, without waiting out its sleep.

use log::{debug, warn};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::chain::types::Login;
use crate::remote::{AccessControl, RenewAnswer};
use crate::session::Session;

/// Delay before retrying a transiently-failed renewal.
const RENEW_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Sleep for a validity window: the window minus a safety margin of one
/// tenth, clamped to [1s, 30s].
fn renewal_delay(validity_secs: u32) -> Duration {
    let margin = (validity_secs / 10).clamp(1, 30);
    Duration::from_secs(u64::from(validity_secs.saturating_sub(margin).max(1)))
}

pub(crate) struct Renewer {
    shutdown: watch::Sender<bool>,
    _handle: JoinHandle<()>,
}

impl Renewer {
    pub(crate) fn spawn(
        session: Weak<Session>,
        bus: Arc<dyn AccessControl>,
        login: Login,
    ) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut next_delay = renewal_delay(login.validity_secs);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(next_delay) => {}
                    _ = shutdown_rx.changed() => break,
                }
                match bus.renew_lease(&login.id).await {
                    Ok(RenewAnswer::Granted { validity_secs }) => {
                        debug!(
                            "lease renewed for login {}, next window {}s",
                            login.short_id(),
                            validity_secs
                        );
                        match session.upgrade() {
                            Some(session) => session.adopt_validity(validity_secs),
                            None => break,
                        }
                        next_delay = renewal_delay(validity_secs);
                    }
                    Ok(RenewAnswer::UnknownLogin) => {
                        warn!(
                            "bus no longer knows login {}; invalidating",
                            login.short_id()
                        );
                        if let Some(session) = session.upgrade() {
                            session.force_invalidate();
                        }
                        break;
                    }
                    Err(e) => {
                        warn!(
                            "lease renewal failed for login {}: {e}; retrying",
                            login.short_id()
                        );
                        next_delay = RENEW_RETRY_INTERVAL;
                    }
                }
            }
        });
        Self {
            shutdown,
            _handle: handle,
        }
    }

    /// Signal the loop to stop; returns without waiting for it.
    pub(crate) fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for Renewer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
