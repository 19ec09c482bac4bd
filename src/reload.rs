//! Throttled reload signaling.
//!
//! Reloading the front-end server is not free, so at most one reload is
//! requested per minute, and only when the set of blocked addresses has
//! actually changed since the last reload it was told about.

use crate::server::ServerControl;
use std::collections::BTreeSet;
use std::net::IpAddr;
use tracing::{info, warn};

/// Minimum spacing between reload signals.
pub const MIN_RELOAD_INTERVAL_SECS: i64 = 60;

/// Tracks when the server was last reloaded and with which block set.
#[derive(Debug, Default)]
pub struct ReloadSignaler {
    last_reload: i64,
    last_membership: BTreeSet<IpAddr>,
}

impl ReloadSignaler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal a reload if the budget allows and the block set changed.
    /// Returns whether a signal was sent.
    pub fn maybe_reload<C: ServerControl>(
        &mut self,
        now: i64,
        membership: &BTreeSet<IpAddr>,
        control: &C,
    ) -> bool {
        if now - self.last_reload < MIN_RELOAD_INTERVAL_SECS {
            return false;
        }
        if *membership == self.last_membership {
            return false;
        }
        if let Err(e) = control.reload() {
            warn!(error = %e, "reload signal failed");
            return false;
        }
        info!(blocked = membership.len(), "server reload requested");
        self.last_reload = now;
        self.last_membership = membership.clone();
        true
    }
}
