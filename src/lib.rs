//! autofilterd - adaptive traffic filtering for nginx front ends.
//!
//! Tails the access log, scores each client's per-minute load, and
//! maintains an expiring block file that nginx consumes at its next
//! configuration reload. Verified search-engine crawlers (via
//! forward-confirmed reverse DNS) are never blocked.

pub mod access_log;
pub mod batch;
pub mod daemon;
pub mod fcrdns;
pub mod ledger;
pub mod policy;
pub mod reload;
pub mod server;
pub mod tailer;
pub mod weight;

/// The canonical production access log. The daemon refuses to run
/// against anything else so a replayed or copied log can never mutate
/// the live block set by accident.
pub const PRODUCTION_ACCESS_LOG: &str = "/var/log/nginx/access.log";

/// Default filesystem root holding `autofilter.conf` and `var/`.
pub const DEFAULT_ROOT: &str = "/etc/autofilter";
