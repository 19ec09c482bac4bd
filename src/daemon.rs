//! The filtering daemon: tail, classify, batch, decide.
//!
//! One cooperative control flow follows the access log. Each line is
//! parsed, weighted, and folded into the current minute bucket; a
//! timestamp that crosses the minute boundary flushes the bucket. The
//! flush path is strictly sequential: read the ledger, expire, evaluate
//! every client that produced traffic, rewrite the ledger atomically,
//! and maybe ask the server to reload. Nothing in the flush path can
//! terminate the daemon; a failed ledger write is logged and retried on
//! the next flush.

use crate::access_log::AccessRecord;
use crate::batch::{CompletedBatch, MinuteBatch};
use crate::fcrdns::{is_verified_crawler, CrawlerVerifier};
use crate::ledger::{BlockEntry, BlockLedger};
use crate::policy::Policy;
use crate::reload::ReloadSignaler;
use crate::server::ServerControl;
use crate::tailer::{LogTailer, TailError};
use crate::weight::request_weight;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// The decision engine. Generic over the verifier and server control so
/// tests can run the whole flush path without DNS or signals.
pub struct Daemon<V, C> {
    policy: Policy,
    block_file: PathBuf,
    verifier: V,
    control: C,
    signaler: ReloadSignaler,
    batch: MinuteBatch,
}

impl<V: CrawlerVerifier, C: ServerControl> Daemon<V, C> {
    pub fn new(policy: Policy, block_file: PathBuf, verifier: V, control: C) -> Self {
        Self {
            policy,
            block_file,
            verifier,
            control,
            signaler: ReloadSignaler::new(),
            batch: MinuteBatch::new(),
        }
    }

    /// Consume the tailer until it ends (shutdown in follow mode, EOF in
    /// once mode).
    pub async fn run<T: ServerControl>(
        &mut self,
        tailer: &mut LogTailer<T>,
    ) -> Result<(), TailError> {
        info!(block_file = %self.block_file.display(), "daemon running");
        while let Some(line) = tailer.next_line().await? {
            self.process_line(&line).await;
        }
        Ok(())
    }

    /// Classify one log line and flush if it crossed a minute boundary.
    pub async fn process_line(&mut self, line: &str) {
        let Some(record) = AccessRecord::parse(line) else {
            warn!(line, "unparseable access log line");
            return;
        };
        let weight = request_weight(&record);
        if let Some(completed) = self.batch.accumulate(&record, weight) {
            self.flush(completed, now_epoch()).await;
        }
    }

    /// Evaluate one completed minute bucket against the policy.
    pub async fn flush(&mut self, batch: CompletedBatch, now: i64) {
        let mut ledger = BlockLedger::load(&self.block_file);
        ledger.expire(now);

        // Materialise the key set; the ledger is mutated while we walk it.
        let mut clients: Vec<IpAddr> = batch.load.keys().copied().collect();
        clients.sort();

        for ip in clients {
            let load = batch.load[&ip];
            let country = batch.country.get(&ip).map(String::as_str).unwrap_or("");
            let limit = self.policy.limit_for(ip, country);
            if load <= limit {
                continue;
            }

            let user_agent = batch.user_agent.get(&ip).cloned().unwrap_or_default();
            let annotation = match self.verifier.verify(ip).await {
                Ok(domain) if is_verified_crawler(&domain) => {
                    info!(ip = %ip, domain = %domain, load, "verified crawler, exempt");
                    continue;
                }
                Ok(domain) => format!("{domain} | {user_agent}"),
                Err(e) => {
                    debug!(ip = %ip, error = %e, "crawler verification failed");
                    format!("error: {e} | {user_agent}")
                }
            };

            let block_until = now + saturating_secs(self.policy.block_secs_for(ip, country));
            info!(ip = %ip, country, load, limit, block_until, "blocking client");
            ledger.upsert(BlockEntry {
                ip,
                block_until,
                country: country.to_string(),
                load,
                annotation,
            });
        }

        if let Err(e) = ledger.write(&self.block_file) {
            // Abort this flush only; the next one rewrites from scratch.
            error!(error = %e, path = %self.block_file.display(), "block file write failed");
            return;
        }
        self.signaler
            .maybe_reload(now, &ledger.membership(), &self.control);
    }
}

/// Current wall-clock epoch second.
fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Clamp a policy duration into the epoch arithmetic domain.
fn saturating_secs(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}
