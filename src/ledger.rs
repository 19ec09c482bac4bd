//! The persisted block set.
//!
//! One record per line, in the exact shape the front-end server's
//! configuration include consumes at reload:
//!
//! ```text
//!                                      10.1.2.3 1; # CN        750 2024-01-02T15:04:05 error: dns timeout | curl/8.0
//! ```
//!
//! The address column is right-aligned to 45 characters (widest textual
//! v6 form), the load column to 10. The `1;` token is the map value the
//! server reads. Timestamps are local time, second precision, no zone
//! suffix. Records are sorted by load descending, then address.
//!
//! Writes go to a randomly named sibling temp file followed by an atomic
//! rename, so a concurrent reader never observes a torn file.

use chrono::{Local, NaiveDateTime, TimeZone};
use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::net::IpAddr;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

/// Column width of the right-aligned address field.
const IP_WIDTH: usize = 45;

/// Column width of the right-aligned load field.
const LOAD_WIDTH: usize = 10;

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Ledger write errors. A failed write aborts the current flush only;
/// the next flush rewrites the file from scratch.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("atomic rename failed: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// One blocked client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEntry {
    pub ip: IpAddr,
    /// Epoch second after which the block lapses.
    pub block_until: i64,
    pub country: String,
    /// Peak observed per-minute load.
    pub load: u64,
    /// `"<domain> | <user-agent>"` when FCrDNS succeeded,
    /// `"error: <dns-error> | <user-agent>"` otherwise.
    pub annotation: String,
}

impl BlockEntry {
    /// Serialize to the consumer line format.
    fn format(&self) -> String {
        format!(
            "{:>ip_w$} 1; # {} {:>load_w$} {} {}",
            self.ip,
            self.country,
            self.load,
            format_epoch(self.block_until),
            self.annotation,
            ip_w = IP_WIDTH,
            load_w = LOAD_WIDTH,
        )
    }

    /// Parse a ledger line: seven positional whitespace-separated tokens,
    /// the last being the annotation remainder (spacing preserved).
    fn parse(line: &str) -> Option<Self> {
        let (ip, rest) = next_token(line)?;
        let (one, rest) = next_token(rest)?;
        let (hash, rest) = next_token(rest)?;
        if one != "1;" || hash != "#" {
            return None;
        }
        let (country, rest) = next_token(rest)?;
        let (load, rest) = next_token(rest)?;
        let (until, rest) = next_token(rest)?;

        Some(Self {
            ip: ip.parse().ok()?,
            block_until: parse_epoch(until)?,
            country: country.to_string(),
            load: load.parse().ok()?,
            annotation: rest.trim_start().to_string(),
        })
    }
}

/// The on-disk block set, read-modify-written once per flush.
#[derive(Debug, Default)]
pub struct BlockLedger {
    entries: HashMap<IpAddr, BlockEntry>,
}

impl BlockLedger {
    /// Read the ledger file. A missing file is an empty ledger; an
    /// unparseable record is dropped with a warning (the file is
    /// writer-controlled, so this is not expected).
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let content = match std::fs::read_to_string(path.as_ref()) {
            Ok(content) => content,
            Err(_) => return Self::default(),
        };

        let mut entries = HashMap::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match BlockEntry::parse(line) {
                Some(entry) => {
                    entries.insert(entry.ip, entry);
                }
                None => warn!(line, "skipping unparseable block record"),
            }
        }
        Self { entries }
    }

    /// Drop records whose block has lapsed.
    pub fn expire(&mut self, now: i64) {
        self.entries.retain(|_, entry| entry.block_until > now);
    }

    /// Insert or replace the record for an address.
    pub fn upsert(&mut self, entry: BlockEntry) {
        self.entries.insert(entry.ip, entry);
    }

    pub fn get(&self, ip: &IpAddr) -> Option<&BlockEntry> {
        self.entries.get(ip)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The set of currently blocked addresses, for reload change
    /// detection.
    pub fn membership(&self) -> BTreeSet<IpAddr> {
        self.entries.keys().copied().collect()
    }

    /// Atomically rewrite the ledger file: temp sibling, then rename.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<(), LedgerError> {
        let path = path.as_ref();
        let dir = path.parent().unwrap_or_else(|| Path::new("."));

        let mut ordered: Vec<&BlockEntry> = self.entries.values().collect();
        ordered.sort_by_key(|entry| (std::cmp::Reverse(entry.load), entry.ip));

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        for entry in ordered {
            writeln!(tmp, "{}", entry.format())?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(path)?;
        Ok(())
    }
}

/// First whitespace-delimited token and the remainder of the line.
fn next_token(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    match s.find(char::is_whitespace) {
        Some(idx) => Some((&s[..idx], &s[idx..])),
        None => Some((s, "")),
    }
}

/// Format an epoch second as local time without a zone suffix.
fn format_epoch(epoch: i64) -> String {
    match Local.timestamp_opt(epoch, 0).earliest() {
        Some(ts) => ts.format(TIME_FORMAT).to_string(),
        None => format!("invalid-{epoch}"),
    }
}

/// Parse the local-time column back to an epoch second.
fn parse_epoch(text: &str) -> Option<i64> {
    let naive = NaiveDateTime::parse_from_str(text, TIME_FORMAT).ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|ts| ts.timestamp())
}
