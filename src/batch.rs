//! Minute-bucket batching.
//!
//! Requests are grouped by the leading 16 characters of their log
//! timestamp (`2024-01-01T00:00` — minute precision). The bucket
//! boundary is taken from the log stream, not the wall clock, so a
//! replayed log produces identical flushes.

use crate::access_log::AccessRecord;
use std::collections::HashMap;
use std::mem;
use std::net::IpAddr;

/// Number of leading timestamp characters that identify a minute.
const MINUTE_KEY_LEN: usize = 16;

/// Per-minute accumulation state. One instance lives for the whole run;
/// its maps are taken wholesale at each minute boundary.
#[derive(Debug, Default)]
pub struct MinuteBatch {
    minute: Option<String>,
    load: HashMap<IpAddr, u64>,
    country: HashMap<IpAddr, String>,
    user_agent: HashMap<IpAddr, String>,
}

/// A completed minute bucket, handed to the flush path.
#[derive(Debug)]
pub struct CompletedBatch {
    /// Accumulated weight per client this minute.
    pub load: HashMap<IpAddr, u64>,
    /// Last-seen country code per client this minute.
    pub country: HashMap<IpAddr, String>,
    /// Last-seen User-Agent per client this minute.
    pub user_agent: HashMap<IpAddr, String>,
}

impl MinuteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a record into the current bucket.
    ///
    /// When the record's minute differs from the current one, the filled
    /// bucket is returned for flushing and the record seeds the next
    /// bucket. The maps are moved out, so batch state is cleared in the
    /// same step.
    pub fn accumulate(&mut self, rec: &AccessRecord, weight: u64) -> Option<CompletedBatch> {
        let key = minute_key(&rec.time);

        let completed = match self.minute.as_deref() {
            Some(current) if current != key => Some(self.take()),
            _ => None,
        };
        if self.minute.as_deref() != Some(key) {
            self.minute = Some(key.to_string());
        }

        *self.load.entry(rec.ip).or_insert(0) += weight;
        self.country.insert(rec.ip, rec.country.clone());
        self.user_agent.insert(rec.ip, rec.user_agent.clone());

        completed
    }

    /// Whether any traffic has been accumulated for the current minute.
    pub fn is_empty(&self) -> bool {
        self.load.is_empty()
    }

    fn take(&mut self) -> CompletedBatch {
        CompletedBatch {
            load: mem::take(&mut self.load),
            country: mem::take(&mut self.country),
            user_agent: mem::take(&mut self.user_agent),
        }
    }
}

/// The minute key of an ISO-8601 timestamp.
fn minute_key(time: &str) -> &str {
    time.get(..MINUTE_KEY_LEN).unwrap_or(time)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_record(time: &str, ip: &str, country: &str, ua: &str) -> AccessRecord {
        AccessRecord {
            time: time.to_string(),
            country: country.to_string(),
            ip: ip.parse().unwrap(),
            scheme: "https".to_string(),
            host: "example.com".to_string(),
            method: "GET".to_string(),
            uri: "/".to_string(),
            status: "200".to_string(),
            bytes: 0,
            referer: "-".to_string(),
            user_agent: ua.to_string(),
        }
    }

    #[test]
    fn test_accumulates_within_minute() {
        let mut batch = MinuteBatch::new();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        let r1 = make_record("2024-01-01T00:00:10+03:00", "10.0.0.1", "US", "ua-1");
        let r2 = make_record("2024-01-01T00:00:59+03:00", "10.0.0.1", "DE", "ua-2");
        assert!(batch.accumulate(&r1, 10).is_none());
        assert!(batch.accumulate(&r2, 20).is_none());

        assert_eq!(batch.load[&ip], 30);
        // Country and User-Agent keep the last-seen value
        assert_eq!(batch.country[&ip], "DE");
        assert_eq!(batch.user_agent[&ip], "ua-2");
    }

    #[test]
    fn test_minute_change_flushes_and_clears() {
        let mut batch = MinuteBatch::new();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        let r1 = make_record("2024-01-01T00:00:59+03:00", "10.0.0.1", "US", "ua");
        let r2 = make_record("2024-01-01T00:01:00+03:00", "10.0.0.1", "US", "ua");
        assert!(batch.accumulate(&r1, 700).is_none());

        let completed = batch.accumulate(&r2, 1).expect("minute boundary must flush");
        assert_eq!(completed.load[&ip], 700);

        // The new bucket only holds the record that crossed the boundary
        assert_eq!(batch.load[&ip], 1);
        assert_eq!(batch.country.len(), 1);
        assert_eq!(batch.user_agent.len(), 1);
    }

    #[test]
    fn test_tracks_multiple_clients() {
        let mut batch = MinuteBatch::new();
        let a = make_record("2024-01-01T00:00:01+03:00", "10.0.0.1", "US", "ua-a");
        let b = make_record("2024-01-01T00:00:02+03:00", "192.0.2.7", "CN", "ua-b");
        batch.accumulate(&a, 10);
        batch.accumulate(&b, 30);

        assert_eq!(batch.load.len(), 2);
        assert_eq!(batch.load[&a.ip], 10);
        assert_eq!(batch.load[&b.ip], 30);
    }

    #[test]
    fn test_seconds_do_not_split_buckets() {
        let mut batch = MinuteBatch::new();
        for sec in 0..60 {
            let time = format!("2024-01-01T00:00:{:02}+03:00", sec);
            let rec = make_record(&time, "10.0.0.1", "US", "ua");
            assert!(batch.accumulate(&rec, 1).is_none());
        }
        assert_eq!(batch.load[&"10.0.0.1".parse::<IpAddr>().unwrap()], 60);
    }
}
