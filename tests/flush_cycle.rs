//! End-to-end flush cycle: tail a log file, cross a minute boundary,
//! and verify the block file the server would consume at reload.

use autofilterd::daemon::Daemon;
use autofilterd::fcrdns::StaticVerifier;
use autofilterd::ledger::BlockLedger;
use autofilterd::policy::Policy;
use autofilterd::server::NoopControl;
use autofilterd::tailer::{LogTailer, TailMode};
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tempfile::tempdir;

fn test_policy() -> Policy {
    Policy::parse(
        "limit 10.0.0.0/8 100\n\
         limit CN 200\n\
         limit ALL 600\n\
         block ALL 24h\n",
    )
    .unwrap()
}

fn log_line(time: &str, ip: &str, country: &str, method: &str, uri: &str) -> String {
    format!(
        "{time}\t{country}\t{ip}\thttps\texample.com\t{method}\t\"{uri}\"\t200\t512\t\"-\"\t\"it-agent/2.1\""
    )
}

/// A minute of flooding followed by one line in the next minute. The
/// boundary line must trigger the flush, and the block file must hold
/// exactly the offender, sorted and annotated.
#[tokio::test]
async fn test_flood_is_blocked_after_minute_boundary() {
    let dir = tempdir().unwrap();
    let log_path = dir.path().join("access.log");
    let block_file = dir.path().join("bot.conf");

    let mut lines = Vec::new();
    // 40 query-string requests (weight 20 each): load 800 for the offender
    for sec in 0..40 {
        let time = format!("2024-03-01T10:00:{sec:02}+03:00");
        lines.push(log_line(&time, "203.0.113.9", "US", "GET", "/search?q=flood"));
    }
    // A quiet client stays under every limit
    lines.push(log_line(
        "2024-03-01T10:00:41+03:00",
        "198.51.100.3",
        "DE",
        "GET",
        "/about",
    ));
    // The boundary line flushes the bucket
    lines.push(log_line(
        "2024-03-01T10:01:00+03:00",
        "198.51.100.3",
        "DE",
        "GET",
        "/about",
    ));
    std::fs::write(&log_path, lines.join("\n") + "\n").unwrap();

    let control = NoopControl::new();
    let mut tailer = LogTailer::open(
        &log_path,
        TailMode::Once,
        control.clone(),
        Arc::new(AtomicBool::new(false)),
    )
    .await
    .unwrap();

    let mut daemon = Daemon::new(
        test_policy(),
        block_file.clone(),
        StaticVerifier::new(),
        control.clone(),
    );
    daemon.run(&mut tailer).await.unwrap();

    let ledger = BlockLedger::load(&block_file);
    let offender: IpAddr = "203.0.113.9".parse().unwrap();
    let quiet: IpAddr = "198.51.100.3".parse().unwrap();

    let entry = ledger.get(&offender).expect("offender must be blocked");
    assert_eq!(entry.load, 800);
    assert_eq!(entry.country, "US");
    assert_eq!(entry.annotation, "error: no ptr record | it-agent/2.1");
    assert!(ledger.get(&quiet).is_none());

    // One membership change, one reload
    assert_eq!(control.reloads(), 1);
}

/// A verified crawler floods harder than anyone and never appears in
/// the block file; an unverifiable flooder from the same minute does.
#[tokio::test]
async fn test_crawler_exemption_end_to_end() {
    let dir = tempdir().unwrap();
    let log_path = dir.path().join("access.log");
    let block_file = dir.path().join("bot.conf");

    let googlebot = "66.249.66.1";
    let scraper = "203.0.113.50";

    let mut lines = Vec::new();
    for sec in 0..50 {
        let time = format!("2024-03-01T10:00:{sec:02}+03:00");
        lines.push(log_line(&time, googlebot, "US", "GET", "/page?crawl=1"));
        lines.push(log_line(&time, scraper, "US", "GET", "/page?scrape=1"));
    }
    lines.push(log_line(
        "2024-03-01T10:01:00+03:00",
        scraper,
        "US",
        "GET",
        "/",
    ));
    std::fs::write(&log_path, lines.join("\n") + "\n").unwrap();

    let verifier = StaticVerifier::new().with_domain(
        googlebot.parse().unwrap(),
        "crawl-66-249-66-1.googlebot.com.",
    );
    let control = NoopControl::new();
    let mut tailer = LogTailer::open(
        &log_path,
        TailMode::Once,
        control.clone(),
        Arc::new(AtomicBool::new(false)),
    )
    .await
    .unwrap();

    let mut daemon = Daemon::new(test_policy(), block_file.clone(), verifier, control.clone());
    daemon.run(&mut tailer).await.unwrap();

    let ledger = BlockLedger::load(&block_file);
    assert!(ledger.get(&googlebot.parse().unwrap()).is_none());
    assert!(ledger.get(&scraper.parse().unwrap()).is_some());
}

/// The written block file is whole at every observation point: it either
/// does not exist yet or contains only complete records.
#[tokio::test]
async fn test_block_file_never_torn() {
    let dir = tempdir().unwrap();
    let block_file = dir.path().join("bot.conf");

    let mut daemon = Daemon::new(
        test_policy(),
        block_file.clone(),
        StaticVerifier::new(),
        NoopControl::new(),
    );

    for round in 0..5u32 {
        let mut load = std::collections::HashMap::new();
        let mut country = std::collections::HashMap::new();
        let mut user_agent = std::collections::HashMap::new();
        for n in 0..20u32 {
            let ip: IpAddr = format!("203.0.113.{}", n + 1).parse().unwrap();
            load.insert(ip, 700 + u64::from(n));
            country.insert(ip, "US".to_string());
            user_agent.insert(ip, format!("agent-{round}"));
        }
        let batch = autofilterd::batch::CompletedBatch {
            load,
            country,
            user_agent,
        };
        daemon.flush(batch, 2_000_000_000 + i64::from(round)).await;

        assert_whole_ledger(&block_file, 20);
    }
}

fn assert_whole_ledger(path: &Path, expected: usize) {
    let content = std::fs::read_to_string(path).expect("ledger must exist after a flush");
    assert!(!content.is_empty());
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), expected);
    let reread = BlockLedger::load(path);
    assert_eq!(reread.len(), expected);
}
