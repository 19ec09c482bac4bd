//! Forward-confirmed reverse DNS for crawler verification.
//!
//! The procedure the major search engines document for verifying their
//! bots: resolve the client address to a PTR name, resolve that name
//! forward again (AAAA for v6 clients, A for v4), and require the first
//! forward answer to equal the original address. Only then is the PTR
//! name trusted and matched against the crawler suffix allowlist.
//!
//! Lookups go to the operator-configured resolver only (default
//! loopback) and are bounded by the policy timeout, so a slow DNS path
//! costs at most one timeout per offending client per minute.

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::{ResolveError, TokioResolver};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Suffixes (trailing dot included) whose forward-confirmed owners are
/// exempt from blocking. No other suffixes exempt.
pub const SEARCH_ENGINE_SUFFIXES: &[&str] = &[
    ".googlebot.com.",
    ".google.com.",
    ".yandex.com.",
    ".yandex.net.",
    ".yandex.ru.",
    ".search.msn.com.",
];

/// Whether a forward-confirmed domain belongs to a known search engine.
pub fn is_verified_crawler(domain: &str) -> bool {
    let dotted;
    let domain = if domain.ends_with('.') {
        domain
    } else {
        dotted = format!("{domain}.");
        &dotted
    };
    SEARCH_ENGINE_SUFFIXES
        .iter()
        .any(|suffix| domain.ends_with(suffix))
}

/// Verification failures. Every variant ends up verbatim in the block
/// record annotation, so the messages stay short.
#[derive(Debug, Error)]
pub enum FcrdnsError {
    #[error("dns timeout")]
    Timeout,
    #[error("dns: {0}")]
    Resolve(#[from] ResolveError),
    #[error("no ptr record")]
    NoPtr,
    #[error("no forward answer for {0}")]
    NoAnswer(String),
    #[error("forward answer {forward} does not match {ip}")]
    Mismatch { ip: IpAddr, forward: IpAddr },
}

/// The crawler verification seam. The production implementation talks
/// DNS; tests substitute a static table.
#[async_trait]
pub trait CrawlerVerifier {
    /// Forward-confirmed reverse lookup. `Ok` carries the confirmed
    /// FQDN (trailing dot).
    async fn verify(&self, ip: IpAddr) -> Result<String, FcrdnsError>;
}

/// FCrDNS against a single configured nameserver.
pub struct FcrdnsVerifier {
    resolver: TokioResolver,
    timeout: Duration,
}

impl FcrdnsVerifier {
    pub fn new(nameserver: SocketAddr, timeout: Duration) -> Self {
        let servers =
            NameServerConfigGroup::from_ips_clear(&[nameserver.ip()], nameserver.port(), true);
        let config = ResolverConfig::from_parts(None, vec![], servers);
        let mut builder =
            TokioResolver::builder_with_config(config, TokioConnectionProvider::default());
        builder.options_mut().timeout = timeout;
        Self {
            resolver: builder.build(),
            timeout,
        }
    }

    async fn reverse(&self, ip: IpAddr) -> Result<String, FcrdnsError> {
        let lookup = tokio::time::timeout(self.timeout, self.resolver.reverse_lookup(ip))
            .await
            .map_err(|_| FcrdnsError::Timeout)??;
        let name = lookup.iter().next().ok_or(FcrdnsError::NoPtr)?;
        Ok(name.to_string())
    }

    async fn forward(&self, name: &str, ip: IpAddr) -> Result<IpAddr, FcrdnsError> {
        let first = match ip {
            IpAddr::V4(_) => {
                let lookup =
                    tokio::time::timeout(self.timeout, self.resolver.ipv4_lookup(name))
                        .await
                        .map_err(|_| FcrdnsError::Timeout)??;
                lookup.iter().next().map(|a| IpAddr::V4(a.0))
            }
            IpAddr::V6(_) => {
                let lookup =
                    tokio::time::timeout(self.timeout, self.resolver.ipv6_lookup(name))
                        .await
                        .map_err(|_| FcrdnsError::Timeout)??;
                lookup.iter().next().map(|aaaa| IpAddr::V6(aaaa.0))
            }
        };
        first.ok_or_else(|| FcrdnsError::NoAnswer(name.to_string()))
    }
}

#[async_trait]
impl CrawlerVerifier for FcrdnsVerifier {
    async fn verify(&self, ip: IpAddr) -> Result<String, FcrdnsError> {
        let name = self.reverse(ip).await?;
        debug!(ip = %ip, ptr = %name, "reverse lookup");

        let forward = self.forward(&name, ip).await?;
        if forward != ip {
            return Err(FcrdnsError::Mismatch { ip, forward });
        }
        Ok(name)
    }
}

/// A verifier backed by a fixed table, for tests. Addresses absent from
/// the table fail with [`FcrdnsError::NoPtr`].
#[derive(Debug, Clone, Default)]
pub struct StaticVerifier {
    domains: std::collections::HashMap<IpAddr, String>,
}

impl StaticVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a forward-confirmed domain for an address.
    pub fn with_domain(mut self, ip: IpAddr, domain: &str) -> Self {
        self.domains.insert(ip, domain.to_string());
        self
    }
}

#[async_trait]
impl CrawlerVerifier for StaticVerifier {
    async fn verify(&self, ip: IpAddr) -> Result<String, FcrdnsError> {
        self.domains.get(&ip).cloned().ok_or(FcrdnsError::NoPtr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitelist_suffixes() {
        assert!(is_verified_crawler("crawl-66-249-66-1.googlebot.com."));
        assert!(is_verified_crawler("rate-limited-proxy-1.google.com."));
        assert!(is_verified_crawler("spider-5-255-253-1.yandex.com."));
        assert!(is_verified_crawler("5-255-253-1.spider.yandex.net."));
        assert!(is_verified_crawler("spider.yandex.ru."));
        assert!(is_verified_crawler("msnbot-207-46-13-1.search.msn.com."));
    }

    #[test]
    fn test_whitelist_accepts_undotted_input() {
        assert!(is_verified_crawler("crawl-66-249-66-1.googlebot.com"));
    }

    #[test]
    fn test_whitelist_rejects_lookalikes() {
        // Suffix must match after a label boundary dot
        assert!(!is_verified_crawler("evilgooglebot.com."));
        assert!(!is_verified_crawler("googlebot.com.attacker.net."));
        assert!(!is_verified_crawler("crawler.bing.com."));
        assert!(!is_verified_crawler("host.example.com."));
    }

    #[test]
    fn test_bare_suffix_domain_not_whitelisted() {
        // "googlebot.com." itself has no leading label and is not matched
        assert!(!is_verified_crawler("googlebot.com."));
    }

    #[tokio::test]
    async fn test_static_verifier() {
        let ip: IpAddr = "66.249.66.1".parse().unwrap();
        let verifier = StaticVerifier::new().with_domain(ip, "crawl-66-249-66-1.googlebot.com.");

        assert_eq!(
            verifier.verify(ip).await.unwrap(),
            "crawl-66-249-66-1.googlebot.com."
        );
        let err = verifier.verify("192.0.2.1".parse().unwrap()).await.unwrap_err();
        assert!(matches!(err, FcrdnsError::NoPtr));
    }

    #[test]
    fn test_error_messages_fit_annotations() {
        let err = FcrdnsError::Mismatch {
            ip: "66.249.66.1".parse().unwrap(),
            forward: "192.0.2.7".parse().unwrap(),
        };
        assert_eq!(
            err.to_string(),
            "forward answer 192.0.2.7 does not match 66.249.66.1"
        );
        assert_eq!(FcrdnsError::Timeout.to_string(), "dns timeout");
    }
}
