//! Policy file loading and threshold resolution.
//!
//! The policy file is a plain-text table of directives:
//!
//! ```text
//! # requests-per-minute ceilings
//! limit 10.0.0.0/8 100
//! limit CN 200
//! limit ALL 600
//!
//! # how long an offender stays blocked
//! block 10.1.2.3 7d
//! block ALL 24h
//!
//! resolver 127.0.0.1:53
//! ```
//!
//! Entities are a literal IP, a CIDR block, an uppercase ISO country
//! code, or `ALL`. Limits cascade from most to least specific:
//! exact IP, then longest-prefix CIDR, then country, then `ALL`.
//! The policy is loaded once at startup and never mutated.

use ipnet::IpNet;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Smallest ceiling the policy accepts. Anything lower would block
/// casual browsing.
pub const MIN_LIMIT: u64 = 60;

/// Ceiling used for `none` (effectively unlimited).
pub const UNLIMITED: u64 = u64::MAX;

/// Catch-all entity key.
pub const ALL: &str = "ALL";

const DEFAULT_LIMIT: u64 = 600;
const DEFAULT_BLOCK_SECS: u64 = 24 * 3600;
const DEFAULT_RESOLVER: SocketAddr =
    SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), 53);
const DEFAULT_RESOLVER_TIMEOUT: Duration = Duration::from_secs(5);

/// Policy file errors. All of these abort startup.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to read policy file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("line {line}: expected '<directive> <entity> <value>'")]
    Malformed { line: usize },
    #[error("line {line}: unknown directive '{directive}'")]
    UnknownDirective { line: usize, directive: String },
    #[error("line {line}: duplicate {directive} entry for '{entity}'")]
    Duplicate {
        line: usize,
        directive: &'static str,
        entity: String,
    },
    #[error("line {line}: invalid limit '{value}' (expected an integer or 'none')")]
    InvalidLimit { line: usize, value: String },
    #[error("line {line}: limit {value} is below the minimum of {MIN_LIMIT}")]
    LimitTooLow { line: usize, value: u64 },
    #[error("line {line}: invalid block duration '{value}' (expected <n>h or <n>d, n >= 1)")]
    InvalidDuration { line: usize, value: String },
    #[error("line {line}: invalid resolver address '{value}'")]
    InvalidResolver { line: usize, value: String },
    #[error("line {line}: invalid resolver timeout '{value}' (expected seconds)")]
    InvalidTimeout { line: usize, value: String },
}

/// Immutable filtering policy.
#[derive(Debug, Clone)]
pub struct Policy {
    /// Requests-per-minute ceiling per entity.
    limit: HashMap<String, u64>,
    /// Block duration in seconds per entity.
    block: HashMap<String, u64>,
    /// CIDR keys of `limit`, descending prefix length (longest match wins).
    limit_cidr: Vec<IpNet>,
    /// Nameserver consulted for crawler verification.
    pub resolver: SocketAddr,
    /// Per-lookup DNS timeout.
    pub resolver_timeout: Duration,
}

impl Policy {
    /// Load and parse the policy file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, PolicyError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| PolicyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse policy text.
    pub fn parse(content: &str) -> Result<Self, PolicyError> {
        let mut limit: HashMap<String, u64> = HashMap::new();
        let mut block: HashMap<String, u64> = HashMap::new();
        let mut resolver = DEFAULT_RESOLVER;
        let mut resolver_timeout = DEFAULT_RESOLVER_TIMEOUT;

        for (idx, raw) in content.lines().enumerate() {
            let line = idx + 1;
            let text = raw.split('#').next().unwrap_or("");
            let text = text.replace('\t', " ").to_lowercase();
            let mut tokens = text.split_whitespace();
            let Some(directive) = tokens.next() else {
                continue;
            };

            match directive {
                "limit" => {
                    let (entity, value) = two_tokens(&mut tokens, line)?;
                    let ceiling = parse_limit(value, line)?;
                    insert_unique(&mut limit, normalize_entity(entity), ceiling, "limit", line)?;
                }
                "block" => {
                    let (entity, value) = two_tokens(&mut tokens, line)?;
                    let secs = parse_duration_secs(value, line)?;
                    insert_unique(&mut block, normalize_entity(entity), secs, "block", line)?;
                }
                "resolver" => {
                    let value = one_token(&mut tokens, line)?;
                    resolver = parse_resolver(value).ok_or_else(|| PolicyError::InvalidResolver {
                        line,
                        value: value.to_string(),
                    })?;
                }
                "resolver_timeout" => {
                    let value = one_token(&mut tokens, line)?;
                    let secs: u64 = value.parse().map_err(|_| PolicyError::InvalidTimeout {
                        line,
                        value: value.to_string(),
                    })?;
                    resolver_timeout = Duration::from_secs(secs.max(1));
                }
                other => {
                    return Err(PolicyError::UnknownDirective {
                        line,
                        directive: other.to_string(),
                    });
                }
            }
        }

        limit.entry(ALL.to_string()).or_insert(DEFAULT_LIMIT);
        block.entry(ALL.to_string()).or_insert(DEFAULT_BLOCK_SECS);

        let mut limit_cidr: Vec<IpNet> = limit
            .keys()
            .filter_map(|key| key.parse::<IpNet>().ok())
            .collect();
        limit_cidr.sort_by_key(|net| (std::cmp::Reverse(net.prefix_len()), *net));

        Ok(Self {
            limit,
            block,
            limit_cidr,
            resolver,
            resolver_timeout,
        })
    }

    /// The requests-per-minute ceiling for a client.
    ///
    /// Cascade: exact IP, longest-prefix CIDR, country, `ALL`.
    pub fn limit_for(&self, ip: IpAddr, country: &str) -> u64 {
        if let Some(&ceiling) = self.limit.get(&ip.to_string()) {
            return ceiling;
        }
        for net in &self.limit_cidr {
            if net.contains(&ip) {
                if let Some(&ceiling) = self.limit.get(&net.to_string()) {
                    return ceiling;
                }
            }
        }
        if let Some(&ceiling) = self.limit.get(&country.to_uppercase()) {
            return ceiling;
        }
        self.limit[ALL]
    }

    /// The block duration in seconds for a client.
    ///
    /// Cascade: exact IP, country, `ALL`. The CIDR step is deliberately
    /// absent here; CIDR entries only set ceilings.
    pub fn block_secs_for(&self, ip: IpAddr, country: &str) -> u64 {
        if let Some(&secs) = self.block.get(&ip.to_string()) {
            return secs;
        }
        if let Some(&secs) = self.block.get(&country.to_uppercase()) {
            return secs;
        }
        self.block[ALL]
    }
}

/// Entity normalisation: addresses and CIDRs are stored in canonical
/// form so that lookups by a formatted `IpAddr` always match; everything
/// else (country codes, `ALL`) is uppercased. Keys containing `:` stay
/// as written (v6 text is already canonical lowercase after the line
/// pass).
fn normalize_entity(entity: &str) -> String {
    if let Ok(ip) = entity.parse::<IpAddr>() {
        return ip.to_string();
    }
    if let Ok(net) = entity.parse::<IpNet>() {
        return net.to_string();
    }
    if entity.contains(':') {
        entity.to_string()
    } else {
        entity.to_uppercase()
    }
}

fn one_token<'a>(tokens: &mut impl Iterator<Item = &'a str>, line: usize) -> Result<&'a str, PolicyError> {
    match (tokens.next(), tokens.next()) {
        (Some(value), None) => Ok(value),
        _ => Err(PolicyError::Malformed { line }),
    }
}

fn two_tokens<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
    line: usize,
) -> Result<(&'a str, &'a str), PolicyError> {
    match (tokens.next(), tokens.next(), tokens.next()) {
        (Some(entity), Some(value), None) => Ok((entity, value)),
        _ => Err(PolicyError::Malformed { line }),
    }
}

fn insert_unique(
    table: &mut HashMap<String, u64>,
    entity: String,
    value: u64,
    directive: &'static str,
    line: usize,
) -> Result<(), PolicyError> {
    if table.insert(entity.clone(), value).is_some() {
        return Err(PolicyError::Duplicate {
            line,
            directive,
            entity,
        });
    }
    Ok(())
}

fn parse_limit(value: &str, line: usize) -> Result<u64, PolicyError> {
    if value == "none" {
        return Ok(UNLIMITED);
    }
    let ceiling: u64 = value.parse().map_err(|_| PolicyError::InvalidLimit {
        line,
        value: value.to_string(),
    })?;
    if ceiling < MIN_LIMIT {
        return Err(PolicyError::LimitTooLow {
            line,
            value: ceiling,
        });
    }
    Ok(ceiling)
}

/// Parse `<n>h` or `<n>d` into seconds, n >= 1.
fn parse_duration_secs(value: &str, line: usize) -> Result<u64, PolicyError> {
    let err = || PolicyError::InvalidDuration {
        line,
        value: value.to_string(),
    };
    if !value.is_ascii() || value.is_empty() {
        return Err(err());
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let n: u64 = digits.parse().map_err(|_| err())?;
    if n < 1 {
        return Err(err());
    }
    match unit {
        "h" => Ok(n * 3600),
        "d" => Ok(n * 86_400),
        _ => Err(err()),
    }
}

/// Accept `ip:port` or a bare IP (port 53).
fn parse_resolver(value: &str) -> Option<SocketAddr> {
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Some(addr);
    }
    value.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, 53))
}
