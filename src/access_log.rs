//! Access log line parsing.
//!
//! The front-end server writes one tab-separated record per request:
//!
//! ```text
//! time_iso8601<TAB>country<TAB>ip<TAB>scheme<TAB>host<TAB>method<TAB>"uri"<TAB>status<TAB>bytes<TAB>"referer"<TAB>"user_agent"
//! ```
//!
//! Additional trailing fields are permitted and ignored. A line that does
//! not match is not fatal; callers log a diagnostic and move on.

use std::net::IpAddr;

/// One parsed access-log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRecord {
    /// Request timestamp, ISO-8601 with second precision.
    pub time: String,
    /// Two-letter country code as logged by the GeoIP module.
    pub country: String,
    /// Client address.
    pub ip: IpAddr,
    pub scheme: String,
    pub host: String,
    pub method: String,
    /// Request URI, quotes stripped, query string included.
    pub uri: String,
    /// Response status as logged (three digits).
    pub status: String,
    pub bytes: u64,
    pub referer: String,
    /// User-Agent header, quotes stripped.
    pub user_agent: String,
}

impl AccessRecord {
    /// Parse a tab-separated access-log line.
    ///
    /// Returns `None` when the line does not have the expected shape.
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split('\t');
        let time = fields.next()?.to_string();
        let country = fields.next()?.to_string();
        let ip: IpAddr = fields.next()?.parse().ok()?;
        let scheme = fields.next()?.to_string();
        let host = fields.next()?.to_string();
        let method = fields.next()?.to_string();
        let uri = unquote(fields.next()?).to_string();
        let status = fields.next()?.to_string();
        let bytes: u64 = fields.next()?.parse().ok()?;
        let referer = unquote(fields.next()?).to_string();
        let user_agent = unquote(fields.next()?).to_string();

        Some(Self {
            time,
            country,
            ip,
            scheme,
            host,
            method,
            uri,
            status,
            bytes,
            referer,
            user_agent,
        })
    }
}

/// Strip one pair of surrounding double quotes, if present.
fn unquote(field: &str) -> &str {
    field
        .strip_prefix('"')
        .and_then(|f| f.strip_suffix('"'))
        .unwrap_or(field)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINE: &str = "2024-01-01T00:00:59+03:00\tCN\t10.1.2.3\thttps\texample.com\tGET\t\"/index.html?q=1\"\t200\t1234\t\"-\"\t\"Mozilla/5.0\"";

    #[test]
    fn test_parse_full_line() {
        let rec = AccessRecord::parse(LINE).unwrap();
        assert_eq!(rec.time, "2024-01-01T00:00:59+03:00");
        assert_eq!(rec.country, "CN");
        assert_eq!(rec.ip, "10.1.2.3".parse::<IpAddr>().unwrap());
        assert_eq!(rec.method, "GET");
        assert_eq!(rec.uri, "/index.html?q=1");
        assert_eq!(rec.status, "200");
        assert_eq!(rec.bytes, 1234);
        assert_eq!(rec.user_agent, "Mozilla/5.0");
    }

    #[test]
    fn test_parse_ipv6() {
        let line = LINE.replace("10.1.2.3", "2001:db8::1");
        let rec = AccessRecord::parse(&line).unwrap();
        assert_eq!(rec.ip, "2001:db8::1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_parse_extra_fields_ignored() {
        let line = format!("{}\tupstream=10ms\tcache=HIT", LINE);
        assert!(AccessRecord::parse(&line).is_some());
    }

    #[test]
    fn test_parse_rejects_short_line() {
        assert!(AccessRecord::parse("2024-01-01T00:00:59\tCN\t10.1.2.3").is_none());
    }

    #[test]
    fn test_parse_rejects_bad_ip() {
        let line = LINE.replace("10.1.2.3", "not-an-ip");
        assert!(AccessRecord::parse(&line).is_none());
    }

    #[test]
    fn test_unquote_only_strips_pairs() {
        assert_eq!(unquote("\"a b\""), "a b");
        assert_eq!(unquote("\"unterminated"), "\"unterminated");
        assert_eq!(unquote("bare"), "bare");
    }
}
