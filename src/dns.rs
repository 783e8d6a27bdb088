//! Outgoing server-to-server endpoint resolution.
//!
//! Converts a target domain into connectable endpoints: all
//! `_xmpp-server._tcp.{domain}` SRV records sorted by priority (RFC
//! 2782), falling back to `domain:5269` when no records exist. Explicit
//! `host:port` inputs skip SRV entirely.
//!
//! The caller tries endpoints in order, moving to the next on connection
//! failure.

use tracing::{info, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use crate::error::{Error, Result};

/// Default server-to-server port (RFC 6120).
pub const S2S_PORT: u16 = 5269;

/// A resolved remote-server endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
    /// The XMPP domain the connection is for. `None` when the host was
    /// given explicitly and is the domain itself.
    pub domain: Option<String>,
}

/// Result of parsing a dial target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedTarget {
    /// Explicit endpoint: skip SRV, connect directly.
    Direct(String, u16),
    /// Domain only: perform SRV resolution.
    Domain(String),
}

/// Parse a dial target: `host:port` connects directly, anything else is
/// a domain for SRV resolution.
pub fn parse_target(target: &str) -> ParsedTarget {
    let trimmed = target.trim();

    // rsplit_once so IPv6 literals keep their colons
    if let Some((host, port_str)) = trimmed.rsplit_once(':') {
        if let Ok(port) = port_str.parse::<u16>() {
            return ParsedTarget::Direct(host.to_string(), port);
        }
    }

    ParsedTarget::Domain(trimmed.to_string())
}

/// Resolve the endpoints for `domain` in connection-attempt order:
/// `_xmpp-server._tcp.{domain}` SRV records sorted by priority ascending
/// then weight descending, or `domain:5269` if no records exist.
pub async fn resolve_server(domain: &str) -> Result<Vec<ServerEndpoint>> {
    if domain.is_empty() {
        return Err(Error::Resolution {
            domain: domain.to_string(),
            reason: "empty domain".to_string(),
        });
    }

    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "system DNS config unavailable; using default resolver");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        }
    };

    let srv_name = format!("_xmpp-server._tcp.{}", domain);
    let mut endpoints: Vec<ServerEndpoint> = Vec::new();

    match resolver.srv_lookup(&srv_name).await {
        Ok(lookup) => {
            let mut records: Vec<_> = lookup.iter().collect();
            // Priority ascending (lower preferred), weight descending
            records.sort_by(|a, b| {
                a.priority()
                    .cmp(&b.priority())
                    .then(b.weight().cmp(&a.weight()))
            });
            for r in &records {
                let target = r.target().to_string().trim_end_matches('.').to_string();
                // RFC 2782: a "." target means the service is explicitly
                // not available
                if target.is_empty() {
                    info!(domain, "SRV record with '.' target, skipping");
                    continue;
                }
                info!(domain, host = %target, port = r.port(),
                    priority = r.priority(), weight = r.weight(), "SRV record");
                endpoints.push(ServerEndpoint {
                    host: target,
                    port: r.port(),
                    domain: Some(domain.to_string()),
                });
            }
        }
        Err(e) => {
            info!(domain, srv = %srv_name, error = %e, "SRV lookup failed");
        }
    }

    if endpoints.is_empty() {
        warn!(domain, port = S2S_PORT, "no SRV records; using fallback endpoint");
        endpoints.push(ServerEndpoint {
            host: domain.to_string(),
            port: S2S_PORT,
            domain: None,
        });
    }

    Ok(endpoints)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_explicit_host_port() {
        assert_eq!(
            parse_target("s2s.example.com:5269"),
            ParsedTarget::Direct("s2s.example.com".to_string(), 5269)
        );
        assert_eq!(
            parse_target("s2s.example.com:15269"),
            ParsedTarget::Direct("s2s.example.com".to_string(), 15269)
        );
    }

    #[test]
    fn test_parse_bare_domain() {
        assert_eq!(
            parse_target("example.com"),
            ParsedTarget::Domain("example.com".to_string())
        );
        assert_eq!(
            parse_target("  example.com  "),
            ParsedTarget::Domain("example.com".to_string())
        );
    }

    #[test]
    fn test_parse_non_numeric_port_is_a_domain() {
        // "example.com:xmpp" has no numeric port, so it is not Direct
        assert_eq!(
            parse_target("example.com:xmpp"),
            ParsedTarget::Domain("example.com:xmpp".to_string())
        );
    }

    #[tokio::test]
    async fn test_empty_domain_is_an_error() {
        assert!(resolve_server("").await.is_err());
    }

    #[tokio::test]
    async fn test_unresolvable_domain_falls_back_to_5269() {
        let endpoints = resolve_server("no-such-xmpp-domain.invalid").await.unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].host, "no-such-xmpp-domain.invalid");
        assert_eq!(endpoints[0].port, S2S_PORT);
        assert_eq!(endpoints[0].domain, None);
    }
}
