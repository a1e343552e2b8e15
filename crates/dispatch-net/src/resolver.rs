//! Async DNS resolution.
//!
//! Thin wrapper over hickory's tokio resolver. Lookups go through
//! `lookup_ip` so the hosts file is honored, then results are filtered by
//! the requested family mask. Dropping the resolve future cancels the
//! lookup; no result is ever delivered after cancellation.

use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use tracing::debug;

use crate::addr::{NetworkType, SocketAddress};
use crate::error::NetError;

/// Async DNS resolver.
#[derive(Clone)]
pub struct Resolver {
    inner: TokioAsyncResolver,
}

impl Resolver {
    /// Creates a resolver from the system configuration, falling back to
    /// a default public configuration when none is available.
    pub fn new() -> Self {
        let inner = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|_| {
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        Self { inner }
    }

    /// Resolves `host` to socket addresses with `port` attached verbatim,
    /// keeping only families present in `types`.
    ///
    /// A name that resolves but yields no address in the requested
    /// families is a DNS failure.
    pub async fn resolve(
        &self,
        host: &str,
        port: u16,
        types: NetworkType,
    ) -> Result<Vec<SocketAddress>, NetError> {
        if types.is_empty() {
            return Err(NetError::DnsFailure(
                "no address families requested".into(),
            ));
        }

        debug!("resolving {host}");
        let lookup = self
            .inner
            .lookup_ip(host)
            .await
            .map_err(|e| NetError::DnsFailure(e.to_string()))?;

        let addrs: Vec<SocketAddress> = lookup
            .iter()
            .filter(|ip| {
                let family = match ip {
                    std::net::IpAddr::V4(_) => NetworkType::INET,
                    std::net::IpAddr::V6(_) => NetworkType::INET6,
                };
                types.contains(family)
            })
            .map(|ip| SocketAddress::new(ip.into(), port))
            .collect();

        if addrs.is_empty() {
            return Err(NetError::DnsFailure(format!(
                "no addresses for {host} in the requested families"
            )));
        }
        Ok(addrs)
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_mask_is_an_error() {
        let resolver = Resolver::new();
        let res = resolver
            .resolve("localhost", 80, NetworkType::empty())
            .await;
        assert!(matches!(res, Err(NetError::DnsFailure(_))));
    }

    #[tokio::test]
    async fn test_localhost_resolves_with_port_attached() {
        let resolver = Resolver::new();
        let addrs = resolver
            .resolve("localhost", 7080, NetworkType::INET)
            .await
            .expect("localhost should resolve");
        assert!(!addrs.is_empty());
        for addr in &addrs {
            assert_eq!(addr.network_type(), NetworkType::INET);
            assert_eq!(addr.port, 7080);
        }
    }
}
