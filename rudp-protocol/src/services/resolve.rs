use std::net::SocketAddr;

use tokio::net::lookup_host;
use tracing::debug;

use crate::error::RudpError;

/// Address family policy for hostname resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpMode {
    Any,
    V4Only,
    V6Only,
}

/// Resolve host and port into candidate socket addresses, filtered
/// by family, in resolver order. The first entry is the one a
/// connect should try; the rest are fallbacks for a later attempt.
pub async fn resolve_host(
    host: &str,
    port: u16,
    mode: IpMode,
) -> Result<Vec<SocketAddr>, RudpError> {
    let addrs = lookup_host((host, port))
        .await
        .map_err(|source| RudpError::ResolverFailed {
            host: host.to_string(),
            source,
        })?;
    let candidates: Vec<SocketAddr> = addrs
        .filter(|addr| match mode {
            IpMode::Any => true,
            IpMode::V4Only => addr.is_ipv4(),
            IpMode::V6Only => addr.is_ipv6(),
        })
        .collect();
    debug!("resolved {}:{} to {} addresses", host, port, candidates.len());
    if candidates.is_empty() {
        return Err(RudpError::AddressExhausted(format!("{}:{}", host, port)));
    }
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn numeric_v4_resolves() {
        let addrs = resolve_host("127.0.0.1", 4242, IpMode::Any).await.unwrap();
        assert_eq!(addrs.len(), 1);
        assert!(addrs[0].is_ipv4());
        assert_eq!(addrs[0].port(), 4242);
    }

    #[tokio::test]
    async fn family_filter_can_exhaust() {
        let err = resolve_host("127.0.0.1", 4242, IpMode::V6Only)
            .await
            .unwrap_err();
        assert!(matches!(err, RudpError::AddressExhausted(_)));
    }
}
