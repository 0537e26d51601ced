use crate::error::ProxyFailure;
use crate::router::Route;
use pingora_core::prelude::HttpPeer;
use pingora_core::{Error, ErrorSource, ErrorType};
use std::net::SocketAddr;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const TOTAL_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolve the route's upstream host without blocking the worker.
pub async fn resolve_addr(route: &Route) -> pingora_core::Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((route.host.as_str(), route.port))
        .await
        .map_err(|e| {
            Error::explain(
                ErrorType::ConnectNoRoute,
                format!("dns lookup for {} failed: {}", route.host, e),
            )
        })?;
    addrs.next().ok_or_else(|| {
        Error::explain(
            ErrorType::ConnectNoRoute,
            format!("dns lookup for {} returned no addresses", route.host),
        )
    })
}

/// Build the peer for one upstream call. Redirects are never followed by
/// the proxy, so 3xx responses reach the response filter as-is.
pub async fn peer_for(route: &Route, timeout: Duration) -> pingora_core::Result<Box<HttpPeer>> {
    let addr = resolve_addr(route).await?;
    let mut peer = HttpPeer::new(addr, route.tls, route.host.clone());

    peer.options.connection_timeout = Some(CONNECT_TIMEOUT.min(timeout));
    peer.options.total_connection_timeout = Some(TOTAL_CONNECT_TIMEOUT.min(timeout));
    peer.options.read_timeout = Some(timeout);
    peer.options.write_timeout = Some(timeout);
    peer.options.idle_timeout = Some(timeout);

    Ok(Box::new(peer))
}

/// Map a Pingora failure onto what the client should see.
pub fn classify_failure(etype: &ErrorType, source: &ErrorSource) -> ProxyFailure {
    use ErrorType::*;
    match etype {
        HTTPStatus(code) if (100..600).contains(code) => ProxyFailure::Status(*code),
        ConnectTimedout
        | ConnectRefused
        | ConnectNoRoute
        | ConnectError
        | TLSHandshakeFailure
        | TLSHandshakeTimedout
        | InvalidCert
        | HandshakeError
        | SocketError
        | BindError
        | ConnectProxyFailure => ProxyFailure::UpstreamUnreachable,
        _ => match source {
            ErrorSource::Upstream => ProxyFailure::UpstreamUnreachable,
            ErrorSource::Downstream => ProxyFailure::ClientGone,
            _ => ProxyFailure::Unexpected,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::tests::router;
    use pingora_core::upstreams::peer::Peer;

    #[test]
    fn test_connect_failures_are_unreachable() {
        for etype in [
            ErrorType::ConnectTimedout,
            ErrorType::ConnectRefused,
            ErrorType::ConnectNoRoute,
            ErrorType::TLSHandshakeFailure,
            ErrorType::InvalidCert,
        ] {
            assert_eq!(
                classify_failure(&etype, &ErrorSource::Unset),
                ProxyFailure::UpstreamUnreachable
            );
        }
    }

    #[test]
    fn test_upstream_stream_errors_are_unreachable() {
        assert_eq!(
            classify_failure(&ErrorType::ReadError, &ErrorSource::Upstream),
            ProxyFailure::UpstreamUnreachable
        );
        assert_eq!(
            classify_failure(&ErrorType::ReadTimedout, &ErrorSource::Upstream),
            ProxyFailure::UpstreamUnreachable
        );
        assert_eq!(
            classify_failure(&ErrorType::InvalidHTTPHeader, &ErrorSource::Upstream),
            ProxyFailure::UpstreamUnreachable
        );
    }

    #[test]
    fn test_downstream_errors_write_nothing() {
        let f = classify_failure(&ErrorType::ConnectionClosed, &ErrorSource::Downstream);
        assert_eq!(f, ProxyFailure::ClientGone);
        assert_eq!(f.status_code(), None);
    }

    #[test]
    fn test_explicit_status() {
        assert_eq!(
            classify_failure(&ErrorType::HTTPStatus(413), &ErrorSource::Downstream),
            ProxyFailure::Status(413)
        );
        assert_eq!(
            classify_failure(&ErrorType::HTTPStatus(0), &ErrorSource::Internal),
            ProxyFailure::Unexpected
        );
    }

    #[test]
    fn test_internal_errors_are_unexpected() {
        assert_eq!(
            classify_failure(&ErrorType::InternalError, &ErrorSource::Internal),
            ProxyFailure::Unexpected
        );
        assert_eq!(
            classify_failure(&ErrorType::UnknownError, &ErrorSource::Unset),
            ProxyFailure::Unexpected
        );
    }

    #[tokio::test]
    async fn test_peer_for_literal_ip() {
        let r = router(&[("/local", "http://127.0.0.1:8081/base")]);
        let (route, _) = r.resolve("/local").unwrap();
        let peer = peer_for(route, Duration::from_secs(30)).await.unwrap();
        assert_eq!(peer.address().to_string(), "127.0.0.1:8081");
        assert_eq!(peer.options.read_timeout, Some(Duration::from_secs(30)));
        assert_eq!(peer.options.connection_timeout, Some(CONNECT_TIMEOUT));
    }

    #[tokio::test]
    async fn test_short_timeout_caps_connect() {
        let r = router(&[("/local", "http://127.0.0.1:8081")]);
        let (route, _) = r.resolve("/local").unwrap();
        let peer = peer_for(route, Duration::from_secs(2)).await.unwrap();
        assert_eq!(peer.options.connection_timeout, Some(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_resolve_ipv6_literal() {
        let r = router(&[("/v6", "https://[::1]:9443")]);
        let (route, _) = r.resolve("/v6").unwrap();
        let addr = resolve_addr(route).await.unwrap();
        assert_eq!(addr, "[::1]:9443".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_unresolvable_host_is_no_route() {
        let r = router(&[("/bad", "https://no-such-host.invalid")]);
        let (route, _) = r.resolve("/bad").unwrap();
        let err = resolve_addr(route).await.unwrap_err();
        assert_eq!(err.etype(), &ErrorType::ConnectNoRoute);
        assert_eq!(
            classify_failure(err.etype(), err.esource()),
            ProxyFailure::UpstreamUnreachable
        );
    }
}
