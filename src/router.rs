use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use url::{Host, Url};

/// Route table compiled into the binary.
const BUILTIN_ROUTES: &str = include_str!("../routes.yaml");

/// One entry of the route table as written in `routes.yaml`
#[derive(Debug, Clone, Deserialize)]
pub struct RouteEntry {
    pub prefix: String,
    pub origin: String,
    #[serde(default)]
    pub base_domain: Option<String>,
    #[serde(default)]
    pub origin_check: bool,
    #[serde(default)]
    pub label: Option<String>,
}

/// A validated route: prefix plus everything needed to reach its upstream.
#[derive(Debug)]
pub struct Route {
    pub prefix: String,
    pub origin: Url,
    /// Host used for DNS and SNI (no brackets for IPv6)
    pub host: String,
    pub port: u16,
    pub tls: bool,
    /// Origin path without trailing slash, empty for the root
    pub base_path: String,
    /// Redirects to this domain (or a subdomain) are rewritten back onto the proxy
    pub base_domain: String,
    pub origin_check: bool,
    pub label: Option<String>,
}

impl Route {
    fn from_entry(entry: &RouteEntry) -> Result<Self, ConfigError> {
        if entry.prefix.is_empty() || !entry.prefix.starts_with('/') {
            return Err(ConfigError::RouteTable(format!(
                "prefix {:?} must be non-empty and start with '/'",
                entry.prefix
            )));
        }

        let origin = Url::parse(&entry.origin).map_err(|e| {
            ConfigError::RouteTable(format!("origin {:?} for {}: {}", entry.origin, entry.prefix, e))
        })?;

        let tls = match origin.scheme() {
            "https" => true,
            "http" => false,
            other => {
                return Err(ConfigError::RouteTable(format!(
                    "origin {} for {} uses unsupported scheme {}",
                    entry.origin, entry.prefix, other
                )))
            }
        };

        let host = match origin.host() {
            Some(Host::Domain(d)) => d.to_ascii_lowercase(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            None => {
                return Err(ConfigError::RouteTable(format!(
                    "origin {} for {} has no host",
                    entry.origin, entry.prefix
                )))
            }
        };

        if origin.query().is_some() || origin.fragment().is_some() {
            return Err(ConfigError::RouteTable(format!(
                "origin {} for {} must not carry a query or fragment",
                entry.origin, entry.prefix
            )));
        }
        if !origin.username().is_empty() || origin.password().is_some() {
            return Err(ConfigError::RouteTable(format!(
                "origin for {} must not embed credentials",
                entry.prefix
            )));
        }

        // Known default exists for both accepted schemes
        let port = origin.port_or_known_default().unwrap_or(if tls { 443 } else { 80 });
        let base_path = origin.path().trim_end_matches('/').to_string();
        let base_domain = entry
            .base_domain
            .as_deref()
            .map(|d| d.trim_start_matches('.').to_ascii_lowercase())
            .unwrap_or_else(|| host.clone());

        Ok(Route {
            prefix: entry.prefix.clone(),
            host,
            port,
            tls,
            base_path,
            base_domain,
            origin_check: entry.origin_check,
            label: entry.label.clone(),
            origin,
        })
    }

    /// `host[:port]` as sent in the upstream `Host` header; default ports are omitted.
    pub fn authority(&self) -> String {
        let host = self.origin.host_str().unwrap_or(&self.host);
        match self.origin.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    /// Origin-form request target for the upstream: base path + remainder + query.
    /// An empty remainder addresses the upstream root.
    pub fn upstream_path(&self, remainder: &str, query: Option<&str>) -> String {
        let mut path = String::with_capacity(
            self.base_path.len() + remainder.len() + query.map_or(0, |q| q.len() + 1) + 1,
        );
        path.push_str(&self.base_path);
        if !remainder.starts_with('/') {
            path.push('/');
        }
        path.push_str(remainder);
        if let Some(q) = query {
            path.push('?');
            path.push_str(q);
        }
        path
    }

    /// Absolute URL of a request sent to this upstream.
    pub fn target_url(&self, upstream_path: &str) -> String {
        format!("{}://{}{}", self.origin.scheme(), self.authority(), upstream_path)
    }

    /// Whether `host` is the configured base domain or one of its subdomains.
    pub fn matches_base_domain(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        host == self.base_domain
            || host
                .strip_suffix(self.base_domain.as_str())
                .map(|rest| rest.ends_with('.'))
                .unwrap_or(false)
    }
}

/// Router maps request paths to upstream routes by longest string prefix.
pub struct Router {
    /// Sorted by descending prefix length
    routes: Vec<Arc<Route>>,
}

impl Router {
    /// Build the router from the table compiled into the binary.
    pub fn builtin() -> Result<Self, ConfigError> {
        Self::from_yaml(BUILTIN_ROUTES)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let entries: Vec<RouteEntry> = serde_yaml::from_str(yaml)
            .map_err(|e| ConfigError::RouteTable(format!("invalid route table: {}", e)))?;
        Self::build(&entries)
    }

    /// Validate entries and build the router.
    pub fn build(entries: &[RouteEntry]) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        let mut routes = Vec::with_capacity(entries.len());

        for entry in entries {
            if !seen.insert(entry.prefix.as_str()) {
                return Err(ConfigError::RouteTable(format!(
                    "duplicate prefix {}",
                    entry.prefix
                )));
            }
            routes.push(Arc::new(Route::from_entry(entry)?));
        }

        // Longest prefix first so "/openai/v1" is tried before "/openai"
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        Ok(Router { routes })
    }

    /// Find the longest prefix that `path` starts with.
    /// Returns the route and the remainder of the path after the prefix.
    ///
    /// Matching is plain string prefix, not path-segment aware: "/openai"
    /// also matches "/openai-internal/x" (remainder "-internal/x") unless a
    /// longer prefix claims it first.
    pub fn resolve<'a>(&'a self, path: &'a str) -> Option<(&'a Arc<Route>, &'a str)> {
        self.routes
            .iter()
            .find_map(|route| path.strip_prefix(route.prefix.as_str()).map(|rest| (route, rest)))
    }

    /// Routes ordered by prefix, for display.
    pub fn routes_by_prefix(&self) -> Vec<&Arc<Route>> {
        let mut routes: Vec<&Arc<Route>> = self.routes.iter().collect();
        routes.sort_by(|a, b| a.prefix.cmp(&b.prefix));
        routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn entry(prefix: &str, origin: &str) -> RouteEntry {
        RouteEntry {
            prefix: prefix.to_string(),
            origin: origin.to_string(),
            base_domain: None,
            origin_check: false,
            label: None,
        }
    }

    pub(crate) fn router(entries: &[(&str, &str)]) -> Router {
        let entries: Vec<RouteEntry> = entries.iter().map(|(p, o)| entry(p, o)).collect();
        Router::build(&entries).unwrap()
    }

    #[test]
    fn test_builtin_table_is_valid() {
        let r = Router::builtin().unwrap();
        assert!(!r.is_empty());
        let (route, rest) = r.resolve("/openai/v1/models").unwrap();
        assert_eq!(route.host, "api.openai.com");
        assert_eq!(rest, "/v1/models");
    }

    #[test]
    fn test_resolve_prefix() {
        let r = router(&[("/openai", "https://api.openai.com")]);
        let (route, rest) = r.resolve("/openai/v1/models").unwrap();
        assert_eq!(route.prefix, "/openai");
        assert_eq!(rest, "/v1/models");
    }

    #[test]
    fn test_resolve_no_match() {
        let r = router(&[("/openai", "https://api.openai.com")]);
        assert!(r.resolve("/anthropic/v1").is_none());
        assert!(r.resolve("/").is_none());
    }

    #[test]
    fn test_exact_prefix_gives_empty_remainder() {
        let r = router(&[("/openai", "https://api.openai.com")]);
        let (_, rest) = r.resolve("/openai").unwrap();
        assert_eq!(rest, "");
    }

    #[test]
    fn test_longer_prefix_wins_regardless_of_order() {
        let r = router(&[
            ("/openai", "https://api.openai.com"),
            ("/openai/v1", "https://v1.openai.com"),
        ]);
        let (route, rest) = r.resolve("/openai/v1/models").unwrap();
        assert_eq!(route.prefix, "/openai/v1");
        assert_eq!(rest, "/models");

        let (route, _) = r.resolve("/openai/v2/models").unwrap();
        assert_eq!(route.prefix, "/openai");
    }

    #[test]
    fn test_longer_prefix_wins_for_every_pair() {
        let prefixes = ["/a", "/ab", "/abc", "/abc/d", "/b"];
        let entries: Vec<(&str, &str)> = prefixes
            .iter()
            .map(|p| (*p, "https://up.example.com"))
            .collect();
        let r = router(&entries);
        for p1 in prefixes {
            for p2 in prefixes {
                if p2.len() > p1.len() && p2.starts_with(p1) {
                    let path = format!("{}/tail", p2);
                    let (route, _) = r.resolve(&path).unwrap();
                    assert_eq!(route.prefix, p2, "{} must not shadow {}", p1, p2);
                }
            }
        }
    }

    #[test]
    fn test_string_prefix_matches_across_segment_boundary() {
        // Known behaviour: matching is not path-segment aware
        let r = router(&[("/openai", "https://api.openai.com")]);
        let (route, rest) = r.resolve("/openai-internal/x").unwrap();
        assert_eq!(route.prefix, "/openai");
        assert_eq!(rest, "-internal/x");
    }

    #[test]
    fn test_more_specific_sibling_claims_its_paths() {
        let r = router(&[
            ("/openai", "https://api.openai.com"),
            ("/openai-internal", "https://internal.example.com"),
        ]);
        let (route, rest) = r.resolve("/openai-internal/x").unwrap();
        assert_eq!(route.prefix, "/openai-internal");
        assert_eq!(rest, "/x");
    }

    #[test]
    fn test_duplicate_prefix_rejected() {
        let entries = vec![
            entry("/openai", "https://a.com"),
            entry("/openai", "https://b.com"),
        ];
        assert!(Router::build(&entries).is_err());
    }

    #[test]
    fn test_prefix_validation() {
        assert!(Router::build(&[entry("", "https://a.com")]).is_err());
        assert!(Router::build(&[entry("openai", "https://a.com")]).is_err());
    }

    #[test]
    fn test_origin_validation() {
        assert!(Router::build(&[entry("/a", "not a url")]).is_err());
        assert!(Router::build(&[entry("/a", "ftp://files.example.com")]).is_err());
        assert!(Router::build(&[entry("/a", "https://a.com/?q=1")]).is_err());
        assert!(Router::build(&[entry("/a", "https://a.com/#frag")]).is_err());
        assert!(Router::build(&[entry("/a", "https://user:pw@a.com")]).is_err());
    }

    #[test]
    fn test_invalid_yaml_rejected() {
        assert!(Router::from_yaml("- prefix: [").is_err());
        assert!(Router::from_yaml("- origin: https://a.com").is_err());
    }

    #[test]
    fn test_yaml_optional_fields() {
        let r = Router::from_yaml(
            "- prefix: /g\n  origin: https://generativelanguage.googleapis.com\n  base_domain: .GoogleApis.com\n  origin_check: true\n  label: Gemini\n",
        )
        .unwrap();
        let (route, _) = r.resolve("/g/x").unwrap();
        assert_eq!(route.base_domain, "googleapis.com");
        assert!(route.origin_check);
        assert_eq!(route.label.as_deref(), Some("Gemini"));
    }

    #[test]
    fn test_route_ports_and_tls() {
        let r = router(&[
            ("/s", "https://secure.example.com"),
            ("/p", "http://plain.example.com"),
            ("/c", "http://10.0.0.5:8081"),
        ]);
        let (s, _) = r.resolve("/s").unwrap();
        assert!(s.tls);
        assert_eq!(s.port, 443);
        assert_eq!(s.authority(), "secure.example.com");

        let (p, _) = r.resolve("/p").unwrap();
        assert!(!p.tls);
        assert_eq!(p.port, 80);

        let (c, _) = r.resolve("/c").unwrap();
        assert_eq!(c.port, 8081);
        assert_eq!(c.authority(), "10.0.0.5:8081");
    }

    #[test]
    fn test_ipv6_origin() {
        let r = router(&[("/v6", "http://[::1]:9000")]);
        let (route, _) = r.resolve("/v6/x").unwrap();
        assert_eq!(route.host, "::1");
        assert_eq!(route.authority(), "[::1]:9000");
    }

    #[test]
    fn test_upstream_path_joins_base_path() {
        let r = router(&[("/groq", "https://api.groq.com/openai/")]);
        let (route, rest) = r.resolve("/groq/v1/models").unwrap();
        assert_eq!(route.upstream_path(rest, Some("x=1")), "/openai/v1/models?x=1");
    }

    #[test]
    fn test_upstream_path_empty_remainder_is_root() {
        let r = router(&[("/openai", "https://api.openai.com")]);
        let (route, rest) = r.resolve("/openai").unwrap();
        assert_eq!(route.upstream_path(rest, None), "/");
    }

    #[test]
    fn test_upstream_path_inserts_separator() {
        let r = router(&[("/openai", "https://api.openai.com")]);
        let (route, rest) = r.resolve("/openai-internal").unwrap();
        assert_eq!(route.upstream_path(rest, None), "/-internal");
    }

    #[test]
    fn test_target_url() {
        let r = router(&[("/openai", "https://api.openai.com")]);
        let (route, _) = r.resolve("/openai").unwrap();
        assert_eq!(
            route.target_url("/v1/models?x=1"),
            "https://api.openai.com/v1/models?x=1"
        );
    }

    #[test]
    fn test_base_domain_matching() {
        let r = router(&[("/openai", "https://api.openai.com")]);
        let (route, _) = r.resolve("/openai").unwrap();
        assert!(route.matches_base_domain("api.openai.com"));
        assert!(route.matches_base_domain("API.OpenAI.com"));
        assert!(route.matches_base_domain("eu.api.openai.com"));
        assert!(!route.matches_base_domain("openai.com"));
        assert!(!route.matches_base_domain("evilapi.openai.com"));
        assert!(!route.matches_base_domain("api.openai.com.evil.net"));
    }

    #[test]
    fn test_routes_by_prefix_sorted() {
        let r = router(&[
            ("/zeta", "https://z.com"),
            ("/alpha", "https://a.com"),
            ("/alpha/long", "https://b.com"),
        ]);
        let prefixes: Vec<&str> = r.routes_by_prefix().iter().map(|r| r.prefix.as_str()).collect();
        assert_eq!(prefixes, vec!["/alpha", "/alpha/long", "/zeta"]);
        assert_eq!(r.len(), 3);
    }

    // ─── Security: malicious paths ──────────────────────────

    #[test]
    fn test_path_traversal_still_prefix_matched() {
        let r = router(&[("/openai", "https://api.openai.com")]);
        let (_, rest) = r.resolve("/openai/../admin").unwrap();
        assert_eq!(rest, "/../admin");
    }

    #[test]
    fn test_null_bytes_in_path() {
        let r = router(&[("/openai", "https://api.openai.com")]);
        assert!(r.resolve("/openai\0/x").is_some());
        assert!(r.resolve("\0/openai").is_none());
    }

    #[test]
    fn test_empty_path() {
        let r = router(&[("/openai", "https://api.openai.com")]);
        assert!(r.resolve("").is_none());
    }

    #[test]
    fn test_very_long_path() {
        let r = router(&[("/openai", "https://api.openai.com")]);
        let long_path = format!("/openai/{}", "a".repeat(100_000));
        let (_, rest) = r.resolve(&long_path).unwrap();
        assert_eq!(rest.len(), 100_001);
    }
}
