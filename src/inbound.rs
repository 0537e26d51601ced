use crate::config::{AppConfig, SecurityHeaderPolicy};
use crate::cookies::{self, CookieRules};
use crate::router::Route;
use cookie::{Cookie, SameSite};
use http::header::{self, HeaderName, HeaderValue};
use http::HeaderMap;
use pingora_http::ResponseHeader;
use url::Url;

/// Upstream policy headers that do not hold for content served from the proxy origin
const STRIPPED_SECURITY_HEADERS: &[&str] = &[
    "content-security-policy",
    "content-security-policy-report-only",
    "x-frame-options",
    "strict-transport-security",
];

const LANGUAGE_COOKIE_MAX_AGE: i64 = 365 * 24 * 3600;

/// Per-request inputs to the response rewrite
pub struct ResponseContext<'a> {
    pub route: &'a Route,
    /// Absolute URL the request was sent to; relative redirects resolve against it
    pub target_url: &'a str,
    pub language: Option<&'a str>,
}

/// Rewrites upstream response headers before they reach the client.
pub struct InboundPolicy {
    security: SecurityHeaderPolicy,
    cookie_rules: CookieRules,
    domain: String,
    language_cookie: Option<String>,
}

impl InboundPolicy {
    pub fn new(config: &AppConfig) -> Self {
        let language_cookie = config.language.as_ref().map(|l| l.cookie_name.clone());
        let mut reserved_names = vec![config.session_cookie.clone()];
        reserved_names.extend(language_cookie.iter().cloned());

        InboundPolicy {
            security: config.security_headers,
            cookie_rules: CookieRules {
                domain: config.proxy_domain.clone(),
                same_site: config.cookie_same_site,
                reserved_names,
            },
            domain: config.proxy_domain.clone(),
            language_cookie,
        }
    }

    /// Client-facing header set for an upstream response. Returns a fresh map.
    pub fn rewrite_headers(&self, upstream: &HeaderMap, ctx: &ResponseContext<'_>) -> HeaderMap {
        let mut out = upstream.clone();

        // Non-ASCII bytes are legal in header values; decode lossily so they still get rewritten
        let location = out
            .get(header::LOCATION)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned());
        if let Some(location) = location {
            let rewritten = rewrite_location(&location, ctx.target_url, ctx.route);
            if rewritten != location {
                log::debug!("location {} -> {}", location, rewritten);
                match HeaderValue::from_str(&rewritten) {
                    Ok(v) => {
                        out.insert(header::LOCATION, v);
                    }
                    Err(_) => log::warn!("unrepresentable rewritten location {:?}", rewritten),
                }
            }
        }

        self.apply_security_policy(&mut out);
        self.rewrite_cookies(&mut out);

        if let (Some(name), Some(lang)) = (&self.language_cookie, ctx.language) {
            let aux = Cookie::build((name.clone(), lang.to_string()))
                .path("/")
                .domain(self.domain.clone())
                .max_age(cookie::time::Duration::seconds(LANGUAGE_COOKIE_MAX_AGE))
                .secure(true)
                .same_site(SameSite::None)
                .build();
            if let Ok(v) = HeaderValue::from_str(&aux.to_string()) {
                out.append(header::SET_COOKIE, v);
            }
        }

        merge_vary_cookie(&mut out);
        out
    }

    fn apply_security_policy(&self, headers: &mut HeaderMap) {
        match self.security {
            SecurityHeaderPolicy::Strip => {
                for name in STRIPPED_SECURITY_HEADERS {
                    headers.remove(*name);
                }
            }
            SecurityHeaderPolicy::Harden => {
                headers.insert(
                    header::X_CONTENT_TYPE_OPTIONS,
                    HeaderValue::from_static("nosniff"),
                );
                headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
                headers.insert(
                    header::REFERRER_POLICY,
                    HeaderValue::from_static("no-referrer"),
                );
            }
        }
    }

    fn rewrite_cookies(&self, headers: &mut HeaderMap) {
        if !headers.contains_key(header::SET_COOKIE) {
            return;
        }
        let raw: Vec<String> = headers
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect();

        headers.remove(header::SET_COOKIE);
        for line in raw {
            if let Some(rewritten) = cookies::rewrite_set_cookie(&line, &self.cookie_rules) {
                if let Ok(v) = HeaderValue::from_str(&rewritten) {
                    headers.append(header::SET_COOKIE, v);
                }
            }
        }
    }
}

/// Resolve `location` against the request target and, when it points back
/// at the route's base domain, reduce it to path + query + fragment so the
/// client stays on the proxy. Paths under the route's origin path are mapped
/// back under the route prefix. Everything else is returned unchanged.
pub fn rewrite_location(location: &str, target_url: &str, route: &Route) -> String {
    let resolved = match Url::parse(target_url).and_then(|base| base.join(location)) {
        Ok(url) => url,
        // Unparseable: path-relative values pass through, and so does anything else
        Err(_) => return location.to_string(),
    };

    let same_site = resolved
        .host_str()
        .map(|h| route.matches_base_domain(h.trim_start_matches('[').trim_end_matches(']')))
        .unwrap_or(false);
    if !same_site {
        return location.to_string();
    }

    let mut out = match below_base_path(resolved.path(), &route.base_path) {
        Some("") => route.prefix.clone(),
        Some(rest) => format!("{}{}", route.prefix.trim_end_matches('/'), rest),
        None => resolved.path().to_string(),
    };
    if let Some(q) = resolved.query() {
        out.push('?');
        out.push_str(q);
    }
    if let Some(f) = resolved.fragment() {
        out.push('#');
        out.push_str(f);
    }
    out
}

/// Part of `path` below `base`, segment aligned. `None` for an empty base.
fn below_base_path<'a>(path: &'a str, base: &str) -> Option<&'a str> {
    if base.is_empty() {
        return None;
    }
    let rest = path.strip_prefix(base)?;
    (rest.is_empty() || rest.starts_with('/')).then_some(rest)
}

/// Make sure `Vary` lists `Cookie`, keeping existing tokens and collapsing them into one header.
pub fn merge_vary_cookie(headers: &mut HeaderMap) {
    let mut tokens: Vec<String> = headers
        .get_all(header::VARY)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();

    if tokens.iter().any(|t| t == "*") {
        return;
    }
    if !tokens.iter().any(|t| t.eq_ignore_ascii_case("cookie")) {
        tokens.push("Cookie".to_string());
    }

    if let Ok(v) = HeaderValue::from_str(&tokens.join(", ")) {
        headers.insert(header::VARY, v);
    }
}

/// Replace the headers of a Pingora response with `headers`.
pub fn apply(resp: &mut ResponseHeader, headers: HeaderMap) -> pingora_core::Result<()> {
    let existing: Vec<HeaderName> = resp.headers.keys().cloned().collect();
    for name in existing {
        resp.remove_header(&name);
    }
    for (name, value) in headers.iter() {
        resp.append_header(name.clone(), value.clone())?;
    }
    Ok(())
}
