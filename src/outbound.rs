use crate::config::{AppConfig, HeaderMode, LanguageConfig};
use crate::cookies;
use crate::router::Route;
use http::header::{self, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use pingora_http::RequestHeader;

/// Headers copied in allow-list mode. `cookie` is added separately when enabled.
static ALLOWED_HEADERS: [HeaderName; 7] = [
    header::ACCEPT,
    header::ACCEPT_ENCODING,
    header::CONTENT_TYPE,
    header::AUTHORIZATION,
    header::USER_AGENT,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
];

/// Headers that would reveal the proxy hop or the client's address
const PROXY_CHAIN_HEADERS: &[&str] = &["via", "forwarded", "x-real-ip"];

/// Builds the header set sent to an upstream.
pub struct OutboundPolicy {
    mode: HeaderMode,
    forward_cookies: bool,
    /// Proxy-owned cookies removed from the forwarded `Cookie` header
    own_cookies: Vec<String>,
    language: Option<LanguageConfig>,
}

impl OutboundPolicy {
    pub fn new(config: &AppConfig) -> Self {
        let mut own_cookies = vec![config.session_cookie.clone()];
        if let Some(lang) = &config.language {
            own_cookies.push(lang.cookie_name.clone());
        }
        OutboundPolicy {
            mode: config.header_mode,
            forward_cookies: config.forward_cookies,
            own_cookies,
            language: config.language.clone(),
        }
    }

    /// Language for this request: the client's cookie when it holds a
    /// well-formed tag, else the default. `None` when the override is off.
    pub fn resolve_language(&self, inbound: &HeaderMap) -> Option<String> {
        let lang = self.language.as_ref()?;
        let chosen = cookies::cookie_value(inbound, &lang.cookie_name)
            .filter(|v| is_language_tag(v))
            .unwrap_or_else(|| lang.default_language.clone());
        Some(chosen)
    }

    /// Header set for the upstream leg. Always a fresh map; `inbound` is not touched.
    pub fn upstream_headers(
        &self,
        inbound: &HeaderMap,
        route: &Route,
        language: Option<&str>,
    ) -> HeaderMap {
        let mut out = match self.mode {
            HeaderMode::Passthrough => inbound.clone(),
            HeaderMode::AllowList => {
                let mut out = HeaderMap::new();
                let cookie = self.forward_cookies.then_some(header::COOKIE);
                for name in ALLOWED_HEADERS.iter().chain(cookie.iter()) {
                    for value in inbound.get_all(name) {
                        out.append(name.clone(), value.clone());
                    }
                }
                out
            }
        };

        for name in PROXY_CHAIN_HEADERS {
            out.remove(*name);
        }
        let forwarded: Vec<HeaderName> = out
            .keys()
            .filter(|k| k.as_str().starts_with("x-forwarded-"))
            .cloned()
            .collect();
        for name in forwarded {
            out.remove(name);
        }

        self.strip_own_cookies(&mut out);

        let authority = route.authority();
        if let Ok(host) = HeaderValue::from_str(&authority) {
            out.insert(header::HOST, host);
        }

        if route.origin_check {
            if let Ok(origin) = HeaderValue::from_str(&format!("https://{}", authority)) {
                out.insert(header::ORIGIN, origin);
            }
            if let Ok(referer) = HeaderValue::from_str(&format!("https://{}/", authority)) {
                out.insert(header::REFERER, referer);
            }
        }

        if let Some(lang) = language.and_then(|l| HeaderValue::from_str(l).ok()) {
            out.insert(header::ACCEPT_LANGUAGE, lang);
        }

        out
    }

    fn strip_own_cookies(&self, headers: &mut HeaderMap) {
        if !headers.contains_key(header::COOKIE) {
            return;
        }
        let names: Vec<&str> = self.own_cookies.iter().map(String::as_str).collect();
        let joined = headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join("; ");

        headers.remove(header::COOKIE);
        if let Some(kept) = cookies::strip_cookies(&joined, &names) {
            if let Ok(v) = HeaderValue::from_str(&kept) {
                headers.insert(header::COOKIE, v);
            }
        }
    }
}

/// Loose BCP 47 shape check: alphabetic primary subtag, alphanumeric subtags of 1-8 chars.
fn is_language_tag(tag: &str) -> bool {
    if tag.is_empty() || tag.len() > 35 {
        return false;
    }
    let mut parts = tag.split('-');
    let primary_ok = parts
        .next()
        .map(|p| (1..=8).contains(&p.len()) && p.bytes().all(|b| b.is_ascii_alphabetic()))
        .unwrap_or(false);
    primary_ok && parts.all(|p| (1..=8).contains(&p.len()) && p.bytes().all(|b| b.is_ascii_alphanumeric()))
}

/// Fresh request head for the upstream leg.
pub fn build_upstream_request(
    method: &Method,
    path: &str,
    headers: &HeaderMap,
) -> pingora_core::Result<RequestHeader> {
    let mut req = RequestHeader::build(method.clone(), path.as_bytes(), Some(headers.len()))?;
    for (name, value) in headers {
        req.append_header(name.clone(), value.clone())?;
    }
    Ok(req)
}
