//! Cookie handling for both directions of the proxy.
//!
//! `Set-Cookie` lines coming back from an upstream are parsed into a
//! [`SetCookie`] (name, value and an ordered attribute list), rewritten so the
//! browser scopes them to the proxy's domain, and serialized again. Request
//! `Cookie` headers only need lookups and filtering of the proxy's own cookies,
//! both done through [`Cookie::split_parse`].

use cookie::{Cookie, SameSite};
use http::header::COOKIE;
use http::HeaderMap;

/// One parsed `Set-Cookie` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCookie {
    pub name: String,
    pub value: String,
    /// Attributes in their original order. Keys keep their original case.
    pub attributes: Vec<(String, Option<String>)>,
}

impl SetCookie {
    /// Parse a raw `Set-Cookie` value. Returns `None` when there is no
    /// `name=value` pair or the name is empty.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split(';');
        let pair = parts.next()?.trim();
        let (name, value) = pair.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let attributes = parts
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| match p.split_once('=') {
                Some((k, v)) => (k.trim().to_string(), Some(v.trim().to_string())),
                None => (p.to_string(), None),
            })
            .collect();

        Some(SetCookie {
            name: name.to_string(),
            value: value.trim().to_string(),
            attributes,
        })
    }

    pub fn attribute(&self, key: &str) -> Option<Option<&str>> {
        self.attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_deref())
    }

    pub fn has_attribute(&self, key: &str) -> bool {
        self.attribute(key).is_some()
    }

    /// Set `key` to `value`, replacing the first existing occurrence in place
    /// and dropping any later ones. Appends when the attribute is absent.
    pub fn set_attribute(&mut self, key: &str, value: Option<String>) {
        let mut replaced = false;
        self.attributes.retain_mut(|(k, v)| {
            if !k.eq_ignore_ascii_case(key) {
                return true;
            }
            if replaced {
                return false;
            }
            *k = key.to_string();
            *v = value.clone();
            replaced = true;
            true
        });
        if !replaced {
            self.attributes.push((key.to_string(), value));
        }
    }

    /// Keep only the first occurrence of each attribute key (case-insensitive).
    pub fn dedup_attributes(&mut self) {
        let mut seen: Vec<String> = Vec::with_capacity(self.attributes.len());
        self.attributes.retain(|(k, _)| {
            let lower = k.to_ascii_lowercase();
            if seen.contains(&lower) {
                false
            } else {
                seen.push(lower);
                true
            }
        });
    }

    pub fn to_header_value(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        for (k, v) in &self.attributes {
            out.push_str("; ");
            out.push_str(k);
            if let Some(v) = v {
                out.push('=');
                out.push_str(v);
            }
        }
        out
    }
}

/// Rules applied to every upstream `Set-Cookie` before it reaches the client.
#[derive(Debug, Clone)]
pub struct CookieRules {
    /// Domain every forwarded cookie is scoped to
    pub domain: String,
    pub same_site: SameSite,
    /// Cookie names owned by the proxy; upstream cookies with these names are dropped
    pub reserved_names: Vec<String>,
}

/// Rewrite one upstream `Set-Cookie` line for the client.
/// Returns `None` when the cookie must not be forwarded.
pub fn rewrite_set_cookie(raw: &str, rules: &CookieRules) -> Option<String> {
    let mut cookie = SetCookie::parse(raw)?;
    if rules.reserved_names.iter().any(|n| *n == cookie.name) {
        log::debug!("dropping upstream cookie {} (reserved name)", cookie.name);
        return None;
    }

    cookie.dedup_attributes();
    cookie.set_attribute("Domain", Some(rules.domain.clone()));
    if !cookie.has_attribute("Secure") {
        cookie.set_attribute("Secure", None);
    }
    cookie.set_attribute("SameSite", Some(rules.same_site.to_string()));

    Some(cookie.to_header_value())
}

/// Values of every cookie named `name` across all `Cookie` headers, in header order.
/// Pairs that do not parse are skipped.
pub fn cookie_values(headers: &HeaderMap, name: &str) -> Vec<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| Cookie::split_parse(v))
        .filter_map(Result::ok)
        .filter(|c| c.name() == name)
        .map(|c| c.value().to_string())
        .collect()
}

/// Value of the first cookie named `name`.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    cookie_values(headers, name).into_iter().next()
}

/// Remove the named cookies from a request `Cookie` header value.
/// Returns `None` when nothing is left.
pub fn strip_cookies(header: &str, names: &[&str]) -> Option<String> {
    let kept: Vec<String> = Cookie::split_parse(header)
        .filter_map(Result::ok)
        .filter(|c| !names.iter().any(|n| *n == c.name()))
        .map(|c| format!("{}={}", c.name(), c.value()))
        .collect();

    if kept.is_empty() {
        None
    } else {
        Some(kept.join("; "))
    }
}
