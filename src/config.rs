use crate::error::ConfigError;
use cookie::SameSite;
use std::time::Duration;

/// Response security header profile for proxied content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityHeaderPolicy {
    /// Drop upstream CSP/framing/HSTS headers, they describe the upstream origin
    Strip,
    /// Add nosniff / frame-deny / referrer-policy on every proxied response
    Harden,
}

/// How the outbound header set is seeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderMode {
    /// Copy every inbound header, then filter
    Passthrough,
    /// Start empty and copy only a fixed allow-list
    AllowList,
}

/// Accept-Language override driven by a client cookie.
#[derive(Debug, Clone)]
pub struct LanguageConfig {
    pub cookie_name: String,
    pub default_language: String,
}

/// Process-wide configuration. Built once at startup, read-only afterwards.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub proxy_domain: String,
    /// Shared secret. `None` disables authentication entirely.
    pub password: Option<String>,
    pub listen_addr: String,
    pub listen_port: u16,
    pub session_cookie: String,
    pub session_max_age: Duration,
    pub login_path: String,
    pub security_headers: SecurityHeaderPolicy,
    pub header_mode: HeaderMode,
    pub forward_cookies: bool,
    pub cookie_same_site: SameSite,
    pub language: Option<LanguageConfig>,
    pub static_dir: String,
    pub static_cache_secs: u64,
    pub upstream_timeout: Duration,
}

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_SESSION_MAX_AGE: &str = "30d";
const DEFAULT_STATIC_CACHE: &str = "1h";
const DEFAULT_UPSTREAM_TIMEOUT: &str = "60s";

impl AppConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    /// Empty values are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let proxy_domain = get("PROXY_DOMAIN")
            .ok_or(ConfigError::Missing("PROXY_DOMAIN"))?
            .to_ascii_lowercase();
        if proxy_domain.contains(&['/', ' ', ';'][..]) {
            return Err(ConfigError::invalid(
                "PROXY_DOMAIN",
                &proxy_domain,
                "expected a bare domain name",
            ));
        }

        let password = lookup("PROXY_PASSWORD").filter(|p| !p.is_empty());

        let listen_port = match get("PROXY_PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| ConfigError::invalid("PROXY_PORT", &raw, "not a port number"))?,
            None => DEFAULT_PORT,
        };

        let session_max_age = duration_var(
            "PROXY_SESSION_MAX_AGE",
            get("PROXY_SESSION_MAX_AGE"),
            DEFAULT_SESSION_MAX_AGE,
        )?;
        if session_max_age.is_zero() {
            return Err(ConfigError::invalid(
                "PROXY_SESSION_MAX_AGE",
                "0",
                "session lifetime must be positive",
            ));
        }

        let login_path = get("PROXY_LOGIN_PATH").unwrap_or_else(|| "/auth-login".to_string());
        if !login_path.starts_with('/') {
            return Err(ConfigError::invalid(
                "PROXY_LOGIN_PATH",
                &login_path,
                "must start with '/'",
            ));
        }

        let security_headers = match get("PROXY_SECURITY_HEADERS").as_deref() {
            None | Some("strip") => SecurityHeaderPolicy::Strip,
            Some("harden") => SecurityHeaderPolicy::Harden,
            Some(other) => {
                return Err(ConfigError::invalid(
                    "PROXY_SECURITY_HEADERS",
                    other,
                    "expected 'strip' or 'harden'",
                ))
            }
        };

        let header_mode = match get("PROXY_HEADER_MODE").as_deref() {
            None | Some("passthrough") => HeaderMode::Passthrough,
            Some("allowlist") => HeaderMode::AllowList,
            Some(other) => {
                return Err(ConfigError::invalid(
                    "PROXY_HEADER_MODE",
                    other,
                    "expected 'passthrough' or 'allowlist'",
                ))
            }
        };

        let forward_cookies = match get("PROXY_FORWARD_COOKIES") {
            Some(raw) => parse_bool(&raw)
                .ok_or_else(|| ConfigError::invalid("PROXY_FORWARD_COOKIES", &raw, "not a boolean"))?,
            None => true,
        };

        let cookie_same_site = match get("PROXY_COOKIE_SAMESITE") {
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "strict" => SameSite::Strict,
                "lax" => SameSite::Lax,
                "none" => SameSite::None,
                _ => {
                    return Err(ConfigError::invalid(
                        "PROXY_COOKIE_SAMESITE",
                        &raw,
                        "expected Strict, Lax or None",
                    ))
                }
            },
            None => SameSite::None,
        };

        let language = get("PROXY_LANGUAGE_COOKIE").map(|cookie_name| LanguageConfig {
            cookie_name,
            default_language: get("PROXY_DEFAULT_LANGUAGE").unwrap_or_else(|| "en-US".to_string()),
        });

        let static_cache_secs = duration_var(
            "PROXY_STATIC_CACHE",
            get("PROXY_STATIC_CACHE"),
            DEFAULT_STATIC_CACHE,
        )?
        .as_secs();

        let upstream_timeout = duration_var(
            "PROXY_UPSTREAM_TIMEOUT",
            get("PROXY_UPSTREAM_TIMEOUT"),
            DEFAULT_UPSTREAM_TIMEOUT,
        )?;

        Ok(AppConfig {
            proxy_domain,
            password,
            listen_addr: get("PROXY_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0".to_string()),
            listen_port,
            session_cookie: get("PROXY_SESSION_COOKIE")
                .unwrap_or_else(|| "proxy_session".to_string()),
            session_max_age,
            login_path,
            security_headers,
            header_mode,
            forward_cookies,
            cookie_same_site,
            language,
            static_dir: get("PROXY_STATIC_DIR").unwrap_or_else(|| "./public".to_string()),
            static_cache_secs,
            upstream_timeout,
        })
    }
}

fn duration_var(
    var: &'static str,
    raw: Option<String>,
    default: &str,
) -> Result<Duration, ConfigError> {
    let raw = raw.unwrap_or_else(|| default.to_string());
    parse_duration_secs(&raw)
        .map(Duration::from_secs)
        .ok_or_else(|| ConfigError::invalid(var, &raw, "expected seconds or a d/h/m/s suffix"))
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a duration string like "30d", "1h", "3600" into seconds.
/// Returns `None` for anything malformed or overflowing.
pub fn parse_duration_secs(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(secs) = s.parse::<u64>() {
        return Some(secs);
    }

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix('d') {
        (n, 86400u64)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3600u64)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60u64)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1u64)
    } else {
        return None;
    };

    num_str.trim().parse::<u64>().ok()?.checked_mul(multiplier)
}
