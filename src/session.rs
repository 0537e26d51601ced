use crate::config::AppConfig;
use base64::Engine;
use cookie::{Cookie, SameSite};
use http::HeaderMap;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Tokens dated further than this into the future are rejected
const CLOCK_SKEW_SECS: u64 = 60;

/// Upper bound on a login form body
pub const MAX_LOGIN_BODY: usize = 16 * 1024;

/// Result of checking a request against the session gate
#[derive(Debug, PartialEq, Eq)]
pub enum AuthState {
    /// Authentication is disabled or the session cookie is valid
    Authenticated,
    /// The request must log in first
    Unauthenticated,
}

/// Result of processing a login submission
#[derive(Debug, PartialEq, Eq)]
pub enum LoginOutcome {
    /// Redirect to `location`; `set_cookie` carries the new session when auth is enabled
    Success {
        location: String,
        set_cookie: Option<String>,
    },
    /// Wrong or missing password; re-render the form
    Failure { redirect_to: String },
}

/// Fields of a submitted login form
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LoginForm {
    pub password: Option<String>,
    pub redirect_to: Option<String>,
}

impl LoginForm {
    /// Parse an `application/x-www-form-urlencoded` body. First occurrence of a field wins.
    pub fn parse(body: &[u8]) -> Self {
        let mut form = LoginForm::default();
        for (key, value) in url::form_urlencoded::parse(body) {
            match &*key {
                "password" if form.password.is_none() => form.password = Some(value.into_owned()),
                "redirect_to" if form.redirect_to.is_none() => {
                    form.redirect_to = Some(value.into_owned())
                }
                _ => {}
            }
        }
        form
    }
}

/// Gate that issues and validates session tokens derived from the shared secret.
///
/// Tokens have the form `{issued_unix}.{base64url(sha256("{issued_unix}:{secret}"))}`.
/// They cannot be produced without the secret and expire server-side once
/// older than the configured max-age, independent of the cookie's own Max-Age.
pub struct SessionAuthenticator {
    secret: Option<String>,
    cookie_name: String,
    domain: String,
    max_age: Duration,
}

impl SessionAuthenticator {
    pub fn new(config: &AppConfig) -> Self {
        SessionAuthenticator {
            secret: config.password.clone(),
            cookie_name: config.session_cookie.clone(),
            domain: config.proxy_domain.clone(),
            max_age: config.session_max_age,
        }
    }

    pub fn enabled(&self) -> bool {
        self.secret.is_some()
    }

    /// Check the session cookie carried by a request. Browsers may send several
    /// cookies with the session name; any one valid token is enough.
    pub fn check(&self, headers: &HeaderMap, now: u64) -> AuthState {
        if !self.enabled() {
            return AuthState::Authenticated;
        }
        let tokens = crate::cookies::cookie_values(headers, &self.cookie_name);
        if tokens.iter().any(|t| self.validate_token(t, now)) {
            AuthState::Authenticated
        } else {
            AuthState::Unauthenticated
        }
    }

    /// Process a submitted login form.
    pub fn login(&self, form: &LoginForm, now: u64) -> LoginOutcome {
        let redirect_to = sanitize_redirect(form.redirect_to.as_deref());

        let secret = match &self.secret {
            Some(s) => s,
            None => {
                return LoginOutcome::Success {
                    location: redirect_to,
                    set_cookie: None,
                }
            }
        };

        // A missing field counts as a wrong password
        let ok = form
            .password
            .as_deref()
            .map(|p| password_matches(p, secret))
            .unwrap_or(false);

        if ok {
            LoginOutcome::Success {
                location: redirect_to,
                set_cookie: Some(self.session_cookie(&self.issue_token(now))),
            }
        } else {
            LoginOutcome::Failure { redirect_to }
        }
    }

    /// Mint a token dated `now`. Empty when auth is disabled.
    pub fn issue_token(&self, now: u64) -> String {
        match &self.secret {
            Some(secret) => format!("{}.{}", now, token_digest(now, secret)),
            None => String::new(),
        }
    }

    pub fn validate_token(&self, token: &str, now: u64) -> bool {
        let secret = match &self.secret {
            Some(s) => s,
            None => return true,
        };

        let (issued, digest) = match token.split_once('.') {
            Some(parts) => parts,
            None => return false,
        };
        let issued: u64 = match issued.parse() {
            Ok(t) => t,
            Err(_) => return false,
        };

        if issued > now.saturating_add(CLOCK_SKEW_SECS) {
            return false;
        }
        if now.saturating_sub(issued) > self.max_age.as_secs() {
            return false;
        }

        constant_time_eq(digest.as_bytes(), token_digest(issued, secret).as_bytes())
    }

    /// `Set-Cookie` value carrying a session token.
    pub fn session_cookie(&self, token: &str) -> String {
        let max_age = i64::try_from(self.max_age.as_secs()).unwrap_or(i64::MAX);
        Cookie::build((self.cookie_name.clone(), token.to_string()))
            .path("/")
            .domain(self.domain.clone())
            .max_age(cookie::time::Duration::seconds(max_age))
            .http_only(true)
            .secure(true)
            .same_site(SameSite::Lax)
            .build()
            .to_string()
    }
}

fn token_digest(issued: u64, secret: &str) -> String {
    let digest = Sha256::digest(format!("{}:{}", issued, secret).as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
}

/// Compare passwords through their digests so timing does not depend on length or content.
fn password_matches(submitted: &str, secret: &str) -> bool {
    let a = Sha256::digest(submitted.as_bytes());
    let b = Sha256::digest(secret.as_bytes());
    constant_time_eq(&a, &b)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Only local absolute paths are accepted as post-login targets. The value
/// ends up in a `Location` header, so control characters are refused too.
pub fn sanitize_redirect(target: Option<&str>) -> String {
    match target {
        Some(t)
            if t.starts_with('/')
                && !t.starts_with("//")
                && !t.contains('\\')
                && !t.chars().any(|c| c.is_ascii_control()) =>
        {
            t.to_string()
        }
        _ => "/".to_string(),
    }
}
