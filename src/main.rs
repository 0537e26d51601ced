mod config;
mod cookies;
mod error;
mod inbound;
mod outbound;
mod pages;
mod router;
mod session;
mod static_files;
mod upstream;

use async_trait::async_trait;
use config::AppConfig;
use error::{ConfigError, ProxyFailure};
use http::{HeaderMap, Method};
use inbound::{InboundPolicy, ResponseContext};
use outbound::OutboundPolicy;
use pages::PageResponse;
use pingora_core::prelude::*;
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_proxy::{http_proxy_service, ProxyHttp, Session};
use router::{Route, Router};
use session::{
    sanitize_redirect, AuthState, LoginForm, LoginOutcome, SessionAuthenticator, MAX_LOGIN_BODY,
};
use static_files::StaticOutcome;
use std::sync::Arc;

/// Process-wide state. Built once at startup, read-only afterwards.
struct SharedState {
    config: AppConfig,
    router: Router,
    auth: SessionAuthenticator,
    outbound: OutboundPolicy,
    inbound: InboundPolicy,
}

impl SharedState {
    fn build(config: AppConfig) -> Result<Self, ConfigError> {
        let router = Router::builtin()?;
        Ok(Self::with_router(config, router))
    }

    fn with_router(config: AppConfig, router: Router) -> Self {
        SharedState {
            auth: SessionAuthenticator::new(&config),
            outbound: OutboundPolicy::new(&config),
            inbound: InboundPolicy::new(&config),
            router,
            config,
        }
    }
}

/// Locally served endpoints, checked in order before the route table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Status,
    Robots,
    PublicAsset,
    Login,
    Dashboard,
}

struct EndpointRule {
    endpoint: Endpoint,
    /// Requires a valid session when authentication is enabled
    gated: bool,
    matches: fn(&Method, &str, &AppConfig) -> bool,
}

fn is_read(method: &Method) -> bool {
    method == Method::GET || method == Method::HEAD
}

fn match_status(method: &Method, path: &str, _: &AppConfig) -> bool {
    is_read(method) && path == "/status"
}

fn match_robots(method: &Method, path: &str, _: &AppConfig) -> bool {
    is_read(method) && path == "/robots.txt"
}

fn match_public(method: &Method, path: &str, _: &AppConfig) -> bool {
    is_read(method) && (path == "/public" || path.starts_with("/public/"))
}

fn match_login(method: &Method, path: &str, config: &AppConfig) -> bool {
    method == Method::POST && path == config.login_path
}

fn match_dashboard(method: &Method, path: &str, _: &AppConfig) -> bool {
    is_read(method) && (path == "/" || path == "/index.html")
}

const ENDPOINTS: &[EndpointRule] = &[
    EndpointRule {
        endpoint: Endpoint::Status,
        gated: false,
        matches: match_status,
    },
    EndpointRule {
        endpoint: Endpoint::Robots,
        gated: false,
        matches: match_robots,
    },
    EndpointRule {
        endpoint: Endpoint::PublicAsset,
        gated: false,
        matches: match_public,
    },
    EndpointRule {
        endpoint: Endpoint::Login,
        gated: false,
        matches: match_login,
    },
    EndpointRule {
        endpoint: Endpoint::Dashboard,
        gated: true,
        matches: match_dashboard,
    },
];

/// Outcome of the synchronous request routing phase (no borrows held after this)
#[derive(Debug)]
enum RequestAction {
    Status,
    Robots,
    /// Serve a file below the static root
    ServeStatic { relative: String },
    /// Process a login form submission
    Login,
    Dashboard,
    /// Unauthenticated: render the login form (401)
    LoginRequired { redirect_to: String },
    /// Authenticated request to the login path itself
    Redirect { location: String },
    /// Forward to the route's upstream
    Proxy {
        route: Arc<Route>,
        upstream_path: String,
    },
    NotFound,
}

/// Per-request context passed through the ProxyHttp callbacks
pub struct ProxyCtx {
    route: Option<Arc<Route>>,
    /// Origin-form target sent upstream (base path + remainder + query)
    upstream_path: String,
    /// Absolute upstream URL, for redirect resolution and logs
    target_url: String,
    language: Option<String>,
    failure: Option<ProxyFailure>,
}

impl ProxyCtx {
    fn new() -> Self {
        ProxyCtx {
            route: None,
            upstream_path: String::new(),
            target_url: String::new(),
            language: None,
            failure: None,
        }
    }
}

/// The main proxy application.
pub struct ProxyApp {
    state: Arc<SharedState>,
}

impl ProxyApp {
    fn new(state: Arc<SharedState>) -> Self {
        ProxyApp { state }
    }

    /// Determine the action for this request.
    fn resolve_request(
        &self,
        method: &Method,
        path: &str,
        query: Option<&str>,
        headers: &HeaderMap,
        now: u64,
    ) -> RequestAction {
        let state = &self.state;
        let authenticated = state.auth.check(headers, now) == AuthState::Authenticated;
        let login_required = || RequestAction::LoginRequired {
            redirect_to: match query {
                Some(q) => format!("{}?{}", path, q),
                None => path.to_string(),
            },
        };

        if let Some(rule) = ENDPOINTS
            .iter()
            .find(|r| (r.matches)(method, path, &state.config))
        {
            if rule.gated && !authenticated {
                return login_required();
            }
            return match rule.endpoint {
                Endpoint::Status => RequestAction::Status,
                Endpoint::Robots => RequestAction::Robots,
                Endpoint::PublicAsset => RequestAction::ServeStatic {
                    relative: path.strip_prefix("/public").unwrap_or("").to_string(),
                },
                Endpoint::Login => RequestAction::Login,
                Endpoint::Dashboard => RequestAction::Dashboard,
            };
        }

        if !authenticated {
            return login_required();
        }

        if path == state.config.login_path {
            return RequestAction::Redirect {
                location: "/".to_string(),
            };
        }

        match state.router.resolve(path) {
            Some((route, rest)) => RequestAction::Proxy {
                upstream_path: route.upstream_path(rest, query),
                route: Arc::clone(route),
            },
            None => RequestAction::NotFound,
        }
    }

    /// Response to a submitted login form body.
    fn login_response(&self, body: &[u8], now: u64) -> Result<PageResponse> {
        let state = &self.state;
        let form = LoginForm::parse(body);
        match state.auth.login(&form, now) {
            LoginOutcome::Success {
                location,
                set_cookie,
            } => {
                if set_cookie.is_some() {
                    log::info!("login succeeded, redirecting to {}", location);
                }
                pages::redirect(&location, set_cookie.as_deref())
            }
            LoginOutcome::Failure { redirect_to } => {
                pages::login_page(&state.config.login_path, &redirect_to, true)
            }
        }
    }
}

fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

async fn write_page(session: &mut Session, page: PageResponse) -> Result<bool> {
    let eos = page.body.is_empty();
    session
        .write_response_header(Box::new(page.header), eos)
        .await?;
    if !eos {
        session.write_response_body(Some(page.body), true).await?;
    }
    Ok(true)
}

/// Read a login form body, `None` when it exceeds the limit.
async fn read_login_body(session: &mut Session) -> Result<Option<Vec<u8>>> {
    let mut body = Vec::new();
    while let Some(chunk) = session.read_request_body().await? {
        if body.len() + chunk.len() > MAX_LOGIN_BODY {
            return Ok(None);
        }
        body.extend_from_slice(&chunk);
    }
    Ok(Some(body))
}

#[async_trait]
impl ProxyHttp for ProxyApp {
    type CTX = ProxyCtx;

    fn new_ctx(&self) -> Self::CTX {
        ProxyCtx::new()
    }

    /// Session gate and local endpoints; only routed requests continue upstream
    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        let now = unix_now();
        let req = session.req_header();
        let method = req.method.clone();
        let path = req.uri.path().to_string();
        let query = req.uri.query().map(|q| q.to_string());

        let action = self.resolve_request(&method, &path, query.as_deref(), &req.headers, now);

        match action {
            RequestAction::Status => write_page(session, pages::status_page()?).await,

            RequestAction::Robots => write_page(session, pages::robots_txt()?).await,

            RequestAction::ServeStatic { relative } => {
                let ims = session
                    .req_header()
                    .headers
                    .get(http::header::IF_MODIFIED_SINCE)
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string());
                let config = &self.state.config;
                let page = match static_files::serve_static_file(
                    &config.static_dir,
                    &relative,
                    config.static_cache_secs,
                    ims.as_deref(),
                )? {
                    StaticOutcome::Found(page) => page,
                    StaticOutcome::NotFound => pages::error_page(404)?,
                    StaticOutcome::Forbidden => pages::error_page(403)?,
                };
                write_page(session, page).await
            }

            RequestAction::Login => {
                let page = match read_login_body(session).await? {
                    Some(body) => {
                        let page = self.login_response(&body, now)?;
                        if page.header.status == 401 {
                            log::warn!(
                                "failed login attempt from {}",
                                session
                                    .downstream_session
                                    .client_addr()
                                    .map(|a| a.to_string())
                                    .unwrap_or_else(|| "-".to_string())
                            );
                        }
                        page
                    }
                    None => pages::error_page(413)?,
                };
                write_page(session, page).await
            }

            RequestAction::Dashboard => {
                let state = &self.state;
                write_page(
                    session,
                    pages::dashboard_page(&state.router, &state.config.proxy_domain)?,
                )
                .await
            }

            RequestAction::LoginRequired { redirect_to } => {
                let redirect_to = sanitize_redirect(Some(&redirect_to));
                let page = pages::login_page(&self.state.config.login_path, &redirect_to, false)?;
                write_page(session, page).await
            }

            RequestAction::Redirect { location } => {
                write_page(session, pages::redirect(&location, None)?).await
            }

            RequestAction::Proxy {
                route,
                upstream_path,
            } => {
                ctx.language = self
                    .state
                    .outbound
                    .resolve_language(&session.req_header().headers);
                ctx.target_url = route.target_url(&upstream_path);
                ctx.upstream_path = upstream_path;
                ctx.route = Some(route);
                Ok(false)
            }

            RequestAction::NotFound => {
                log::debug!("no route for {}", path);
                write_page(session, pages::error_page(404)?).await
            }
        }
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let route = ctx.route.as_ref().ok_or_else(|| {
            pingora_core::Error::explain(
                pingora_core::ErrorType::InternalError,
                "no route resolved for upstream request",
            )
        })?;
        upstream::peer_for(route, self.state.config.upstream_timeout).await
    }

    /// Replace the outbound request head: new target path, transformed headers
    async fn upstream_request_filter(
        &self,
        session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let route = match ctx.route.as_ref() {
            Some(r) => r,
            None => return Ok(()),
        };
        let headers = self.state.outbound.upstream_headers(
            &session.req_header().headers,
            route,
            ctx.language.as_deref(),
        );
        *upstream_request = outbound::build_upstream_request(
            &session.req_header().method,
            &ctx.upstream_path,
            &headers,
        )?;
        Ok(())
    }

    /// Rewrite redirects, cookies and security headers for the client
    async fn response_filter(
        &self,
        _session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let route = match ctx.route.as_ref() {
            Some(r) => r,
            None => return Ok(()),
        };
        let rctx = ResponseContext {
            route,
            target_url: &ctx.target_url,
            language: ctx.language.as_deref(),
        };
        let headers = self
            .state
            .inbound
            .rewrite_headers(&upstream_response.headers, &rctx);
        inbound::apply(upstream_response, headers)
    }

    async fn fail_to_proxy(
        &self,
        session: &mut Session,
        e: &pingora_core::Error,
        ctx: &mut Self::CTX,
    ) -> pingora_proxy::FailToProxy {
        let failure = upstream::classify_failure(e.etype(), e.esource());
        ctx.failure = Some(failure);

        let target = if ctx.target_url.is_empty() {
            "-"
        } else {
            ctx.target_url.as_str()
        };
        match failure {
            ProxyFailure::UpstreamUnreachable => {
                log::error!("upstream unreachable: {}: {}", target, e)
            }
            ProxyFailure::Unexpected => log::error!("proxy failure for {}: {}", target, e),
            ProxyFailure::ClientGone => log::debug!("client went away ({}): {}", target, e),
            ProxyFailure::Status(code) => log::warn!("{} for {}: {}", code, target, e),
        }

        let code = failure.status_code();
        if let Some(code) = code {
            if session.response_written().is_none() {
                if let Ok(page) = pages::error_page(code) {
                    let _ = write_page(session, page).await;
                }
            }
        }

        pingora_proxy::FailToProxy {
            error_code: code.unwrap_or(0),
            can_reuse_downstream: false,
        }
    }

    /// One access line per request
    async fn logging(
        &self,
        session: &mut Session,
        e: Option<&pingora_core::Error>,
        ctx: &mut Self::CTX,
    ) {
        let status = session
            .response_written()
            .map(|r| r.status.as_u16())
            .unwrap_or(0);
        let method = session.req_header().method.as_str();
        let path = session.req_header().uri.path();
        let upstream = ctx
            .route
            .as_ref()
            .map(|r| r.host.as_str())
            .unwrap_or("-");

        match (e, ctx.failure) {
            (Some(err), Some(ProxyFailure::ClientGone)) => {
                log::info!("{} {} {} {} - client gone: {}", method, path, status, upstream, err)
            }
            (Some(err), _) => log::error!(
                "{} {} {} {} - error: {}",
                method,
                path,
                status,
                upstream,
                err
            ),
            (None, _) => log::info!("{} {} {} {}", method, path, status, upstream),
        }
    }
}

fn listen_address(config: &AppConfig) -> String {
    if config.listen_addr.contains(':') {
        format!("[{}]:{}", config.listen_addr, config.listen_port)
    } else {
        format!("{}:{}", config.listen_addr, config.listen_port)
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("prefix-gate-proxy starting...");

    let state = match AppConfig::from_env().and_then(SharedState::build) {
        Ok(s) => s,
        Err(e) => {
            log::error!("configuration error: {}", e);
            std::process::exit(1);
        }
    };

    if !state.auth.enabled() {
        log::warn!(
            "PROXY_PASSWORD is not set: authentication is disabled and every request is treated as authenticated"
        );
    }

    if state.router.is_empty() {
        log::warn!("route table is empty: every proxied path will return 404");
    }

    let listen = listen_address(&state.config);
    log::info!(
        "domain={} routes={} auth={} security_headers={:?} header_mode={:?}",
        state.config.proxy_domain,
        state.router.len(),
        if state.auth.enabled() { "on" } else { "off" },
        state.config.security_headers,
        state.config.header_mode,
    );

    let proxy_app = ProxyApp::new(Arc::new(state));

    let mut server_conf = pingora_core::server::configuration::ServerConf::default();
    server_conf.upstream_keepalive_pool_size = 128;
    let opt = pingora_core::server::configuration::Opt::default();
    let mut server = Server::new_with_opt_and_conf(opt, server_conf);
    server.bootstrap();

    let mut http_service = http_proxy_service(&server.configuration, proxy_app);
    http_service.add_tcp(&listen);
    server.add_service(http_service);

    log::info!("listening on {}", listen);
    server.run_forever();
}
