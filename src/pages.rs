use crate::router::Router;
use bytes::Bytes;
use pingora_http::ResponseHeader;

/// A locally generated response
pub struct PageResponse {
    pub header: ResponseHeader,
    pub body: Bytes,
}

const HTML: &str = "text/html; charset=utf-8";
const TEXT: &str = "text/plain; charset=utf-8";

fn page(status: u16, content_type: &str, body: String) -> pingora_core::Result<PageResponse> {
    let mut resp = ResponseHeader::build(status, Some(4))?;
    resp.insert_header(http::header::CONTENT_TYPE, content_type)?;
    resp.insert_header(http::header::CONTENT_LENGTH, body.len())?;
    resp.insert_header(http::header::CACHE_CONTROL, "no-store")?;
    Ok(PageResponse {
        header: resp,
        body: Bytes::from(body),
    })
}

/// `GET /status` liveness probe
pub fn status_page() -> pingora_core::Result<PageResponse> {
    page(200, TEXT, "OK".to_string())
}

pub fn robots_txt() -> pingora_core::Result<PageResponse> {
    page(200, "text/plain", "User-agent: *\nDisallow: /".to_string())
}

/// Minimal built-in error page. Never carries internal error detail.
pub fn error_page(status_code: u16) -> pingora_core::Result<PageResponse> {
    let reason = status_reason(status_code);
    let body = format!(
        "<!DOCTYPE html>\n<html><head><title>{} {}</title></head>\n<body>\n<center><h1>{} {}</h1></center>\n<hr><center>prefix-gate-proxy</center>\n</body></html>\n",
        status_code, reason, status_code, reason
    );
    page(status_code, HTML, body)
}

/// 401 login form. `redirect_to` is carried through a hidden field.
pub fn login_page(
    login_path: &str,
    redirect_to: &str,
    failed: bool,
) -> pingora_core::Result<PageResponse> {
    let error = if failed {
        "<p class=\"error\" role=\"alert\">Incorrect password. Please try again.</p>\n"
    } else {
        ""
    };
    let body = format!(
        r#"<!DOCTYPE html>
<html><head><meta charset="utf-8"><title>Sign in</title>
<meta name="robots" content="noindex">
<style>body{{font-family:sans-serif;max-width:22rem;margin:4rem auto}}.error{{color:#b00020}}input{{width:100%;margin:.4rem 0;padding:.4rem}}</style>
</head>
<body>
<h1>Sign in</h1>
{error}<form method="post" action="{action}">
<input type="password" name="password" placeholder="Password" autofocus required>
<input type="hidden" name="redirect_to" value="{redirect}">
<button type="submit">Continue</button>
</form>
</body></html>
"#,
        error = error,
        action = escape_html(login_path),
        redirect = escape_html(redirect_to),
    );
    page(401, HTML, body)
}

/// Route listing served at `/`.
pub fn dashboard_page(router: &Router, domain: &str) -> pingora_core::Result<PageResponse> {
    let mut rows = String::new();
    for route in router.routes_by_prefix() {
        let label = route.label.as_deref().unwrap_or(&route.host);
        rows.push_str(&format!(
            "<tr><td>{}</td><td><code>https://{}{}</code></td><td><code>{}</code></td></tr>\n",
            escape_html(label),
            escape_html(domain),
            escape_html(&route.prefix),
            escape_html(route.origin.as_str()),
        ));
    }

    let body = format!(
        r#"<!DOCTYPE html>
<html><head><meta charset="utf-8"><title>{domain}</title>
<meta name="robots" content="noindex">
<style>body{{font-family:sans-serif;margin:2rem}}td,th{{padding:.3rem .8rem;text-align:left}}</style>
</head>
<body>
<h1>{domain}</h1>
<p>{count} routes</p>
<table>
<tr><th>Service</th><th>Proxy URL</th><th>Upstream</th></tr>
{rows}</table>
</body></html>
"#,
        domain = escape_html(domain),
        count = router.len(),
        rows = rows,
    );
    page(200, HTML, body)
}

/// 302 to a local path, optionally setting a cookie.
pub fn redirect(location: &str, set_cookie: Option<&str>) -> pingora_core::Result<PageResponse> {
    let mut resp = ResponseHeader::build(302, Some(4))?;
    resp.insert_header(http::header::LOCATION, location)?;
    if let Some(cookie) = set_cookie {
        resp.append_header(http::header::SET_COOKIE, cookie)?;
    }
    resp.insert_header(http::header::CONTENT_LENGTH, 0)?;
    resp.insert_header(http::header::CACHE_CONTROL, "no-store")?;
    Ok(PageResponse {
        header: resp,
        body: Bytes::new(),
    })
}

pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Get a human-readable reason for common HTTP status codes
fn status_reason(code: u16) -> &'static str {
    match code {
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Error",
    }
}
