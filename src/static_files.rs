use crate::pages::PageResponse;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use pingora_http::ResponseHeader;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime};

/// Cached file entry
struct CachedFile {
    body: Bytes,
    mime: String,
    last_modified: String,
    cached_at: Instant,
}

/// Global file cache (canonical path -> cached entry)
static FILE_CACHE: Lazy<RwLock<HashMap<PathBuf, CachedFile>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Re-check the file on disk after this many seconds
const CACHE_TTL_SECS: u64 = 5;

/// Result of a static file lookup
pub enum StaticOutcome {
    Found(PageResponse),
    NotFound,
    /// The path escapes the served root
    Forbidden,
}

/// Serve `relative` (the request path below `/public/`) from `base_dir`.
///
/// - Any `..` segment, backslash or NUL is rejected before touching the disk
/// - The resolved path must canonicalize to somewhere inside `base_dir`
/// - Directories serve their `index.html`
/// - `If-Modified-Since` equal to the file's `Last-Modified` yields 304
pub fn serve_static_file(
    base_dir: &str,
    relative: &str,
    cache_secs: u64,
    if_modified_since: Option<&str>,
) -> pingora_core::Result<StaticOutcome> {
    let relative = relative.trim_start_matches('/');

    if relative
        .split('/')
        .any(|seg| seg == ".." || seg.contains('\\') || seg.contains('\0'))
    {
        log::warn!("path traversal attempt: /public/{}", relative);
        return Ok(StaticOutcome::Forbidden);
    }

    let mut file_path = PathBuf::from(base_dir);
    file_path.push(relative);

    if file_path.is_dir() {
        file_path.push("index.html");
    }

    let canonical = match file_path.canonicalize() {
        Ok(p) => p,
        Err(_) => return Ok(StaticOutcome::NotFound),
    };
    let base_canonical = match Path::new(base_dir).canonicalize() {
        Ok(p) => p,
        Err(e) => {
            log::debug!("static root {} unavailable: {}", base_dir, e);
            return Ok(StaticOutcome::NotFound);
        }
    };
    if !canonical.starts_with(&base_canonical) {
        log::warn!(
            "path traversal attempt: /public/{} resolved to {}",
            relative,
            canonical.display()
        );
        return Ok(StaticOutcome::Forbidden);
    }

    if !canonical.is_file() {
        return Ok(StaticOutcome::NotFound);
    }

    let now = Instant::now();
    {
        let cache = FILE_CACHE.read();
        if let Some(cached) = cache.get(&canonical) {
            if now.duration_since(cached.cached_at).as_secs() < CACHE_TTL_SECS {
                if if_modified_since == Some(cached.last_modified.as_str()) {
                    return not_modified(&cached.last_modified).map(StaticOutcome::Found);
                }
                return build_200_response(
                    &cached.body,
                    &cached.mime,
                    &cached.last_modified,
                    cache_secs,
                )
                .map(StaticOutcome::Found);
            }
        }
    }

    // Cache miss or stale: read from disk
    let metadata = match std::fs::metadata(&canonical) {
        Ok(m) => m,
        Err(_) => return Ok(StaticOutcome::NotFound),
    };
    let modified: DateTime<Utc> = metadata
        .modified()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .into();
    let last_modified = modified.format("%a, %d %b %Y %H:%M:%S GMT").to_string();

    if if_modified_since == Some(last_modified.as_str()) {
        return not_modified(&last_modified).map(StaticOutcome::Found);
    }

    let body = match std::fs::read(&canonical) {
        Ok(b) => Bytes::from(b),
        Err(e) => {
            log::warn!("failed to read {}: {}", canonical.display(), e);
            return Ok(StaticOutcome::NotFound);
        }
    };

    let mime = mime_guess::from_path(&canonical)
        .first_or_octet_stream()
        .to_string();

    let resp = build_200_response(&body, &mime, &last_modified, cache_secs)?;

    FILE_CACHE.write().insert(
        canonical,
        CachedFile {
            body,
            mime,
            last_modified,
            cached_at: now,
        },
    );

    Ok(StaticOutcome::Found(resp))
}

fn not_modified(last_modified: &str) -> pingora_core::Result<PageResponse> {
    let mut resp = ResponseHeader::build(304, Some(2))?;
    resp.insert_header(http::header::LAST_MODIFIED, last_modified)?;
    Ok(PageResponse {
        header: resp,
        body: Bytes::new(),
    })
}

/// Build a 200 OK response for a static file
fn build_200_response(
    body: &Bytes,
    mime: &str,
    last_modified: &str,
    cache_secs: u64,
) -> pingora_core::Result<PageResponse> {
    let mut resp = ResponseHeader::build(200, Some(5))?;
    resp.insert_header(http::header::CONTENT_TYPE, mime)?;
    resp.insert_header(http::header::CONTENT_LENGTH, body.len())?;
    resp.insert_header(http::header::LAST_MODIFIED, last_modified)?;

    if cache_secs > 0 {
        let val = format!("public, max-age={}", cache_secs);
        resp.insert_header(http::header::CACHE_CONTROL, &val)?;
    }

    Ok(PageResponse {
        header: resp,
        body: body.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    /// Fresh fixture tree: `<tmp>/root/{app.css, docs/index.html}` and `<tmp>/secret.txt`.
    fn fixture(name: &str) -> (PathBuf, String) {
        let dir = std::env::temp_dir().join(format!(
            "prefix-gate-static-{}-{}",
            name,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        let root = dir.join("root");
        fs::create_dir_all(root.join("docs")).unwrap();
        fs::write(root.join("app.css"), "body{}").unwrap();
        fs::write(root.join("docs").join("index.html"), "<h1>docs</h1>").unwrap();
        fs::write(dir.join("secret.txt"), "top secret").unwrap();
        (dir, root.to_string_lossy().into_owned())
    }

    fn found(outcome: StaticOutcome) -> PageResponse {
        match outcome {
            StaticOutcome::Found(r) => r,
            StaticOutcome::NotFound => panic!("expected file, got 404"),
            StaticOutcome::Forbidden => panic!("expected file, got 403"),
        }
    }

    #[test]
    fn test_serves_file_with_mime_and_cache() {
        let (_dir, root) = fixture("mime");
        let resp = found(serve_static_file(&root, "app.css", 3600, None).unwrap());
        assert_eq!(resp.header.status.as_u16(), 200);
        assert_eq!(&resp.body[..], b"body{}");
        assert_eq!(
            resp.header.headers.get(http::header::CONTENT_TYPE).unwrap(),
            "text/css"
        );
        assert_eq!(
            resp.header.headers.get(http::header::CACHE_CONTROL).unwrap(),
            "public, max-age=3600"
        );
        assert!(resp.header.headers.get(http::header::LAST_MODIFIED).is_some());
    }

    #[test]
    fn test_no_cache_control_when_zero() {
        let (_dir, root) = fixture("nocache");
        let resp = found(serve_static_file(&root, "/app.css", 0, None).unwrap());
        assert!(resp.header.headers.get(http::header::CACHE_CONTROL).is_none());
    }

    #[test]
    fn test_directory_serves_index() {
        let (_dir, root) = fixture("index");
        let resp = found(serve_static_file(&root, "docs/", 0, None).unwrap());
        assert_eq!(&resp.body[..], b"<h1>docs</h1>");
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let (_dir, root) = fixture("missing");
        assert!(matches!(
            serve_static_file(&root, "nope.js", 0, None).unwrap(),
            StaticOutcome::NotFound
        ));
    }

    #[test]
    fn test_missing_root_is_not_found() {
        assert!(matches!(
            serve_static_file("/definitely/not/here", "a.css", 0, None).unwrap(),
            StaticOutcome::NotFound
        ));
    }

    #[test]
    fn test_if_modified_since() {
        let (_dir, root) = fixture("ims");
        let first = found(serve_static_file(&root, "app.css", 0, None).unwrap());
        let lm = first
            .header
            .headers
            .get(http::header::LAST_MODIFIED)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();

        let second = found(serve_static_file(&root, "app.css", 0, Some(&lm)).unwrap());
        assert_eq!(second.header.status.as_u16(), 304);
        assert!(second.body.is_empty());

        let stale = found(
            serve_static_file(&root, "app.css", 0, Some("Mon, 01 Jan 1990 00:00:00 GMT")).unwrap(),
        );
        assert_eq!(stale.header.status.as_u16(), 200);
    }

    // ─── Security: path traversal ───────────────────────────

    #[test]
    fn test_dotdot_forbidden() {
        let (_dir, root) = fixture("dotdot");
        assert!(matches!(
            serve_static_file(&root, "../secret.txt", 0, None).unwrap(),
            StaticOutcome::Forbidden
        ));
        assert!(matches!(
            serve_static_file(&root, "docs/../../secret.txt", 0, None).unwrap(),
            StaticOutcome::Forbidden
        ));
    }

    #[test]
    fn test_dotdot_forbidden_even_if_missing() {
        let (_dir, root) = fixture("dotdot-missing");
        assert!(matches!(
            serve_static_file(&root, "../../../../etc/passwd", 0, None).unwrap(),
            StaticOutcome::Forbidden
        ));
    }

    #[test]
    fn test_backslash_and_nul_forbidden() {
        let (_dir, root) = fixture("bslash");
        assert!(matches!(
            serve_static_file(&root, "..\\secret.txt", 0, None).unwrap(),
            StaticOutcome::Forbidden
        ));
        assert!(matches!(
            serve_static_file(&root, "app.css\0", 0, None).unwrap(),
            StaticOutcome::Forbidden
        ));
    }

    #[test]
    fn test_dots_inside_names_allowed() {
        let (dir, root) = fixture("dots");
        fs::write(dir.join("root").join("a..b.txt"), "ok").unwrap();
        let resp = found(serve_static_file(&root, "a..b.txt", 0, None).unwrap());
        assert_eq!(&resp.body[..], b"ok");
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_forbidden() {
        let (dir, root) = fixture("symlink");
        std::os::unix::fs::symlink(dir.join("secret.txt"), dir.join("root").join("leak.txt"))
            .unwrap();
        assert!(matches!(
            serve_static_file(&root, "leak.txt", 0, None).unwrap(),
            StaticOutcome::Forbidden
        ));
    }
}
