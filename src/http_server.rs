//! Minimal static file server used to expose local build output to the shell.
//!
//! The router runs on its own tokio runtime in a background thread so the
//! rest of the tool stays synchronous. Every response carries
//! `Connection: close`: keeping connections alive confuses shells that
//! abandon a download halfway.

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::State;
use axum::http::header::{
    CACHE_CONTROL, CONNECTION, CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, LOCATION,
};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, UNIX_EPOCH};
use tokio::sync::watch;
use tower_http::set_header::SetResponseHeaderLayer;

use time::format_description::well_known::Rfc2822;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::util::hashing::sha256_file;

const HTTP_DATE: &[time::format_description::FormatItem<'static>] =
    format_description!("[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT");

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// A running server. It serves from a background thread until
/// [`HttpServer::shutdown`] is called or the process exits.
pub struct HttpServer {
    addr: SocketAddr,
    shutdown_tx: Option<watch::Sender<bool>>,
    thread: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone)]
struct Roots {
    base: PathBuf,
    /// URL path prefix (without slashes) -> directory.
    mappings: Vec<(Vec<String>, PathBuf)>,
}

impl HttpServer {
    /// Serves `base_dir` on an OS-assigned loopback port.
    pub fn start(base_dir: &Path) -> Result<Self> {
        Self::start_with_mappings(base_dir, &[])
    }

    /// Like [`HttpServer::start`], with extra `prefix/` -> directory mappings
    /// that take precedence over `base_dir`.
    pub fn start_with_mappings(base_dir: &Path, mappings: &[(String, PathBuf)]) -> Result<Self> {
        let listener =
            std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).context("binding http server on 127.0.0.1")?;
        listener.set_nonblocking(true).context("making http listener non-blocking")?;
        let addr = listener.local_addr()?;
        let roots = Roots {
            base: base_dir.to_path_buf(),
            mappings: mappings
                .iter()
                .map(|(prefix, dir)| (split_components(prefix), dir.clone()))
                .collect(),
        };
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name(format!("http-worker-{}", addr.port()))
            .enable_all()
            .build()
            .context("building http server runtime")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let app = router(roots);
        let thread = thread::Builder::new()
            .name(format!("http-server-{}", addr.port()))
            .spawn(move || runtime.block_on(serve(listener, app, shutdown_rx)))
            .context("spawning http server thread")?;
        log::debug!("serving {} on http://{}/", base_dir.display(), addr);
        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    /// Stops accepting connections. Requests already in progress get a short
    /// grace period to finish.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Blocks until the server stops on its own.
    pub fn wait(mut self) -> Result<()> {
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| anyhow::anyhow!("http server thread panicked"))?;
        }
        Ok(())
    }
}

fn router(roots: Roots) -> Router {
    Router::new()
        .fallback(serve_path)
        .layer(SetResponseHeaderLayer::overriding(CONNECTION, HeaderValue::from_static("close")))
        .with_state(Arc::new(roots))
}

async fn serve(listener: std::net::TcpListener, app: Router, shutdown_rx: watch::Receiver<bool>) {
    let listener = match tokio::net::TcpListener::from_std(listener) {
        Ok(l) => l,
        Err(e) => {
            log::error!("http server: cannot create async listener: {}", e);
            return;
        }
    };
    let mut shutdown_server = shutdown_rx.clone();
    let mut shutdown_wait = shutdown_rx;
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = shutdown_server.changed().await;
    });
    let mut server_task = tokio::spawn(async move { server.await });

    tokio::select! {
        result = &mut server_task => report_exit(result),
        _ = shutdown_wait.changed() => {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut server_task).await {
                Ok(result) => report_exit(result),
                Err(_) => {
                    log::warn!("http server did not stop within {:?}; aborting", SHUTDOWN_TIMEOUT);
                    server_task.abort();
                }
            }
        }
    }
}

fn report_exit(result: std::result::Result<std::io::Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::error!("http server failed: {}", e),
        Err(e) => log::error!("http server task failed: {}", e),
    }
}

async fn serve_path(State(roots): State<Arc<Roots>>, method: Method, uri: Uri, headers: HeaderMap) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return error_page(StatusCode::NOT_IMPLEMENTED, "Unsupported method");
    }
    let url_path = uri.path().to_string();
    // Hashing and reading files block.
    let result = tokio::task::spawn_blocking(move || respond(&roots, &url_path, &headers)).await;
    match result {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            log::warn!("http server: error while handling {}: {:#}", uri, e);
            error_page(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
        Err(e) => {
            log::error!("http server: request handler failed: {}", e);
            error_page(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

fn error_page(status: StatusCode, message: &str) -> Response {
    let body = format!(
        "<html><head><title>{code} {msg}</title></head><body><h1>{code} {msg}</h1></body></html>\n",
        code = status.as_u16(),
        msg = message
    );
    (status, [(CONTENT_TYPE, "text/html; charset=utf-8")], body).into_response()
}

fn header<'a>(headers: &'a HeaderMap, name: &axum::http::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn respond(roots: &Roots, url_path: &str, headers: &HeaderMap) -> Result<Response> {
    let path = translate_path(roots, url_path);

    if path.is_dir() {
        if !url_path.ends_with('/') {
            return Ok(Response::builder()
                .status(StatusCode::MOVED_PERMANENTLY)
                .header(LOCATION, format!("{}/", url_path))
                .body(Body::empty())?);
        }
        let index = path.join("index.html");
        if index.is_file() {
            return serve_file(&index, None);
        }
        return Ok(directory_listing(&path, url_path));
    }
    if !path.is_file() {
        return Ok(error_page(StatusCode::NOT_FOUND, "File not found"));
    }

    let etag = format!("\"{}\"", sha256_file(&path)?);
    let if_none_match = header(headers, &IF_NONE_MATCH);
    if if_none_match == Some(etag.as_str()) {
        return not_modified(&etag);
    }
    if if_none_match.is_none() {
        if let Some(ims) = header(headers, &IF_MODIFIED_SINCE).and_then(parse_http_date) {
            if modified_secs(&path)? <= ims.unix_timestamp() {
                return not_modified(&etag);
            }
        }
    }
    serve_file(&path, Some(etag))
}

fn not_modified(etag: &str) -> Result<Response> {
    Ok(Response::builder()
        .status(StatusCode::NOT_MODIFIED)
        .header(ETAG, etag)
        .header(CACHE_CONTROL, "must-revalidate")
        .body(Body::empty())?)
}

fn serve_file(path: &Path, etag: Option<String>) -> Result<Response> {
    let meta = fs::metadata(path)?;
    let contents = fs::read(path).with_context(|| format!("Reading {}", path.display()))?;
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, guess_content_type(path))
        .header(LAST_MODIFIED, http_date(OffsetDateTime::from(meta.modified()?)));
    if let Some(etag) = etag {
        builder = builder.header(ETAG, etag).header(CACHE_CONTROL, "must-revalidate");
    }
    Ok(builder.body(Body::from(contents))?)
}

fn directory_listing(dir: &Path, url_path: &str) -> Response {
    let mut names: Vec<String> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| {
                let mut name = e.file_name().to_string_lossy().into_owned();
                if e.path().is_dir() {
                    name.push('/');
                }
                name
            })
            .collect(),
        Err(_) => return error_page(StatusCode::NOT_FOUND, "No permission to list directory"),
    };
    names.sort_by_key(|n| n.to_lowercase());
    let mut body = format!("<html><head><title>Directory listing for {0}</title></head>\n<body><h2>Directory listing for {0}</h2><hr><ul>\n", url_path);
    for name in names {
        body.push_str(&format!(
            "<li><a href=\"{}\">{}</a></li>\n",
            urlencoding::encode(&name).replace("%2F", "/"),
            name
        ));
    }
    body.push_str("</ul><hr></body></html>\n");
    (StatusCode::OK, [(CONTENT_TYPE, "text/html; charset=utf-8")], body).into_response()
}

fn split_components(path: &str) -> Vec<String> {
    let decoded = urlencoding::decode(path)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| path.to_string());
    decoded
        .split('/')
        // A component smuggling a Windows separator keeps only its last part.
        .map(|c| c.rsplit('\\').next().unwrap_or(c))
        .filter(|c| !c.is_empty() && *c != "." && *c != "..")
        .map(str::to_string)
        .collect()
}

/// Maps a URL path onto the filesystem. `.` and `..` components are dropped,
/// so the result never leaves the served roots.
fn translate_path(roots: &Roots, url_path: &str) -> PathBuf {
    let components = split_components(url_path);
    for (prefix, dir) in &roots.mappings {
        if !prefix.is_empty() && components.starts_with(prefix) {
            return components[prefix.len()..].iter().fold(dir.clone(), |p, c| p.join(c));
        }
    }
    components.iter().fold(roots.base.clone(), |p, c| p.join(c))
}

fn guess_content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" => "text/html",
        "txt" => "text/plain",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "dart" => "application/dart",
        "sky" => "text/sky",
        _ => "application/octet-stream",
    }
}

fn modified_secs(path: &Path) -> std::io::Result<i64> {
    let modified = fs::metadata(path)?.modified()?;
    let secs = modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Ok(secs)
}

pub fn http_date(t: OffsetDateTime) -> String {
    t.to_offset(time::UtcOffset::UTC)
        .format(HTTP_DATE)
        .unwrap_or_default()
}

pub fn parse_http_date(s: &str) -> Option<OffsetDateTime> {
    let s = s.trim();
    if let Ok(t) = PrimitiveDateTime::parse(s, HTTP_DATE) {
        return Some(t.assume_utc());
    }
    OffsetDateTime::parse(s, &Rfc2822).ok()
}
