//! Local HTTP cache host.
//!
//! Started when the task environment carries no `CIRRUS_HTTP_CACHE_HOST`;
//! cache and artifact transfers then go through this loopback server
//! instead of a worker-provided proxy. Objects live in a per-task temp
//! directory; keys may contain slashes.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tracing::{debug, error, info};

use crate::errors::{Error, Result};

struct CacheStore {
    base: PathBuf,
}

impl CacheStore {
    /// Map a request key onto a path under the store root, rejecting
    /// traversal attempts.
    fn object_path(&self, key: &str) -> Option<PathBuf> {
        let relative = Path::new(key.trim_start_matches('/'));
        if relative.as_os_str().is_empty() {
            return None;
        }
        for component in relative.components() {
            if !matches!(component, Component::Normal(_)) {
                return None;
            }
        }
        Some(self.base.join(relative))
    }
}

async fn get_object(
    State(store): State<Arc<CacheStore>>,
    UrlPath(key): UrlPath<String>,
) -> impl IntoResponse {
    let Some(path) = store.object_path(&key) else {
        return (StatusCode::BAD_REQUEST, Vec::new());
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            debug!(key = %key, size = bytes.len(), "cache hit");
            (StatusCode::OK, bytes)
        }
        Err(_) => {
            debug!(key = %key, "cache miss");
            (StatusCode::NOT_FOUND, Vec::new())
        }
    }
}

async fn put_object(
    State(store): State<Arc<CacheStore>>,
    UrlPath(key): UrlPath<String>,
    body: Bytes,
) -> StatusCode {
    let Some(path) = store.object_path(&key) else {
        return StatusCode::BAD_REQUEST;
    };
    if let Some(parent) = path.parent() {
        if tokio::fs::create_dir_all(parent).await.is_err() {
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    }
    match tokio::fs::write(&path, &body).await {
        Ok(()) => {
            debug!(key = %key, size = body.len(), "stored cache object");
            StatusCode::CREATED
        }
        Err(e) => {
            error!(key = %key, error = %e, "failed to store cache object");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Bind an ephemeral loopback port, serve in the background and return the
/// listen address in `host:port` form.
pub async fn start(task_id: i64) -> Result<String> {
    let base = std::env::temp_dir().join(format!("cirrus-http-cache-{task_id}"));
    std::fs::create_dir_all(&base)
        .map_err(|e| Error::file_system(base.clone(), "create cache store", e))?;

    let store = Arc::new(CacheStore { base });
    let app = Router::new()
        .route("/*key", get(get_object).put(put_object).post(put_object))
        .layer(DefaultBodyLimit::disable())
        .with_state(store);

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(|e| Error::file_system("127.0.0.1:0", "bind cache host", e))?;
    let addr = listener
        .local_addr()
        .map_err(|e| Error::file_system("127.0.0.1:0", "resolve cache host address", e))?;

    info!(%addr, "started local HTTP cache host");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "HTTP cache host terminated");
        }
    });

    Ok(format!("127.0.0.1:{}", addr.port()))
}
