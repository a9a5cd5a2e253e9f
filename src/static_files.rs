//! Static file serving as an ordinary middleware.
//!
//! No special cases in the dispatch core: [`StaticFiles::into_middleware`]
//! yields a plain priority-agnostic middleware closure that serves files
//! under a root directory and falls through to `next` when nothing matches.
//!
//! An opt-in process-wide cache pool keeps file bytes in memory, keyed by
//! absolute path. The pool is lazily constructed; concurrent first accesses
//! may both construct an entry, which is harmless because construction is
//! idempotent. Entries revalidate against the filesystem mtime on every hit
//! and can be evicted explicitly with [`expire`] / [`clear_pool`].

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use std::{fs, io};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

use crate::dispatcher::{HandlerResult, Next, Outcome};
use crate::engine::BytesSource;
use crate::request::Request;
use crate::response::Response;

const STREAM_CHUNK: usize = 64 * 1024;

#[derive(Clone)]
struct CachedFile {
    bytes: Arc<Vec<u8>>,
    mtime: SystemTime,
    etag: String,
    cached_at: Instant,
}

static POOL: Lazy<DashMap<PathBuf, CachedFile>> = Lazy::new(DashMap::new);

/// Evicts one pooled file.
pub fn expire(path: &Path) -> bool {
    POOL.remove(path).is_some()
}

/// Drops every pooled file.
pub fn clear_pool() {
    POOL.clear();
}

/// Configuration for one static mount.
pub struct StaticFiles {
    root: PathBuf,
    mount: String,
    index_file: String,
    use_cache: bool,
    cache_ttl: Option<Duration>,
}

impl StaticFiles {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            mount: "/".to_string(),
            index_file: "index.html".to_string(),
            use_cache: false,
            cache_ttl: None,
        }
    }

    /// Prefix stripped from request paths before filesystem mapping; set it
    /// to the pattern the middleware is mounted under.
    #[must_use]
    pub fn mounted_at(mut self, prefix: impl Into<String>) -> Self {
        self.mount = prefix.into();
        self
    }

    /// File served for directory paths.
    #[must_use]
    pub fn index_file(mut self, name: impl Into<String>) -> Self {
        self.index_file = name.into();
        self
    }

    /// Enables the process-wide byte cache, optionally time-bounded.
    #[must_use]
    pub fn cached(mut self, ttl: Option<Duration>) -> Self {
        self.use_cache = true;
        self.cache_ttl = ttl;
        self
    }

    /// Consumes the configuration into a middleware closure.
    pub fn into_middleware(
        self,
    ) -> impl Fn(Request, Response, Next) -> HandlerResult + 'static {
        let this = Rc::new(self);
        move |request, response, next| this.serve(&request, &response, &next)
    }

    fn serve(&self, request: &Request, response: &Response, next: &Next) -> HandlerResult {
        let method = request.method();
        let is_head = method == http::Method::HEAD;
        if method != http::Method::GET && !is_head {
            response.status(405)?;
            response.header("allow", "GET, HEAD")?;
            response.send(None);
            return Ok(Outcome::Completed);
        }

        let path = request.path();
        let relative = path
            .strip_prefix(self.mount.trim_end_matches('/'))
            .unwrap_or(&path);
        let Some(mut file_path) = self.map_path(relative) else {
            debug!(path = %path, "static path escaped the root, ignoring");
            next.ok();
            return Ok(Outcome::Completed);
        };
        if file_path.is_dir() {
            file_path.push(&self.index_file);
        }
        if !file_path.is_file() {
            next.ok();
            return Ok(Outcome::Completed);
        }

        let file = self.load(&file_path)?;

        // Conditional revalidation by strong ETag.
        if request.header("if-none-match").as_deref() == Some(file.etag.as_str()) {
            response.status(304)?;
            response.header("etag", &file.etag)?;
            response.send(None);
            return Ok(Outcome::Completed);
        }

        response.header("etag", &file.etag)?;
        response.content_type(crate::mime::from_path(&file_path))?;
        if is_head {
            response.header("content-length", &file.bytes.len().to_string())?;
            response.send(None);
            return Ok(Outcome::Completed);
        }

        let total = file.bytes.len();
        let chunks = file
            .bytes
            .chunks(STREAM_CHUNK)
            .map(<[u8]>::to_vec)
            .collect::<Vec<_>>();
        let source = Rc::new(RefCell::new(BytesSource::new(chunks)));
        response.stream(source, Some(total));
        Ok(Outcome::Completed)
    }

    /// Maps a URL path onto the root, refusing every traversal component.
    fn map_path(&self, url_path: &str) -> Option<PathBuf> {
        let mut mapped = self.root.clone();
        for comp in Path::new(url_path.trim_start_matches('/')).components() {
            match comp {
                Component::Normal(segment) => mapped.push(segment),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(mapped)
    }

    fn load(&self, path: &Path) -> io::Result<CachedFile> {
        let metadata = fs::metadata(path)?;
        let mtime = metadata.modified().unwrap_or(UNIX_EPOCH);

        if self.use_cache {
            if let Some(entry) = POOL.get(path) {
                let fresh = self
                    .cache_ttl
                    .map_or(true, |ttl| entry.cached_at.elapsed() <= ttl);
                if fresh && entry.mtime == mtime {
                    return Ok(entry.clone());
                }
            }
        }

        let bytes = fs::read(path)?;
        let file = CachedFile {
            etag: etag_for(&bytes, mtime),
            bytes: Arc::new(bytes),
            mtime,
            cached_at: Instant::now(),
        };
        if self.use_cache {
            // Concurrent first loads may race here; last write wins and
            // every candidate entry is equivalent.
            POOL.insert(path.to_path_buf(), file.clone());
        }
        Ok(file)
    }
}

fn etag_for(bytes: &[u8], mtime: SystemTime) -> String {
    let seconds = mtime
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("\"{:x}-{:x}\"", bytes.len(), seconds)
}
