//! Pluggable object storage handles.
//!
//! Mirrors the role of `fsspec` in the original implementation: a dataset's
//! `base_uri` is resolved once into a [`StorageHandle`] wrapping an
//! [`object_store::ObjectStore`], and every read/write path afterwards talks
//! only to that trait object. `file://` URIs (and bare paths) resolve to
//! [`LocalFileSystem`]; `s3://` URIs resolve to an S3-compatible store built
//! from [`StorageOptions`].

use std::path::{Path as StdPath, PathBuf};
use std::sync::{Arc, OnceLock};

use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::{aws::AmazonS3Builder, ObjectStore};
use tokio::runtime::Runtime;
use url::Url;

use crate::error::{Error, Result};

/// Credentials and endpoint overrides for remote object stores.
///
/// Fields default to `None`, in which case the underlying store builder
/// falls back to its usual environment-variable discovery (`AWS_*`).
#[derive(Debug, Clone, Default)]
pub struct StorageOptions {
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub allow_http: bool,
}

/// A resolved object store plus the root prefix datasets are rooted under.
#[derive(Clone)]
pub struct StorageHandle {
    pub store: Arc<dyn ObjectStore>,
    pub root: ObjectPath,
    pub protocol: String,
    pub base_uri: String,
    /// Local filesystem mirror of `root`, set only when `protocol == "file"`.
    /// Lets the writer take an atomic-rename fast path instead of a copy.
    pub local_root: Option<PathBuf>,
}

/// True if `value` parses as a URI with a scheme, or is an absolute/relative
/// filesystem path that should be treated as `file://`.
pub fn looks_like_uri(value: &str) -> bool {
    if let Ok(parsed) = Url::parse(value) {
        return !parsed.scheme().is_empty() && parsed.scheme().len() > 1;
    }
    value.starts_with('/') || value.starts_with("./") || value.starts_with("../")
}

/// Resolve a `base_uri` into a [`StorageHandle`].
///
/// Supported schemes: `file://`, bare absolute/relative paths (implicit
/// `file://`), and `s3://bucket/prefix`.
pub fn resolve_filesystem(uri: &str, options: Option<&StorageOptions>) -> Result<StorageHandle> {
    if let Ok(parsed) = Url::parse(uri) {
        match parsed.scheme() {
            "file" => resolve_local(parsed.path()),
            "s3" => resolve_s3(&parsed, options),
            other => Err(Error::UnsupportedScheme(other.to_string())),
        }
    } else {
        resolve_local(uri)
    }
}

fn resolve_local(path: &str) -> Result<StorageHandle> {
    let root = PathBuf::from(path);
    std::fs::create_dir_all(&root)?;
    let store = LocalFileSystem::new_with_prefix(&root)
        .map_err(|e| Error::other(format!("cannot root local store at {}: {e}", root.display())))?;
    Ok(StorageHandle {
        store: Arc::new(store),
        root: ObjectPath::from(""),
        protocol: "file".to_string(),
        base_uri: format!("file://{}", root.display()),
        local_root: Some(root),
    })
}

fn resolve_s3(parsed: &Url, options: Option<&StorageOptions>) -> Result<StorageHandle> {
    let bucket = parsed
        .host_str()
        .ok_or_else(|| Error::other("s3 uri missing bucket host"))?;
    let prefix = parsed.path().trim_start_matches('/').to_string();

    let mut builder = AmazonS3Builder::new().with_bucket_name(bucket);
    if let Some(opts) = options {
        if let Some(endpoint) = &opts.endpoint {
            builder = builder.with_endpoint(endpoint.clone());
        }
        if let Some(region) = &opts.region {
            builder = builder.with_region(region.clone());
        }
        if let Some(key) = &opts.access_key_id {
            builder = builder.with_access_key_id(key.clone());
        }
        if let Some(secret) = &opts.secret_access_key {
            builder = builder.with_secret_access_key(secret.clone());
        }
        if let Some(token) = &opts.session_token {
            builder = builder.with_token(token.clone());
        }
        if opts.allow_http {
            builder = builder.with_allow_http(true);
        }
    }
    let store = builder
        .build()
        .map_err(|e| Error::other(format!("cannot build s3 store for bucket {bucket}: {e}")))?;

    Ok(StorageHandle {
        store: Arc::new(store),
        root: ObjectPath::from(prefix.as_str()),
        protocol: "s3".to_string(),
        base_uri: format!("s3://{bucket}/{prefix}"),
        local_root: None,
    })
}

/// Join a relative dataset path onto a storage handle's root.
pub fn object_path_for(handle: &StorageHandle, relative: &str) -> ObjectPath {
    let root = handle.root.as_ref();
    if root.is_empty() {
        ObjectPath::from(relative)
    } else {
        ObjectPath::from(format!("{}/{}", root.trim_end_matches('/'), relative))
    }
}

/// Absolute local filesystem path for a relative dataset path, when this
/// handle is rooted on the local filesystem.
pub fn local_path_for(handle: &StorageHandle, relative: &str) -> Option<PathBuf> {
    handle.local_root.as_ref().map(|root| join_relative(root, relative))
}

fn join_relative(root: &StdPath, relative: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    for part in relative.split('/').filter(|p| !p.is_empty()) {
        out.push(part);
    }
    out
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Run an async future to completion on a lazily-initialized shared
/// multi-thread runtime. The storage and reader modules are written
/// against `object_store`'s async API; this is the blocking seam the rest
/// of the crate's synchronous, call-per-invocation API is built on.
pub(crate) fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    let rt = RUNTIME.get_or_init(|| {
        Runtime::new().expect("failed to start tokio runtime for storage I/O")
    });
    rt.block_on(fut)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn looks_like_uri_detects_schemes() {
        assert!(looks_like_uri("s3://bucket/prefix"));
        assert!(looks_like_uri("file:///tmp/data"));
        assert!(looks_like_uri("/tmp/data"));
        assert!(looks_like_uri("./relative/data"));
        assert!(!looks_like_uri("my_dataset"));
    }

    #[test]
    fn resolve_local_creates_root() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("nested/store");
        let handle = resolve_filesystem(sub.to_str().unwrap(), None).unwrap();
        assert_eq!(handle.protocol, "file");
        assert!(sub.exists());
    }

    #[test]
    fn unsupported_scheme_errors() {
        let err = resolve_filesystem("gs://bucket/prefix", None).unwrap_err();
        assert!(matches!(err, Error::UnsupportedScheme(s) if s == "gs"));
    }
}
