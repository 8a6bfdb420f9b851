//! Multi-cloud storage abstraction.
//!
//! Provides a unified interface for working with S3, GCS, Azure Blob Storage,
//! and local filesystem. Paths passed to the provider are relative to the
//! key prefix of the URL it was created from.

mod azure;
mod gcs;
mod local;
mod s3;

use bytes::Bytes;
use object_store::path::Path;
use object_store::{
    Attribute, AttributeValue, Attributes, ObjectStore, PutOptions, PutPayload,
};
use regex::{Captures, Regex};
use snafu::prelude::*;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use crate::emit;
use crate::error::{InvalidUrlSnafu, IoSnafu, ObjectStoreSnafu, StorageError};
use crate::metrics::events::{
    RequestStatus, StorageOperation, StorageRequest, StorageRequestDuration,
};

pub use azure::AzureConfig;
pub use gcs::GcsConfig;
pub use local::LocalConfig;
pub use s3::S3Config;

/// A reference-counted storage provider.
pub type StorageProviderRef = Arc<StorageProvider>;

/// Storage provider that abstracts over different cloud storage backends.
#[derive(Clone)]
pub struct StorageProvider {
    pub(crate) config: BackendConfig,
    pub(crate) object_store: Arc<dyn ObjectStore>,
    pub(crate) storage_options: HashMap<String, String>,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.url_for(&Path::default()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    S3,
    Gcs,
    Azure,
    Local,
}

/// URL patterns tried in order; the first match decides the backend.
const URL_PATTERNS: &[(Backend, &str)] = &[
    (
        Backend::S3,
        r"^https://s3\.(?P<region>[\w\-]+)\.amazonaws\.com/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$",
    ),
    (
        Backend::S3,
        r"^https://(?P<bucket>[a-z0-9\-\.]+)\.s3\.(?P<region>[\w\-]+)\.amazonaws\.com(/(?P<key>.+))?$",
    ),
    (
        Backend::S3,
        r"^[sS]3[aA]?::(?P<protocol>https?)://(?P<endpoint>[^:/]+):(?P<port>\d+)/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$",
    ),
    (
        Backend::S3,
        r"^[sS]3[aA]?://(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$",
    ),
    (
        Backend::Gcs,
        r"^https://storage\.googleapis\.com/(?P<bucket>[a-z0-9\-_\.]+)(/(?P<key>.+))?$",
    ),
    (
        Backend::Gcs,
        r"^https://(?P<bucket>[a-z0-9\-_\.]+)\.storage\.googleapis\.com(/(?P<key>.+))?$",
    ),
    (
        Backend::Gcs,
        r"^[gG][sS]://(?P<bucket>[a-z0-9\-\._]+)(/(?P<key>.+))?$",
    ),
    (
        Backend::Azure,
        r"^abfss?://(?P<container>[a-z0-9\-]+)@(?P<account>[a-z0-9]+)\.dfs\.core\.windows\.net(/(?P<key>.+))?$",
    ),
    (
        Backend::Azure,
        r"^https://(?P<account>[a-z0-9]+)\.(blob|dfs)\.core\.windows\.net/(?P<container>[a-z0-9\-]+)(/(?P<key>.+))?$",
    ),
    (Backend::Local, r"^file://(?P<path>.*)$"),
    (Backend::Local, r"^file:(?P<path>.*)$"),
    (Backend::Local, r"^(?P<path>/.*)$"),
];

static MATCHERS: LazyLock<Vec<(Backend, Regex)>> = LazyLock::new(|| {
    URL_PATTERNS
        .iter()
        .filter_map(|(backend, pattern)| Regex::new(pattern).ok().map(|re| (*backend, re)))
        .collect()
});

/// Backend configuration enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    S3(S3Config),
    Gcs(GcsConfig),
    Azure(AzureConfig),
    Local(LocalConfig),
}

fn group(caps: &Captures<'_>, name: &str, url: &str) -> Result<String, StorageError> {
    caps.name(name)
        .map(|m| m.as_str().to_string())
        .context(InvalidUrlSnafu { url })
}

fn key_of(caps: &Captures<'_>) -> Option<Path> {
    caps.name("key")
        .map(|m| m.as_str().trim_end_matches('/'))
        .filter(|key| !key.is_empty())
        .map(Path::from)
}

impl BackendConfig {
    /// Parse a URL or filesystem path into a backend configuration.
    ///
    /// Relative filesystem paths are resolved against the working directory.
    pub fn parse_url(url: &str) -> Result<Self, StorageError> {
        if !url.contains("://") && !url.starts_with('/') && !url.starts_with("file:") {
            let absolute = std::path::absolute(url).context(IoSnafu)?;
            return Ok(BackendConfig::Local(LocalConfig {
                path: absolute.to_string_lossy().trim_end_matches('/').to_string(),
                key: None,
            }));
        }

        let (backend, caps) = MATCHERS
            .iter()
            .find_map(|(backend, re)| re.captures(url).map(|caps| (*backend, caps)))
            .context(InvalidUrlSnafu { url })?;

        match backend {
            Backend::S3 => Self::parse_s3(&caps, url),
            Backend::Gcs => Ok(BackendConfig::Gcs(GcsConfig {
                bucket: group(&caps, "bucket", url)?,
                key: key_of(&caps),
            })),
            Backend::Azure => Ok(BackendConfig::Azure(AzureConfig {
                account: group(&caps, "account", url)?,
                container: group(&caps, "container", url)?,
                key: key_of(&caps),
            })),
            Backend::Local => {
                let path = group(&caps, "path", url)?;
                let path = format!("/{}", path.trim_start_matches('/'));
                let path = match path.trim_end_matches('/') {
                    "" => "/".to_string(),
                    trimmed => trimmed.to_string(),
                };
                Ok(BackendConfig::Local(LocalConfig { path, key: None }))
            }
        }
    }

    fn parse_s3(caps: &Captures<'_>, url: &str) -> Result<Self, StorageError> {
        let bucket = group(caps, "bucket", url)?;

        let region = std::env::var("AWS_DEFAULT_REGION")
            .ok()
            .or_else(|| caps.name("region").map(|m| m.as_str().to_string()));

        let endpoint = std::env::var("AWS_ENDPOINT").ok().or_else(|| {
            caps.name("endpoint").map(|host| {
                let protocol = caps.name("protocol").map(|p| p.as_str()).unwrap_or("https");
                let port = caps
                    .name("port")
                    .and_then(|p| p.as_str().parse::<u16>().ok())
                    .unwrap_or(443);
                format!("{protocol}://{}:{port}", host.as_str())
            })
        });

        Ok(BackendConfig::S3(S3Config {
            endpoint,
            region,
            bucket,
            key: key_of(caps),
        }))
    }

    pub(crate) fn key(&self) -> Option<&Path> {
        match self {
            BackendConfig::S3(s3) => s3.key.as_ref(),
            BackendConfig::Gcs(gcs) => gcs.key.as_ref(),
            BackendConfig::Azure(azure) => azure.key.as_ref(),
            BackendConfig::Local(local) => local.key.as_ref(),
        }
    }
}

/// Split an object URL into its parent location and object name.
///
/// `gs://bucket/dir/catalog.json` becomes `("gs://bucket/dir", "catalog.json")`.
pub fn split_object_url(url: &str) -> Result<(String, String), StorageError> {
    let url = url.trim_end_matches('/');
    let (parent, name) = url.rsplit_once('/').unwrap_or((".", url));
    ensure!(!name.is_empty(), InvalidUrlSnafu { url });

    let parent = match parent {
        "" => "/",
        "file:" | "file:/" | "file://" => "/",
        other if other.ends_with(':') || other.ends_with(":/") => {
            return InvalidUrlSnafu { url }.fail();
        }
        other => other,
    };
    Ok((parent.to_string(), name.to_string()))
}

/// Emit the request counter and latency histogram for one storage call.
fn record<T, E>(operation: StorageOperation, start: Instant, result: &Result<T, E>) {
    let status = if result.is_ok() {
        RequestStatus::Success
    } else {
        RequestStatus::Error
    };
    emit!(StorageRequest { operation, status });
    emit!(StorageRequestDuration {
        operation,
        duration: start.elapsed(),
    });
}

impl StorageProvider {
    /// Create a storage provider for the given URL with storage options.
    pub async fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        match BackendConfig::parse_url(url)? {
            BackendConfig::S3(config) => Self::construct_s3(config, options).await,
            BackendConfig::Gcs(config) => Self::construct_gcs(config, options).await,
            BackendConfig::Azure(config) => Self::construct_azure(config, options).await,
            BackendConfig::Local(config) => Self::construct_local(config).await,
        }
    }

    /// Get the contents of a file.
    pub async fn get(&self, path: impl Into<Path>) -> Result<Bytes, StorageError> {
        let path = path.into();
        let start = Instant::now();
        let result = match self.object_store.get(&self.qualify_path(&path)).await {
            Ok(response) => response.bytes().await,
            Err(err) => Err(err),
        };
        record(StorageOperation::Get, start, &result);

        result.context(ObjectStoreSnafu)
    }

    /// Put bytes to a path.
    pub async fn put(&self, path: impl Into<Path>, bytes: Vec<u8>) -> Result<(), StorageError> {
        let path = path.into();
        self.put_payload(&path, PutPayload::from(Bytes::from(bytes)))
            .await
    }

    /// Put a payload to a path.
    pub async fn put_payload(&self, path: &Path, payload: PutPayload) -> Result<(), StorageError> {
        self.put_payload_with_opts(path, payload, PutOptions::default())
            .await
    }

    /// Put a Parquet payload, tagging it with the Parquet content type where supported.
    pub async fn put_parquet(&self, path: &Path, payload: PutPayload) -> Result<(), StorageError> {
        // Local filesystem doesn't support content-type attributes
        if matches!(self.config, BackendConfig::Local(_)) {
            return self.put_payload(path, payload).await;
        }

        let opts = PutOptions {
            attributes: Attributes::from_iter([(
                Attribute::ContentType,
                AttributeValue::from("application/vnd.apache.parquet"),
            )]),
            ..Default::default()
        };
        self.put_payload_with_opts(path, payload, opts).await
    }

    async fn put_payload_with_opts(
        &self,
        path: &Path,
        payload: PutPayload,
        opts: PutOptions,
    ) -> Result<(), StorageError> {
        let path = self.qualify_path(path);
        let start = Instant::now();
        let result = self.object_store.put_opts(&path, payload, opts).await;
        record(StorageOperation::Put, start, &result);

        result.context(ObjectStoreSnafu)?;
        Ok(())
    }

    /// Delete a file.
    pub async fn delete(&self, path: &Path) -> Result<(), StorageError> {
        let path = self.qualify_path(path);
        let start = Instant::now();
        let result = self.object_store.delete(&path).await;
        record(StorageOperation::Delete, start, &result);

        result.context(ObjectStoreSnafu)
    }

    /// Qualify a path with the configured key prefix.
    pub fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match self.config.key() {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }

    /// Fully qualified URL of a path in this storage.
    ///
    /// An empty path yields the URL of the storage root itself.
    pub fn url_for(&self, path: &Path) -> String {
        let qualified = self.qualify_path(path);
        let url = match &self.config {
            BackendConfig::S3(s3) => format!("s3://{}/{}", s3.bucket, qualified),
            BackendConfig::Gcs(gcs) => format!("gs://{}/{}", gcs.bucket, qualified),
            BackendConfig::Azure(azure) => format!(
                "abfss://{}@{}.dfs.core.windows.net/{}",
                azure.container, azure.account, qualified
            ),
            BackendConfig::Local(local) => {
                format!("file://{}/{}", local.path.trim_end_matches('/'), qualified)
            }
        };
        url.trim_end_matches('/').to_string()
    }

    /// Get storage options for external integrations (e.g., Delta Lake).
    pub fn storage_options(&self) -> &HashMap<String, String> {
        &self.storage_options
    }
}
