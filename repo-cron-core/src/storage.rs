//! Durable object storage for shard results, metadata and transfer markers.
//!
//! [`Bucket`] wraps an [`ObjectStore`] plus an optional root prefix taken
//! from the bucket URL, so `gs://results/prod` and `gs://results` can both be
//! used with the same relative key layout.

use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use tracing::{debug, info};
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid bucket url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("object store error: {0}")]
    Store(#[from] object_store::Error),
    #[error("failed to prepare local bucket directory: {0}")]
    Io(#[from] std::io::Error),
}

/// A bucket URL resolved to a concrete store.
#[derive(Clone)]
pub struct Bucket {
    url: String,
    store: Arc<dyn ObjectStore>,
    root: String,
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("url", &self.url)
            .field("root", &self.root)
            .finish()
    }
}

impl Bucket {
    /// Open a bucket from its URL. Supported schemes: `gs`, `s3`, `file`, `mem`.
    /// Cloud credentials are read from the environment by the store builders.
    pub fn open(url: &str) -> Result<Self, StorageError> {
        let invalid = |reason: String| StorageError::InvalidUrl {
            url: url.to_string(),
            reason,
        };
        let parsed = Url::parse(url).map_err(|e| invalid(e.to_string()))?;
        let (store, root): (Arc<dyn ObjectStore>, String) = match parsed.scheme() {
            "gs" => {
                let name = parsed.host_str().ok_or_else(|| invalid("missing bucket name".into()))?;
                let store = GoogleCloudStorageBuilder::from_env()
                    .with_bucket_name(name)
                    .build()?;
                (Arc::new(store), parsed.path().trim_matches('/').to_string())
            }
            "s3" => {
                let name = parsed.host_str().ok_or_else(|| invalid("missing bucket name".into()))?;
                let store = AmazonS3Builder::from_env().with_bucket_name(name).build()?;
                (Arc::new(store), parsed.path().trim_matches('/').to_string())
            }
            "file" => {
                let dir = parsed
                    .to_file_path()
                    .map_err(|_| invalid("not a local path".into()))?;
                std::fs::create_dir_all(&dir)?;
                // the directory itself is the store prefix
                (Arc::new(LocalFileSystem::new_with_prefix(dir)?), String::new())
            }
            "mem" => (Arc::new(InMemory::new()), parsed.path().trim_matches('/').to_string()),
            other => return Err(invalid(format!("unsupported scheme `{other}`"))),
        };
        info!(url, root = %root, "Opened bucket");
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            store,
            root,
        })
    }

    /// Wrap an existing store, keys are used unprefixed.
    pub fn from_store(url: &str, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            store,
            root: String::new(),
        }
    }

    /// The URL this bucket was opened from, without trailing slash.
    pub fn url(&self) -> &str {
        &self.url
    }

    fn path(&self, key: &str) -> Path {
        if self.root.is_empty() {
            Path::from(key)
        } else {
            Path::from(format!("{}/{}", self.root, key))
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self.store.head(&self.path(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Write (or overwrite) an object.
    pub async fn write(&self, key: &str, contents: Vec<u8>) -> Result<(), StorageError> {
        debug!(bucket = %self.url, key, bytes = contents.len(), "Writing object");
        self.store
            .put(&self.path(key), PutPayload::from(contents))
            .await?;
        Ok(())
    }

    pub async fn read(&self, key: &str) -> Result<Bytes, StorageError> {
        let result = self.store.get(&self.path(key)).await?;
        Ok(result.bytes().await?)
    }

    /// All keys below `prefix`, relative to the bucket root.
    pub async fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>, StorageError> {
        let list_prefix = match (self.root.is_empty(), prefix) {
            (true, None) => None,
            (true, Some(p)) => Some(Path::from(p)),
            (false, None) => Some(Path::from(self.root.as_str())),
            (false, Some(p)) => Some(self.path(p)),
        };
        let metas: Vec<_> = self.store.list(list_prefix.as_ref()).try_collect().await?;
        let strip = if self.root.is_empty() {
            String::new()
        } else {
            format!("{}/", self.root)
        };
        Ok(metas
            .into_iter()
            .map(|meta| {
                let location = meta.location.to_string();
                location
                    .strip_prefix(&strip)
                    .map(str::to_string)
                    .unwrap_or(location)
            })
            .collect())
    }
}
