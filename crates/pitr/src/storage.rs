//! Binlog archive storage.
//!
//! The archive is a flat namespace of opaque segment blobs
//! (`binlog_<unixTs>_<suffix>`) with one `<name>-gtid-set` sidecar per
//! segment. Recovery only ever reads, so the [`BinlogStore`] trait exposes
//! exactly two operations: list and get.
//!
//! All providers go through the `object_store` crate behind a single
//! implementation:
//!
//! - **S3** - Amazon S3 and S3-compatible storage (MinIO et al.)
//! - **Azure** - Azure Blob Storage
//! - **Local** - filesystem backend, used by the tests

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::{ClientOptions, ObjectStore};
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::debug;
use url::Url;

use crate::error::{PitrError, Result};
use crate::types::SensitiveString;

/// Endpoint used when `BINLOG_S3_ENDPOINT` is unset or empty
pub const DEFAULT_S3_ENDPOINT: &str = "s3.amazonaws.com";

/// Read-only view of the binlog archive.
#[async_trait]
pub trait BinlogStore: Send + Sync {
    /// List object names starting with `prefix`, ascending lexicographically
    /// (segment names embed their unix timestamp, so this is archive order).
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Fetch one object as a byte stream
    async fn get(&self, name: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>>;
}

/// S3 settings (`BINLOG_S3_*` environment)
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Endpoint host or URL; empty means [`DEFAULT_S3_ENDPOINT`]
    pub endpoint: String,
    /// `s3://bucket/prefix`, `https://host/bucket/prefix` or `bucket/prefix`
    pub bucket_url: String,
    pub access_key_id: String,
    pub secret_access_key: SensitiveString,
    pub region: String,
}

/// Azure Blob settings (`BINLOG_AZURE_*` environment)
#[derive(Debug, Clone)]
pub struct AzureConfig {
    pub endpoint: String,
    /// `container/prefix`
    pub container_path: String,
    pub storage_account: String,
    pub access_key: SensitiveString,
}

/// Archive storage backend selection
#[derive(Debug, Clone)]
pub enum StorageConfig {
    S3(S3Config),
    Azure(AzureConfig),
    /// Filesystem-backed archive; test backend
    Local { root: PathBuf },
}

/// [`BinlogStore`] over any `object_store` provider
pub struct ObjectBinlogStore {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl ObjectBinlogStore {
    /// Build the provider client and bind it to the archive prefix.
    ///
    /// `verify_tls=false` disables certificate validation on the S3 client
    /// (self-signed MinIO deployments).
    pub fn open(config: &StorageConfig, verify_tls: bool) -> Result<Self> {
        match config {
            StorageConfig::S3(c) => Self::open_s3(c, verify_tls),
            StorageConfig::Azure(c) => Self::open_azure(c),
            StorageConfig::Local { root } => Self::open_local(root),
        }
    }

    fn open_s3(config: &S3Config, verify_tls: bool) -> Result<Self> {
        let (bucket, prefix) = parse_bucket_url(&config.bucket_url)?;

        let endpoint = if config.endpoint.is_empty() {
            DEFAULT_S3_ENDPOINT
        } else {
            config.endpoint.as_str()
        };
        let endpoint_url = if endpoint.contains("://") {
            endpoint.to_string()
        } else {
            format!("https://{endpoint}")
        };

        let mut client_options = ClientOptions::new();
        if !verify_tls {
            client_options = client_options.with_allow_invalid_certificates(true);
        }
        if endpoint_url.starts_with("http://") {
            client_options = client_options.with_allow_http(true);
        }

        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&bucket)
            .with_region(&config.region)
            .with_access_key_id(&config.access_key_id)
            .with_secret_access_key(config.secret_access_key.expose_secret())
            .with_client_options(client_options);
        if endpoint != DEFAULT_S3_ENDPOINT {
            // Custom endpoints are MinIO-style: path addressing, explicit URL.
            builder = builder
                .with_endpoint(&endpoint_url)
                .with_virtual_hosted_style_request(false);
        }

        let store = builder
            .build()
            .map_err(|e| PitrError::storage("create s3 client", e))?;
        Ok(Self {
            store: Arc::new(store),
            prefix,
        })
    }

    fn open_azure(config: &AzureConfig) -> Result<Self> {
        let (container, prefix) = split_container_path(&config.container_path);
        if container.is_empty() {
            return Err(PitrError::config(format!(
                "can't get container name from {:?}",
                config.container_path
            )));
        }

        let mut builder = MicrosoftAzureBuilder::new()
            .with_account(&config.storage_account)
            .with_container_name(container)
            .with_access_key(config.access_key.expose_secret());
        if !config.endpoint.is_empty() {
            builder = builder.with_endpoint(config.endpoint.clone());
        }

        let store = builder
            .build()
            .map_err(|e| PitrError::storage("create azure client", e))?;
        Ok(Self {
            store: Arc::new(store),
            prefix,
        })
    }

    fn open_local(root: &PathBuf) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let store = LocalFileSystem::new_with_prefix(root)
            .map_err(|e| PitrError::storage("create local store", e))?;
        Ok(Self {
            store: Arc::new(store),
            prefix: String::new(),
        })
    }

    fn object_path(&self, name: &str) -> ObjectPath {
        if self.prefix.is_empty() {
            ObjectPath::from(name)
        } else {
            ObjectPath::from(format!("{}{}", self.prefix, name))
        }
    }
}

#[async_trait]
impl BinlogStore for ObjectBinlogStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        // `object_store` prefixes are path-segment based and cannot match the
        // middle of a filename, so enumerate the archive directory and filter
        // on the object name.
        let base = (!self.prefix.is_empty())
            .then(|| ObjectPath::from(self.prefix.trim_end_matches('/')));
        let mut stream = self.store.list(base.as_ref());

        let mut names = Vec::new();
        while let Some(meta) = stream
            .try_next()
            .await
            .map_err(|e| PitrError::storage("list objects", e))?
        {
            let Some(name) = meta.location.filename() else {
                continue;
            };
            if name.starts_with(prefix) {
                names.push(name.to_string());
            }
        }
        names.sort();
        debug!(prefix, count = names.len(), "listed archive objects");
        Ok(names)
    }

    async fn get(&self, name: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let path = self.object_path(name);
        let result = self
            .store
            .get(&path)
            .await
            .map_err(|e| PitrError::storage(&format!("get object {name:?}"), e))?;
        let stream = result.into_stream().map_err(std::io::Error::other);
        Ok(Box::new(StreamReader::new(stream)))
    }
}

/// Split a bucket URL into bucket name and normalized prefix.
///
/// Accepts `s3://bucket/prefix`, `https://host/bucket/prefix` (the host is
/// the endpoint, not the bucket) and bare `bucket/prefix`. The prefix always
/// ends with `/` when non-empty.
pub fn parse_bucket_url(bucket_url: &str) -> Result<(String, String)> {
    if let Ok(url) = Url::parse(bucket_url) {
        if url.scheme() == "s3" {
            let bucket = url
                .host_str()
                .ok_or_else(|| {
                    PitrError::config(format!("can't get bucket name from {bucket_url:?}"))
                })?
                .to_string();
            let path = url.path().trim_matches('/');
            let prefix = if path.is_empty() {
                String::new()
            } else {
                format!("{path}/")
            };
            return Ok((bucket, prefix));
        }
        if matches!(url.scheme(), "http" | "https") {
            return split_bucket_path(url.path(), bucket_url);
        }
    }
    split_bucket_path(bucket_url, bucket_url)
}

fn split_bucket_path(path: &str, original: &str) -> Result<(String, String)> {
    let path = path.trim_matches('/');
    let (bucket, prefix) = match path.split_once('/') {
        Some((bucket, rest)) => (bucket, format!("{}/", rest.trim_end_matches('/'))),
        None => (path, String::new()),
    };
    if bucket.is_empty() {
        return Err(PitrError::config(format!(
            "can't get bucket name from {original:?}"
        )));
    }
    Ok((bucket.to_string(), prefix))
}

/// Split an Azure `container/prefix` path; the prefix always ends with `/`
/// when non-empty.
pub fn split_container_path(container_path: &str) -> (&str, String) {
    match container_path.split_once('/') {
        Some((container, rest)) => {
            let rest = rest.trim_end_matches('/');
            let prefix = if rest.is_empty() {
                String::new()
            } else {
                format!("{rest}/")
            };
            (container, prefix)
        }
        None => (container_path, String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn bucket_url_forms() {
        let cases = [
            ("operator-testing/test", "operator-testing", "test/"),
            ("s3://operator-testing/test", "operator-testing", "test/"),
            (
                "https://somedomain/operator-testing/test",
                "operator-testing",
                "test/",
            ),
            ("operator-testing/test/", "operator-testing", "test/"),
            (
                "operator-testing/test/pitr",
                "operator-testing",
                "test/pitr/",
            ),
            (
                "https://somedomain/operator-testing",
                "operator-testing",
                "",
            ),
            ("operator-testing", "operator-testing", ""),
        ];
        for (input, bucket, prefix) in cases {
            let (b, p) = parse_bucket_url(input).unwrap();
            assert_eq!(b, bucket, "bucket for {input:?}");
            assert_eq!(p, prefix, "prefix for {input:?}");
        }
    }

    #[test]
    fn bucket_url_without_bucket_is_rejected() {
        assert!(parse_bucket_url("").is_err());
        assert!(parse_bucket_url("https://somedomain/").is_err());
    }

    #[test]
    fn container_path_forms() {
        assert_eq!(split_container_path("container"), ("container", String::new()));
        assert_eq!(
            split_container_path("container/pitr"),
            ("container", "pitr/".to_string())
        );
        assert_eq!(
            split_container_path("container/a/b"),
            ("container", "a/b/".to_string())
        );
    }

    #[tokio::test]
    async fn local_store_lists_and_fetches() {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in [
            ("binlog_1000_aaa", "payload-a"),
            ("binlog_1000_aaa-gtid-set", "u:1-50"),
            ("binlog_2000_bbb", "payload-b"),
            ("unrelated.txt", "nope"),
        ] {
            std::fs::write(dir.path().join(name), content).unwrap();
        }

        let store = ObjectBinlogStore::open(
            &StorageConfig::Local {
                root: dir.path().to_path_buf(),
            },
            true,
        )
        .unwrap();

        let names = store.list("binlog_").await.unwrap();
        assert_eq!(
            names,
            vec!["binlog_1000_aaa", "binlog_1000_aaa-gtid-set", "binlog_2000_bbb"]
        );

        let mut content = String::new();
        store
            .get("binlog_1000_aaa-gtid-set")
            .await
            .unwrap()
            .read_to_string(&mut content)
            .await
            .unwrap();
        assert_eq!(content, "u:1-50");

        assert!(store.get("binlog_9999_zzz").await.is_err());
    }
}
