use crate::config::S3Config;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors surfaced by object store adapters
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("object storage is disabled")]
    Disabled,

    #[error("{0} deadline exceeded")]
    DeadlineExceeded(&'static str),

    #[error("object store backend error: {0}")]
    Backend(String),
}

/// A URL the client may PUT to before `expires_at`
#[derive(Debug, Clone, Serialize)]
pub struct PresignedPut {
    pub url: String,
    /// Headers the client must send verbatim (never includes `host`)
    pub signed_headers: BTreeMap<String, String>,
    pub expires_at: DateTime<Utc>,
}

/// Result of a HEAD request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub size_bytes: i64,
    pub mime_type: String,
}

/// Object body plus its stored content type
#[derive(Debug, Clone)]
pub struct ObjectData {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// S3-shaped storage used by uploads, moderation and the optimizer
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn presign_put(&self, key: &str, content_type: &str) -> Result<PresignedPut, StoreError>;

    async fn head(&self, key: &str) -> Result<ObjectInfo, StoreError>;

    async fn get(&self, key: &str) -> Result<ObjectData, StoreError>;

    /// Unconditional overwrite
    async fn put(&self, key: &str, content_type: &str, bytes: Vec<u8>) -> Result<(), StoreError>;

    /// Idempotent; deleting a missing key succeeds
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    fn public_url(&self, key: &str) -> Result<String, StoreError>;
}

/// Trim leading slashes and reject empty keys
pub fn normalize_key(key: &str) -> Result<&str, StoreError> {
    let trimmed = key.trim().trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(StoreError::InvalidArgument("object key is empty".to_string()));
    }
    Ok(trimmed)
}

/// Accept `host[:port]` or full URLs; default to HTTPS and drop trailing slashes
pub fn normalize_endpoint(endpoint: &str) -> Option<String> {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        Some(trimmed.to_string())
    } else {
        Some(format!("https://{trimmed}"))
    }
}

/// Addressing rules needed to derive public URLs
#[derive(Debug, Clone)]
pub struct PublicUrlBuilder {
    bucket: String,
    region: String,
    endpoint: Option<String>,
    public_base_url: Option<String>,
    force_path_style: bool,
}

impl PublicUrlBuilder {
    pub fn from_config(config: &S3Config) -> Self {
        Self {
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            endpoint: config.endpoint_url.as_deref().and_then(normalize_endpoint),
            public_base_url: config
                .public_base_url
                .as_deref()
                .and_then(normalize_endpoint),
            force_path_style: config.force_path_style,
        }
    }

    pub fn url(&self, key: &str) -> Result<String, StoreError> {
        let key = normalize_key(key)?;

        if let Some(ref base) = self.public_base_url {
            return Ok(format!("{base}/{key}"));
        }

        match self.endpoint {
            Some(ref endpoint) if self.force_path_style => {
                Ok(format!("{endpoint}/{bucket}/{key}", bucket = self.bucket))
            }
            Some(ref endpoint) => {
                let (scheme, host) = endpoint
                    .split_once("://")
                    .unwrap_or(("https", endpoint.as_str()));
                Ok(format!("{scheme}://{bucket}.{host}/{key}", bucket = self.bucket))
            }
            None => Ok(format!(
                "https://{bucket}.s3.{region}.amazonaws.com/{key}",
                bucket = self.bucket,
                region = self.region
            )),
        }
    }
}

/// Object store backed by an S3-compatible service
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    presign_ttl: Duration,
    op_timeout: Duration,
    urls: PublicUrlBuilder,
}

impl S3ObjectStore {
    /// Create a new S3 object store
    pub async fn new(config: &S3Config, op_timeout: Duration) -> Result<Self, StoreError> {
        if config.bucket.trim().is_empty() {
            return Err(StoreError::InvalidArgument("s3.bucket is empty".to_string()));
        }

        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Custom endpoint for MinIO/R2
        if let Some(endpoint_url) = config.endpoint_url.as_deref().and_then(normalize_endpoint) {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            path_style = config.force_path_style,
            "S3 object store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            presign_ttl: config.presign_ttl(),
            op_timeout,
            urls: PublicUrlBuilder::from_config(config),
        })
    }

    async fn deadline<T, F>(&self, op: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.op_timeout, fut)
            .await
            .map_err(|_| StoreError::DeadlineExceeded(op))?
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn presign_put(&self, key: &str, content_type: &str) -> Result<PresignedPut, StoreError> {
        let key = normalize_key(key)?;
        let presigning_config = PresigningConfig::expires_in(self.presign_ttl)
            .map_err(|e| StoreError::InvalidArgument(format!("invalid presign ttl: {e}")))?;

        let presigned = self
            .deadline("presign", async {
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .content_type(content_type)
                    .presigned(presigning_config)
                    .await
                    .map_err(|e| StoreError::Backend(format!("presign failed: {e}")))
            })
            .await?;

        let signed_headers = presigned
            .headers()
            .filter(|(name, _)| !name.eq_ignore_ascii_case("host"))
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();

        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.presign_ttl).unwrap_or(chrono::Duration::zero());

        debug!(key = %key, "Presigned PUT generated");

        Ok(PresignedPut {
            url: presigned.uri().to_string(),
            signed_headers,
            expires_at,
        })
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn head(&self, key: &str) -> Result<ObjectInfo, StoreError> {
        let key = normalize_key(key)?;

        self.deadline("head", async {
            match self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
            {
                Ok(output) => Ok(ObjectInfo {
                    size_bytes: output.content_length().unwrap_or(0),
                    mime_type: output.content_type().unwrap_or_default().to_string(),
                }),
                Err(e) => {
                    if e.as_service_error()
                        .map(|e| e.is_not_found())
                        .unwrap_or(false)
                    {
                        Err(StoreError::NotFound(key.to_string()))
                    } else {
                        Err(StoreError::Backend(format!("head failed: {e}")))
                    }
                }
            }
        })
        .await
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn get(&self, key: &str) -> Result<ObjectData, StoreError> {
        let key = normalize_key(key)?;

        self.deadline("get", async {
            let output = match self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
            {
                Ok(output) => output,
                Err(e) => {
                    return if e
                        .as_service_error()
                        .map(|e| e.is_no_such_key())
                        .unwrap_or(false)
                    {
                        Err(StoreError::NotFound(key.to_string()))
                    } else {
                        Err(StoreError::Backend(format!("get failed: {e}")))
                    };
                }
            };

            let mime_type = output.content_type().unwrap_or_default().to_string();
            let bytes = output
                .body
                .collect()
                .await
                .map_err(|e| StoreError::Backend(format!("reading body failed: {e}")))?
                .into_bytes()
                .to_vec();

            Ok(ObjectData { bytes, mime_type })
        })
        .await
    }

    #[instrument(skip(self, bytes), fields(bucket = %self.bucket, size_bytes = bytes.len()))]
    async fn put(&self, key: &str, content_type: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let key = normalize_key(key)?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StoreError::Backend(format!("put failed: {e}")))?;

        debug!(key = %key, "Object stored");
        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let key = normalize_key(key)?;

        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => {}
            Err(e) => {
                // Some S3-compatible backends answer 404 instead of 204
                let missing = e
                    .raw_response()
                    .map(|r| r.status().as_u16() == 404)
                    .unwrap_or(false);
                if !missing {
                    return Err(StoreError::Backend(format!("delete failed: {e}")));
                }
            }
        }

        debug!(key = %key, "Object deleted");
        Ok(())
    }

    fn public_url(&self, key: &str) -> Result<String, StoreError> {
        self.urls.url(key)
    }
}

/// Stand-in used when object storage is switched off
pub struct DisabledObjectStore;

#[async_trait]
impl ObjectStore for DisabledObjectStore {
    async fn presign_put(&self, _key: &str, _content_type: &str) -> Result<PresignedPut, StoreError> {
        Err(StoreError::Disabled)
    }

    async fn head(&self, _key: &str) -> Result<ObjectInfo, StoreError> {
        Err(StoreError::Disabled)
    }

    async fn get(&self, _key: &str) -> Result<ObjectData, StoreError> {
        Err(StoreError::Disabled)
    }

    async fn put(&self, _key: &str, _content_type: &str, _bytes: Vec<u8>) -> Result<(), StoreError> {
        Err(StoreError::Disabled)
    }

    async fn delete(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::Disabled)
    }

    fn public_url(&self, _key: &str) -> Result<String, StoreError> {
        Err(StoreError::Disabled)
    }
}

/// S3 store when enabled, otherwise the disabled stand-in
pub async fn from_config(
    config: &S3Config,
    op_timeout: Duration,
) -> Result<Arc<dyn ObjectStore>, StoreError> {
    if !config.enabled {
        warn!("Object storage disabled; photo endpoints will fail");
        return Ok(Arc::new(DisabledObjectStore));
    }
    Ok(Arc::new(S3ObjectStore::new(config, op_timeout).await?))
}

#[cfg(any(test, feature = "test-support"))]
pub mod memory {
    //! In-process object store for tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    pub struct MemoryObjectStore {
        objects: Mutex<HashMap<String, ObjectData>>,
        public_base: String,
    }

    impl MemoryObjectStore {
        pub fn new() -> Self {
            Self {
                objects: Mutex::new(HashMap::new()),
                public_base: "https://cdn.test".to_string(),
            }
        }

        pub fn insert(&self, key: &str, mime_type: &str, bytes: Vec<u8>) {
            self.objects.lock().unwrap().insert(
                key.trim_start_matches('/').to_string(),
                ObjectData {
                    bytes,
                    mime_type: mime_type.to_string(),
                },
            );
        }

        pub fn object(&self, key: &str) -> Option<ObjectData> {
            self.objects.lock().unwrap().get(key).cloned()
        }

        pub fn contains(&self, key: &str) -> bool {
            self.objects.lock().unwrap().contains_key(key)
        }

        pub fn keys(&self) -> Vec<String> {
            let mut keys: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
            keys.sort();
            keys
        }
    }

    impl Default for MemoryObjectStore {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryObjectStore {
        async fn presign_put(&self, key: &str, content_type: &str) -> Result<PresignedPut, StoreError> {
            let key = normalize_key(key)?;
            let mut signed_headers = BTreeMap::new();
            signed_headers.insert("content-type".to_string(), content_type.to_string());
            Ok(PresignedPut {
                url: format!("{}/{key}?X-Amz-Signature=test", self.public_base),
                signed_headers,
                expires_at: Utc::now() + chrono::Duration::minutes(15),
            })
        }

        async fn head(&self, key: &str) -> Result<ObjectInfo, StoreError> {
            let key = normalize_key(key)?;
            self.objects
                .lock()
                .unwrap()
                .get(key)
                .map(|o| ObjectInfo {
                    size_bytes: o.bytes.len() as i64,
                    mime_type: o.mime_type.clone(),
                })
                .ok_or_else(|| StoreError::NotFound(key.to_string()))
        }

        async fn get(&self, key: &str) -> Result<ObjectData, StoreError> {
            let key = normalize_key(key)?;
            self.objects
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(key.to_string()))
        }

        async fn put(&self, key: &str, content_type: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
            let key = normalize_key(key)?;
            self.insert(key, content_type, bytes);
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            let key = normalize_key(key)?;
            self.objects.lock().unwrap().remove(key);
            Ok(())
        }

        fn public_url(&self, key: &str) -> Result<String, StoreError> {
            Ok(format!("{}/{}", self.public_base, normalize_key(key)?))
        }
    }
}
