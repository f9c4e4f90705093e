//! S3-compatible durable store

use async_trait::async_trait;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use tracing::{debug, info};

use super::DurableStore;
use crate::error::{Error, Result};

/// Configuration for [`S3DurableStore`]
#[derive(Debug, Clone, Default)]
pub struct S3DurableStoreConfig {
    /// Bucket holding originals
    pub bucket: String,
    /// Custom endpoint (MinIO, R2, LocalStack)
    pub endpoint_url: Option<String>,
    /// Region; defaults to the provider chain
    pub region: Option<String>,
    /// Static access key; the default credential chain is used when absent
    pub access_key_id: Option<String>,
    /// Static secret key
    pub secret_access_key: Option<String>,
    /// Use `bucket.host` addressing instead of `host/bucket`
    pub virtual_hosted_style: bool,
}

impl S3DurableStoreConfig {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            ..Default::default()
        }
    }

    pub fn with_endpoint_url(mut self, endpoint_url: impl Into<String>) -> Self {
        self.endpoint_url = Some(endpoint_url.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_credentials(
        mut self,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Self {
        self.access_key_id = Some(access_key_id.into());
        self.secret_access_key = Some(secret_access_key.into());
        self
    }
}

/// Durable store on S3 or an S3-compatible service
pub struct S3DurableStore {
    client: Client,
    bucket: String,
}

impl S3DurableStore {
    /// Build a client from the configuration
    pub async fn new(config: S3DurableStoreConfig) -> Result<Self> {
        if config.bucket.is_empty() {
            return Err(Error::Config("S3 bucket name is required".to_string()));
        }

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());

        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint_url) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint_url);
        }
        if let (Some(access_key_id), Some(secret_access_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            loader = loader.credentials_provider(Credentials::new(
                access_key_id.clone(),
                secret_access_key.clone(),
                None,
                None,
                "inkcache-static",
            ));
        }

        let sdk_config = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(!config.virtual_hosted_style)
            .build();

        info!(
            "S3 durable store ready (bucket: {}, endpoint: {})",
            config.bucket,
            config.endpoint_url.as_deref().unwrap_or("default")
        );

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket,
        })
    }
}

fn is_not_found<E>(err: &SdkError<E>) -> bool {
    matches!(err, SdkError::ServiceError(e) if e.raw().status().as_u16() == 404)
}

/// Wrap an upload body without copying it
fn request_body(data: Bytes) -> ByteStream {
    ByteStream::from(data)
}

fn map_sdk_error<E: std::fmt::Debug>(key: &str, err: SdkError<E>) -> Error {
    Error::DurableStore {
        key: key.to_string(),
        reason: format!("{:?}", err),
    }
}

#[async_trait]
impl DurableStore for S3DurableStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let size = data.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(request_body(data))
            .send()
            .await
            .map_err(|err| map_sdk_error(key, err))?;

        debug!("Stored {} ({} bytes) in bucket {}", key, size, self.bucket);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) if is_not_found(&err) => return Ok(None),
            Err(err) => return Err(map_sdk_error(key, err)),
        };

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| Error::DurableStore {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Some(body.into_bytes()))
    }

    fn name(&self) -> &'static str {
        "s3"
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builders() {
        let config = S3DurableStoreConfig::new("pages")
            .with_endpoint_url("http://localhost:9000")
            .with_region("auto")
            .with_credentials("key", "secret");

        assert_eq!(config.bucket, "pages");
        assert_eq!(config.endpoint_url.as_deref(), Some("http://localhost:9000"));
        assert_eq!(config.region.as_deref(), Some("auto"));
        assert_eq!(config.access_key_id.as_deref(), Some("key"));
        assert!(!config.virtual_hosted_style);
    }

    #[test]
    fn test_request_body_shares_the_upload_buffer() {
        let data = Bytes::from(vec![7u8; 64 * 1024]);
        let body = request_body(data.clone());

        let shared = body.bytes().unwrap();
        assert_eq!(shared.len(), data.len());
        assert_eq!(shared.as_ptr(), data.as_ptr());
    }

    #[tokio::test]
    async fn test_empty_bucket_rejected() {
        let result = S3DurableStore::new(S3DurableStoreConfig::default()).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
