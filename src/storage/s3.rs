// Copyright (c) 2019 Jason White
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::Client;
use aws_smithy_types::byte_stream::ByteStream;
use futures::TryStreamExt;
use http_body_util::StreamBody;
use hyper::body::Frame;
use tokio_util::io::ReaderStream;

use super::{
    ObjectStorage, ObjectStream, StorageError, StorageKey, StorageOp,
    StoredObject,
};

/// Connection settings for an S3-compatible bucket.
#[derive(Debug, Clone, Default)]
pub struct S3Config {
    pub bucket: String,
    pub region: Option<String>,

    /// Custom endpoint for MinIO, R2 and friends.
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub force_path_style: bool,
}

/// Amazon S3 storage backend.
pub struct S3Storage {
    client: Client,

    /// Name of the bucket to use.
    bucket: String,
}

impl S3Storage {
    pub async fn new(config: S3Config) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        // Static keys from our own configuration take precedence over the
        // default provider chain.
        if let (Some(id), Some(secret)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            builder = builder.credentials_provider(Credentials::new(
                id, secret, None, None, "lfs-gateway",
            ));
        }

        tracing::info!(
            bucket = %config.bucket,
            region = %sdk_config
                .region()
                .map(|r| r.as_ref())
                .unwrap_or("default"),
            endpoint = config.endpoint.as_deref().unwrap_or("aws"),
            "configured S3 storage"
        );

        S3Storage {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket,
        }
    }
}

fn presigning(ttl: Duration) -> Result<PresigningConfig, StorageError> {
    PresigningConfig::expires_in(ttl)
        .map_err(|e| StorageError::new(StorageOp::Presign, e))
}

#[async_trait]
impl ObjectStorage for S3Storage {
    async fn put(
        &self,
        key: &StorageKey,
        stream: ObjectStream,
        len: u64,
    ) -> Result<(), StorageError> {
        // The body is hashed on the way through, so the payload itself is
        // sent unsigned rather than buffered for SigV4.
        let body = ByteStream::from_body_1_x(StreamBody::new(
            stream.map_ok(Frame::data),
        ));

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .content_length(len as i64)
            .content_type("application/octet-stream")
            .body(body)
            .customize()
            .disable_payload_signing()
            .send()
            .await
            .map_err(|e| {
                StorageError::new(StorageOp::Put, DisplayErrorContext(&e))
            })?;

        Ok(())
    }

    async fn get(
        &self,
        key: &StorageKey,
    ) -> Result<Option<StoredObject>, StorageError> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await;

        match resp {
            Ok(output) => {
                let len = output.content_length().unwrap_or_default().max(0);
                let reader = output.body.into_async_read();
                Ok(Some(StoredObject {
                    len: len as u64,
                    stream: Box::pin(ReaderStream::new(reader)),
                }))
            }
            Err(SdkError::ServiceError(e)) if e.err().is_no_such_key() => {
                Ok(None)
            }
            Err(e) => {
                Err(StorageError::new(StorageOp::Get, DisplayErrorContext(&e)))
            }
        }
    }

    async fn size(
        &self,
        key: &StorageKey,
    ) -> Result<Option<u64>, StorageError> {
        let resp = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await;

        match resp {
            Ok(output) => {
                let len = output.content_length().unwrap_or_default();
                Ok(Some(len.max(0) as u64))
            }
            Err(SdkError::ServiceError(e)) if e.err().is_not_found() => {
                Ok(None)
            }
            Err(e) => {
                Err(StorageError::new(StorageOp::Head, DisplayErrorContext(&e)))
            }
        }
    }

    async fn delete(&self, key: &StorageKey) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await
            .map_err(|e| {
                StorageError::new(StorageOp::Delete, DisplayErrorContext(&e))
            })?;

        Ok(())
    }

    async fn head_bucket(&self) -> Result<(), StorageError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| {
                StorageError::new(
                    StorageOp::HeadBucket,
                    DisplayErrorContext(&e),
                )
            })?;

        Ok(())
    }

    async fn presign_put(
        &self,
        key: &StorageKey,
        ttl: Duration,
    ) -> Result<String, StorageError> {
        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .presigned(presigning(ttl)?)
            .await
            .map_err(|e| {
                StorageError::new(StorageOp::Presign, DisplayErrorContext(&e))
            })?;

        Ok(presigned.uri().to_string())
    }

    async fn presign_get(
        &self,
        key: &StorageKey,
        ttl: Duration,
    ) -> Result<String, StorageError> {
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .presigned(presigning(ttl)?)
            .await
            .map_err(|e| {
                StorageError::new(StorageOp::Presign, DisplayErrorContext(&e))
            })?;

        Ok(presigned.uri().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::generate_storage_key;

    fn storage() -> impl std::future::Future<Output = S3Storage> {
        S3Storage::new(S3Config {
            bucket: "lfs".into(),
            region: Some("us-east-1".into()),
            endpoint: Some("http://127.0.0.1:9000".into()),
            access_key_id: Some("minio".into()),
            secret_access_key: Some("minio123".into()),
            force_path_style: true,
        })
    }

    #[tokio::test]
    async fn presigned_urls_use_path_style_keys() {
        let storage = storage().await;
        let key = generate_storage_key(&"ab".repeat(32), "sha256").unwrap();

        let url = storage
            .presign_get(&key, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(url.starts_with(&format!(
            "http://127.0.0.1:9000/lfs/{}?",
            key.as_str()
        )));
        assert!(url.contains("X-Amz-Expires=60"));

        let url = storage
            .presign_put(&key, Duration::from_secs(900))
            .await
            .unwrap();
        assert!(url.contains("X-Amz-Expires=900"));
    }

    #[tokio::test]
    async fn presign_ttl_is_bounded() {
        let storage = storage().await;
        let key = generate_storage_key("abcd", "sha256").unwrap();
        let err = storage
            .presign_get(&key, Duration::from_secs(8 * 24 * 60 * 60))
            .await
            .unwrap_err();
        assert_eq!(err.operation, StorageOp::Presign);
    }
}
