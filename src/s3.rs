//! Thin seam between this crate's GC logic and the remote object store.
//! `S3ObjectStore` wraps `aws-sdk-s3`; `FakeObjectStore` (test-only) backs
//! the same trait with an in-memory map so the rest of the crate can be
//! exercised without a real bucket.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::Credentials;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::{Result, S3GcError};

#[derive(Debug, Clone, Copy)]
pub struct ObjectMeta {
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync + Debug {
    async fn get(&self, key: &str) -> Result<Bytes>;
    async fn put(&self, key: &str, body: Bytes) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// `Ok(None)` means the key does not exist; distinct from an error.
    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>>;
    /// Lists every key under `prefix`, paginating internally.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Convenience wrapper over [`ObjectStore::head`] for callers that only
    /// need the size.
    async fn head_size(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.head(key).await?.map(|m| m.size))
    }
}

pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    list_batch_size: i32,
    timeout: Duration,
}

impl Debug for S3ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3ObjectStore").field("bucket", &self.bucket).finish()
    }
}

impl S3ObjectStore {
    pub async fn new(config: &crate::config::Config) -> Result<Self> {
        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::v2023_11_09())
            .region(Region::new(config.region.clone()))
            .force_path_style(config.s3_force_path_style);

        if let Some(endpoint) = &config.s3_endpoint_url {
            builder = builder.endpoint_url(endpoint.clone());
        }

        if let (Ok(key_id), Ok(secret)) = (
            std::env::var("AWS_ACCESS_KEY_ID"),
            std::env::var("AWS_SECRET_ACCESS_KEY"),
        ) {
            builder = builder.credentials_provider(Credentials::new(
                key_id,
                secret,
                std::env::var("AWS_SESSION_TOKEN").ok(),
                None,
                "s3gc-env",
            ));
        }

        let client = aws_sdk_s3::Client::from_conf(builder.build());

        Ok(S3ObjectStore {
            client,
            bucket: config.bucket.clone(),
            list_batch_size: config.s3_list_batch_size,
            timeout: config.operation_timeout,
        })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get(&self, key: &str) -> Result<Bytes> {
        let output = tokio::time::timeout(
            self.timeout,
            self.client.get_object().bucket(&self.bucket).key(key).send(),
        )
        .await
        .map_err(|_| S3GcError::ObjectStore(format!("get_object timed out for {key}")))?
        .map_err(|e| S3GcError::ObjectStore(e.to_string()))?;

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| S3GcError::ObjectStore(e.to_string()))?
            .into_bytes();
        Ok(bytes)
    }

    #[tracing::instrument(level = "debug", skip(self, body))]
    async fn put(&self, key: &str, body: Bytes) -> Result<()> {
        tokio::time::timeout(
            self.timeout,
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(body.into())
                .send(),
        )
        .await
        .map_err(|_| S3GcError::ObjectStore(format!("put_object timed out for {key}")))?
        .map_err(|e| S3GcError::ObjectStore(e.to_string()))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete(&self, key: &str) -> Result<()> {
        tokio::time::timeout(
            self.timeout,
            self.client.delete_object().bucket(&self.bucket).key(key).send(),
        )
        .await
        .map_err(|_| S3GcError::ObjectStore(format!("delete_object timed out for {key}")))?
        .map_err(|e| S3GcError::ObjectStore(e.to_string()))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>> {
        let result = tokio::time::timeout(
            self.timeout,
            self.client.head_object().bucket(&self.bucket).key(key).send(),
        )
        .await
        .map_err(|_| S3GcError::ObjectStore(format!("head_object timed out for {key}")))?;

        match result {
            Ok(output) => {
                let size = output.content_length().unwrap_or(0) as u64;
                let last_modified = output
                    .last_modified()
                    .and_then(|dt| DateTime::from_timestamp(dt.secs(), 0))
                    .unwrap_or_else(Utc::now);
                Ok(Some(ObjectMeta { size, last_modified }))
            }
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_not_found() {
                    Ok(None)
                } else {
                    Err(S3GcError::ObjectStore(service_err.to_string()))
                }
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .max_keys(self.list_batch_size);
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let output = tokio::time::timeout(self.timeout, request.send())
                .await
                .map_err(|_| S3GcError::ObjectStore("list_objects_v2 timed out".to_string()))?
                .map_err(|e| S3GcError::ObjectStore(e.to_string()))?;

            for object in output.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }

            if output.is_truncated().unwrap_or(false) {
                continuation_token = output.next_continuation_token().map(String::from);
            } else {
                break;
            }
        }

        Ok(keys)
    }
}

#[cfg(test)]
pub struct FakeObjectStore {
    objects: tokio::sync::Mutex<std::collections::HashMap<String, (Bytes, DateTime<Utc>)>>,
}

#[cfg(test)]
impl Debug for FakeObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeObjectStore").finish()
    }
}

#[cfg(test)]
impl FakeObjectStore {
    pub fn new() -> Self {
        FakeObjectStore { objects: tokio::sync::Mutex::new(std::collections::HashMap::new()) }
    }

    pub async fn seed(&self, key: &str, body: Bytes) {
        self.objects.lock().await.insert(key.to_string(), (body, Utc::now()));
    }

    pub async fn seed_with_age(&self, key: &str, body: Bytes, last_modified: DateTime<Utc>) {
        self.objects.lock().await.insert(key.to_string(), (body, last_modified));
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.objects.lock().await.contains_key(key)
    }
}

#[cfg(test)]
#[async_trait]
impl ObjectStore for FakeObjectStore {
    async fn get(&self, key: &str) -> Result<Bytes> {
        self.objects
            .lock()
            .await
            .get(key)
            .map(|(b, _)| b.clone())
            .ok_or_else(|| S3GcError::ObjectStore(format!("no such key: {key}")))
    }

    async fn put(&self, key: &str, body: Bytes) -> Result<()> {
        self.objects.lock().await.insert(key.to_string(), (body, Utc::now()));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.lock().await.remove(key);
        Ok(())
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>> {
        Ok(self
            .objects
            .lock()
            .await
            .get(key)
            .map(|(b, lm)| ObjectMeta { size: b.len() as u64, last_modified: *lm }))
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .lock()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_store_round_trips_put_get_delete() {
        let store = FakeObjectStore::new();
        store.put("a.jpg", Bytes::from_static(b"data")).await.unwrap();
        assert_eq!(store.get("a.jpg").await.unwrap(), Bytes::from_static(b"data"));
        assert_eq!(store.head_size("a.jpg").await.unwrap(), Some(4));

        store.delete("a.jpg").await.unwrap();
        assert!(store.get("a.jpg").await.is_err());
        assert_eq!(store.head_size("a.jpg").await.unwrap(), None);
    }

    #[tokio::test]
    async fn fake_store_lists_by_prefix() {
        let store = FakeObjectStore::new();
        store.put("avatars/a.jpg", Bytes::new()).await.unwrap();
        store.put("avatars/b.jpg", Bytes::new()).await.unwrap();
        store.put("docs/c.txt", Bytes::new()).await.unwrap();

        let mut keys = store.list_keys("avatars/").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["avatars/a.jpg", "avatars/b.jpg"]);
    }
}
