//! 内存存储网关

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use super::{PresignedUrl, ProgressFn, RawMetadata, StorageError, StorageGateway, StoredObjectMeta};
use crate::transfer::{CHUNK_SIZE, chunk_ranges, percent};

const URL_PREFIX: &str = "memory://objects/";

/// 预签名 URL 有效期
const PRESIGN_TTL_MINUTES: i64 = 15;

#[derive(Default)]
pub struct MemoryGateway {
    objects: Mutex<BTreeMap<String, Bytes>>,
    metadata: Mutex<BTreeMap<String, Option<Value>>>,
    fail_uploads: AtomicBool,
    uploads: AtomicUsize,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// 之后的 `put_object` 都返回错误
    pub fn fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    /// 成功完成的 `put_object` 次数
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        lock(&self.objects).get(key).cloned()
    }

    pub fn object_count(&self) -> usize {
        lock(&self.objects).len()
    }

    pub fn insert_object(&self, key: &str, data: Bytes) {
        lock(&self.objects).insert(key.to_string(), data);
    }

    /// 直接写入原始元数据（可以是缺失或格式错误的记录）
    pub fn insert_raw_metadata(&self, key: &str, record: Option<Value>) {
        lock(&self.metadata).insert(key.to_string(), record);
    }

    fn key_from_url(url: &PresignedUrl) -> Result<String, StorageError> {
        if Utc::now() > url.expires_at {
            return Err(StorageError::Status {
                status: 403,
                message: "presigned url expired".to_string(),
            });
        }
        url.url
            .strip_prefix(URL_PREFIX)
            .map(ToString::to_string)
            .ok_or_else(|| StorageError::Request(format!("not a memory url: {}", url.url)))
    }

    fn presign(key: &str) -> PresignedUrl {
        PresignedUrl {
            url: format!("{URL_PREFIX}{key}"),
            expires_at: Utc::now() + Duration::minutes(PRESIGN_TTL_MINUTES),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl StorageGateway for MemoryGateway {
    async fn presign_upload(
        &self,
        key: &str,
        _content_type: &str,
    ) -> Result<PresignedUrl, StorageError> {
        Ok(Self::presign(key))
    }

    async fn presign_download(&self, key: &str) -> Result<PresignedUrl, StorageError> {
        Ok(Self::presign(key))
    }

    async fn put_object(
        &self,
        url: &PresignedUrl,
        _content_type: &str,
        data: Bytes,
        progress: ProgressFn<'_>,
    ) -> Result<(), StorageError> {
        let key = Self::key_from_url(url)?;
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(StorageError::Status {
                status: 503,
                message: "upload rejected".to_string(),
            });
        }

        let total = data.len() as u64;
        let mut sent = 0u64;
        for range in chunk_ranges(data.len(), CHUNK_SIZE) {
            sent += (range.end - range.start) as u64;
            progress(percent(sent, total));
        }
        if total == 0 {
            progress(100);
        }

        lock(&self.objects).insert(key, data);
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_object(&self, url: &PresignedUrl) -> Result<Bytes, StorageError> {
        let key = Self::key_from_url(url)?;
        lock(&self.objects)
            .get(&key)
            .cloned()
            .ok_or(StorageError::NotFound(key))
    }

    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        lock(&self.objects).remove(key);
        Ok(())
    }

    async fn put_metadata(&self, meta: &StoredObjectMeta) -> Result<(), StorageError> {
        let value = serde_json::to_value(meta).map_err(|e| StorageError::InvalidMetadata {
            key: meta.filename.clone(),
            message: e.to_string(),
        })?;
        lock(&self.metadata).insert(meta.filename.clone(), Some(value));
        Ok(())
    }

    async fn get_metadata(&self, filename: &str) -> Result<Option<StoredObjectMeta>, StorageError> {
        let record = lock(&self.metadata).get(filename).cloned();
        match record {
            None => Ok(None),
            Some(record) => RawMetadata {
                key: filename.to_string(),
                record,
            }
            .parse()
            .map(Some),
        }
    }

    async fn delete_metadata(&self, filename: &str) -> Result<(), StorageError> {
        lock(&self.metadata).remove(filename);
        Ok(())
    }

    async fn list_metadata_raw(&self) -> Result<Vec<RawMetadata>, StorageError> {
        Ok(lock(&self.metadata)
            .iter()
            .map(|(key, record)| RawMetadata {
                key: key.clone(),
                record: record.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::PreparedPayload;
    use std::sync::Mutex as StdMutex;

    #[tokio::test]
    async fn test_upload_then_download() {
        let gateway = MemoryGateway::new();
        let original = Bytes::from(b"fallback body ".repeat(10_000));
        let payload = PreparedPayload::prepare("doc.txt", "text/plain", original.clone()).unwrap();
        let seen = StdMutex::new(Vec::new());

        let meta = gateway
            .upload(&payload, &|p| seen.lock().unwrap().push(p))
            .await
            .unwrap();

        assert!(meta.filename.ends_with("-doc.txt"));
        assert!(meta.is_compressed);
        assert_eq!(meta.size, payload.data.len() as u64);
        assert_eq!(gateway.upload_count(), 1);
        assert_eq!(seen.lock().unwrap().last(), Some(&100));

        let stored = gateway.get_metadata(&meta.filename).await.unwrap().unwrap();
        assert_eq!(stored, meta);
        assert_eq!(gateway.download(&stored).await.unwrap(), original);
    }

    #[tokio::test]
    async fn test_failed_upload_writes_no_metadata() {
        let gateway = MemoryGateway::new();
        gateway.fail_uploads(true);
        let payload =
            PreparedPayload::prepare("a.zip", "application/zip", Bytes::from_static(b"zz")).unwrap();

        assert!(gateway.upload(&payload, &|_| {}).await.is_err());
        assert!(gateway.list_metadata().await.unwrap().is_empty());
        assert_eq!(gateway.upload_count(), 0);
    }

    #[tokio::test]
    async fn test_list_skips_malformed_records() {
        let gateway = MemoryGateway::new();
        gateway.insert_raw_metadata("broken", Some(serde_json::json!({"nope": true})));
        gateway.insert_raw_metadata("missing", None);
        gateway
            .put_metadata(&StoredObjectMeta {
                filename: "ok".to_string(),
                uploaded_at: Utc::now(),
                content_type: "text/plain".to_string(),
                size: 1,
                is_compressed: false,
            })
            .await
            .unwrap();

        let listed = gateway.list_metadata().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].filename, "ok");
    }

    #[tokio::test]
    async fn test_expired_url_is_rejected() {
        let gateway = MemoryGateway::new();
        let url = PresignedUrl {
            url: format!("{URL_PREFIX}x"),
            expires_at: Utc::now() - Duration::seconds(1),
        };
        assert!(matches!(
            gateway.get_object(&url).await,
            Err(StorageError::Status { status: 403, .. })
        ));
    }
}
