//! 存储网关（回退路径）
//!
//! 网关本身是外部服务，这里只定义它的接口 [`StorageGateway`]，以及:
//! - [`HttpGateway`]: 通过 HTTP 访问网关
//! - [`MemoryGateway`]: 内存实现，用于测试和本地演示
//! - [`sweep_expired`]: 保留期清理算法

pub mod http;
pub mod memory;
pub mod sweep;

pub use http::HttpGateway;
pub use memory::MemoryGateway;
pub use sweep::{RETENTION_DAYS, SweepReport, sweep_expired};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::ShareError;
use crate::transfer::{PreparedPayload, decompress};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("gateway request failed: {0}")]
    Request(String),
    #[error("gateway returned status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid metadata for {key}: {message}")]
    InvalidMetadata { key: String, message: String },
}

/// 存储对象的元数据记录，以文件名为键
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredObjectMeta {
    pub filename: String,
    pub uploaded_at: DateTime<Utc>,
    pub content_type: String,
    pub size: u64,
    pub is_compressed: bool,
}

/// 带时限的预签名 URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// 未解析的元数据记录，`record` 为空或格式错误时由调用方跳过
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMetadata {
    pub key: String,
    pub record: Option<Value>,
}

impl RawMetadata {
    pub fn parse(&self) -> Result<StoredObjectMeta, StorageError> {
        let record = self
            .record
            .clone()
            .ok_or_else(|| StorageError::InvalidMetadata {
                key: self.key.clone(),
                message: "missing record".to_string(),
            })?;
        serde_json::from_value(record).map_err(|e| StorageError::InvalidMetadata {
            key: self.key.clone(),
            message: e.to_string(),
        })
    }
}

/// 进度回调，参数为 0-100
pub type ProgressFn<'a> = &'a (dyn Fn(u8) + Send + Sync);

/// 为上传生成不会冲突的对象名
pub fn object_key(name: &str, now: DateTime<Utc>) -> String {
    format!("{}-{}", now.timestamp_millis(), name)
}

/// 存储网关接口
#[async_trait]
pub trait StorageGateway: Send + Sync {
    async fn presign_upload(&self, key: &str, content_type: &str)
    -> Result<PresignedUrl, StorageError>;

    async fn presign_download(&self, key: &str) -> Result<PresignedUrl, StorageError>;

    /// 向预签名 URL 上传对象内容，按块报告进度
    async fn put_object(
        &self,
        url: &PresignedUrl,
        content_type: &str,
        data: Bytes,
        progress: ProgressFn<'_>,
    ) -> Result<(), StorageError>;

    async fn get_object(&self, url: &PresignedUrl) -> Result<Bytes, StorageError>;

    async fn delete_object(&self, key: &str) -> Result<(), StorageError>;

    async fn put_metadata(&self, meta: &StoredObjectMeta) -> Result<(), StorageError>;

    async fn get_metadata(&self, filename: &str) -> Result<Option<StoredObjectMeta>, StorageError>;

    async fn delete_metadata(&self, filename: &str) -> Result<(), StorageError>;

    async fn list_metadata_raw(&self) -> Result<Vec<RawMetadata>, StorageError>;

    /// 列出所有可解析的元数据，格式错误的记录记日志后跳过
    async fn list_metadata(&self) -> Result<Vec<StoredObjectMeta>, StorageError> {
        let raw = self.list_metadata_raw().await?;
        Ok(raw
            .iter()
            .filter_map(|entry| match entry.parse() {
                Ok(meta) => Some(meta),
                Err(e) => {
                    warn!("Skipping metadata record: {}", e);
                    None
                }
            })
            .collect())
    }

    /// 完整上传流程: 预签名 PUT，上传内容，写入元数据
    async fn upload(
        &self,
        payload: &PreparedPayload,
        progress: ProgressFn<'_>,
    ) -> Result<StoredObjectMeta, StorageError> {
        let descriptor = &payload.descriptor;
        let now = Utc::now();
        let key = object_key(&descriptor.name, now);

        let url = self.presign_upload(&key, &descriptor.mime_type).await?;
        self.put_object(&url, &descriptor.mime_type, payload.data.clone(), progress)
            .await?;

        let meta = StoredObjectMeta {
            filename: key,
            uploaded_at: now,
            content_type: descriptor.mime_type.clone(),
            size: descriptor.size,
            is_compressed: descriptor.is_compressed,
        };
        self.put_metadata(&meta).await?;
        Ok(meta)
    }

    /// 按元数据下载对象，必要时解压
    async fn download(&self, meta: &StoredObjectMeta) -> Result<Bytes, ShareError> {
        let url = self.presign_download(&meta.filename).await?;
        let data = self.get_object(&url).await?;
        if meta.is_compressed {
            Ok(Bytes::from(decompress(&data)?))
        } else {
            Ok(data)
        }
    }
}
