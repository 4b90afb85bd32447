//! HTTP 存储网关客户端
//!
//! 网关接口:
//! - `POST {base}/api/presign/upload` `{key, contentType}` → [`PresignedUrl`]
//! - `POST {base}/api/presign/download` `{key}` → [`PresignedUrl`]
//! - `GET|PUT|DELETE {base}/api/metadata/{filename}`
//! - `GET {base}/api/metadata` → `[{key, record}]`
//! - `DELETE {base}/api/objects/{key}`

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use log::{debug, info};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use serde_json::json;
use tokio::sync::mpsc;
use url::Url;

use super::{PresignedUrl, ProgressFn, RawMetadata, StorageError, StorageGateway, StoredObjectMeta};
use crate::transfer::{CHUNK_SIZE, chunk_ranges, percent};

pub struct HttpGateway {
    base: Url,
    client: Client,
}

impl HttpGateway {
    pub fn new(base_url: &str) -> Result<Self, StorageError> {
        let base = Url::parse(base_url).map_err(|e| StorageError::Request(e.to_string()))?;
        Ok(Self {
            base,
            client: Client::new(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, StorageError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| StorageError::Request(format!("invalid gateway base url {}", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn presign(&self, kind: &str, body: serde_json::Value) -> Result<PresignedUrl, StorageError> {
        let url = self.endpoint(&["api", "presign", kind])?;
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;
        check(response)
            .await?
            .json()
            .await
            .map_err(request_error)
    }
}

fn request_error(e: reqwest::Error) -> StorageError {
    StorageError::Request(e.to_string())
}

async fn check(response: Response) -> Result<Response, StorageError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(StorageError::Status {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl StorageGateway for HttpGateway {
    async fn presign_upload(
        &self,
        key: &str,
        content_type: &str,
    ) -> Result<PresignedUrl, StorageError> {
        self.presign("upload", json!({ "key": key, "contentType": content_type }))
            .await
    }

    async fn presign_download(&self, key: &str) -> Result<PresignedUrl, StorageError> {
        self.presign("download", json!({ "key": key })).await
    }

    async fn put_object(
        &self,
        url: &PresignedUrl,
        content_type: &str,
        data: Bytes,
        progress: ProgressFn<'_>,
    ) -> Result<(), StorageError> {
        let total = data.len() as u64;
        let chunks: Vec<Bytes> = chunk_ranges(data.len(), CHUNK_SIZE)
            .map(|r| data.slice(r))
            .collect();

        // 请求体在发送时逐块拉取，通过通道把已发送字节数带回来
        let (sent_tx, mut sent_rx) = mpsc::unbounded_channel::<u64>();
        let body = reqwest::Body::wrap_stream(stream::iter(chunks.into_iter().map(move |chunk| {
            let _ = sent_tx.send(chunk.len() as u64);
            Ok::<Bytes, std::io::Error>(chunk)
        })));

        let request = self
            .client
            .put(&url.url)
            .header(CONTENT_TYPE, content_type)
            .header(CONTENT_LENGTH, total)
            .body(body)
            .send();
        tokio::pin!(request);

        let mut sent: u64 = 0;
        let response = loop {
            tokio::select! {
                result = &mut request => break result,
                Some(n) = sent_rx.recv() => {
                    sent += n;
                    progress(percent(sent, total));
                }
            }
        };
        while let Ok(n) = sent_rx.try_recv() {
            sent += n;
            progress(percent(sent, total));
        }

        check(response.map_err(request_error)?).await?;
        info!("Uploaded {} bytes to storage", total);
        Ok(())
    }

    async fn get_object(&self, url: &PresignedUrl) -> Result<Bytes, StorageError> {
        let response = self
            .client
            .get(&url.url)
            .send()
            .await
            .map_err(request_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(url.url.clone()));
        }
        check(response).await?.bytes().await.map_err(request_error)
    }

    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        let url = self.endpoint(&["api", "objects", key])?;
        let response = self.client.delete(url).send().await.map_err(request_error)?;
        check(response).await?;
        debug!("Deleted object {}", key);
        Ok(())
    }

    async fn put_metadata(&self, meta: &StoredObjectMeta) -> Result<(), StorageError> {
        let url = self.endpoint(&["api", "metadata", &meta.filename])?;
        let response = self
            .client
            .put(url)
            .json(meta)
            .send()
            .await
            .map_err(request_error)?;
        check(response).await?;
        Ok(())
    }

    async fn get_metadata(&self, filename: &str) -> Result<Option<StoredObjectMeta>, StorageError> {
        let url = self.endpoint(&["api", "metadata", filename])?;
        let response = self.client.get(url).send().await.map_err(request_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let raw = RawMetadata {
            key: filename.to_string(),
            record: Some(check(response).await?.json().await.map_err(request_error)?),
        };
        raw.parse().map(Some)
    }

    async fn delete_metadata(&self, filename: &str) -> Result<(), StorageError> {
        let url = self.endpoint(&["api", "metadata", filename])?;
        let response = self.client.delete(url).send().await.map_err(request_error)?;
        check(response).await?;
        Ok(())
    }

    async fn list_metadata_raw(&self) -> Result<Vec<RawMetadata>, StorageError> {
        let url = self.endpoint(&["api", "metadata"])?;
        let response = self.client.get(url).send().await.map_err(request_error)?;
        check(response).await?.json().await.map_err(request_error)
    }
}
