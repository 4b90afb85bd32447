//! 发送端算法

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info};
use std::ops::Range;

use super::TransferDescriptor;
use super::compression::{CompressionError, compress, should_compress};
use crate::error::ShareError;
use crate::protocol::{Envelope, Frame};

/// 可以发送帧的通道
///
/// 返回 `false` 表示帧未被接受（通道未连接或已关闭）。
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_frame(&self, frame: Frame) -> bool;
}

/// 已按压缩策略处理好的负载
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedPayload {
    pub descriptor: TransferDescriptor,
    pub data: Bytes,
}

impl PreparedPayload {
    /// 按压缩策略准备负载，需要完整的源数据
    pub fn prepare(name: &str, mime_type: &str, data: Bytes) -> Result<Self, CompressionError> {
        let is_compressed = should_compress(name, mime_type);
        let data = if is_compressed {
            Bytes::from(compress(&data)?)
        } else {
            data
        };

        Ok(Self {
            descriptor: TransferDescriptor {
                name: name.to_string(),
                size: data.len() as u64,
                mime_type: mime_type.to_string(),
                is_compressed,
            },
            data,
        })
    }
}

/// 计算覆盖 `len` 字节的连续分块区间，无空隙无重叠
pub fn chunk_ranges(len: usize, chunk_size: usize) -> impl Iterator<Item = Range<usize>> {
    let step = chunk_size.max(1);
    (0..len)
        .step_by(step)
        .map(move |start| start..(start + step).min(len))
}

/// 整数百分比 0-100，总数为 0 视为完成
pub fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = done.saturating_mul(100) / total;
    u8::try_from(pct.min(100)).unwrap_or(100)
}

/// 发送一个完整负载: `file-meta`，数据块，`file-end`
///
/// 每发送一块调用一次 `on_progress`。不等待接收端确认。
pub async fn send_payload<S>(
    sink: &S,
    payload: &PreparedPayload,
    chunk_size: usize,
    mut on_progress: impl FnMut(u8) + Send,
) -> Result<(), ShareError>
where
    S: FrameSink + ?Sized,
{
    let descriptor = &payload.descriptor;
    info!(
        "Sending {} ({} bytes, compressed={})",
        descriptor.name, descriptor.size, descriptor.is_compressed
    );

    emit(sink, Envelope::FileMeta(descriptor.clone()).to_frame()?).await?;

    let total = payload.data.len() as u64;
    let mut sent: u64 = 0;
    for range in chunk_ranges(payload.data.len(), chunk_size) {
        let chunk = payload.data.slice(range);
        sent += chunk.len() as u64;
        emit(sink, Frame::Binary(chunk)).await?;
        on_progress(percent(sent, total));
        tokio::task::yield_now().await;
    }

    if total == 0 {
        on_progress(100);
    }

    emit(sink, Envelope::file_end(&descriptor.name).to_frame()?).await?;
    debug!("Sent file-end for {}", descriptor.name);
    Ok(())
}

async fn emit<S: FrameSink + ?Sized>(sink: &S, frame: Frame) -> Result<(), ShareError> {
    if sink.send_frame(frame).await {
        Ok(())
    } else {
        Err(ShareError::Connection(
            "transport refused frame during transfer".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::CHUNK_SIZE;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<Frame>>,
        accept_limit: Option<usize>,
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send_frame(&self, frame: Frame) -> bool {
            let mut frames = self.frames.lock().unwrap();
            if self.accept_limit.is_some_and(|limit| frames.len() >= limit) {
                return false;
            }
            frames.push(frame);
            true
        }
    }

    #[test]
    fn test_chunk_ranges_cover_without_gaps() {
        for len in [0usize, 1, 63, 64, 65, 1000] {
            let ranges: Vec<_> = chunk_ranges(len, 64).collect();
            let mut next = 0;
            for r in &ranges {
                assert_eq!(r.start, next);
                assert!(r.end - r.start <= 64 && r.end > r.start);
                next = r.end;
            }
            assert_eq!(next, len);
        }
    }

    #[test]
    fn test_percent_bounds() {
        assert_eq!(percent(0, 0), 100);
        assert_eq!(percent(0, 10), 0);
        assert_eq!(percent(5, 10), 50);
        assert_eq!(percent(10, 10), 100);
        assert_eq!(percent(20, 10), 100);
    }

    #[test]
    fn test_prepare_respects_policy() {
        let text = Bytes::from(b"abc".repeat(1000));
        let packed = PreparedPayload::prepare("a.txt", "text/plain", text.clone()).unwrap();
        assert!(packed.descriptor.is_compressed);
        assert_eq!(packed.descriptor.size, packed.data.len() as u64);
        assert!(packed.data.len() < text.len());

        let photo = PreparedPayload::prepare("a.jpg", "image/jpeg", text.clone()).unwrap();
        assert!(!photo.descriptor.is_compressed);
        assert_eq!(photo.data, text);
    }

    #[tokio::test]
    async fn test_incompressible_scenario_chunk_sizes() {
        let data = Bytes::from(vec![7u8; 200_000]);
        let payload = PreparedPayload::prepare("movie.mp4", "video/mp4", data).unwrap();
        let sink = RecordingSink::default();
        let mut progress = Vec::new();

        send_payload(&sink, &payload, CHUNK_SIZE, |p| progress.push(p))
            .await
            .unwrap();

        let frames = sink.frames.into_inner().unwrap();
        assert_eq!(frames.len(), 6);
        assert!(matches!(
            Envelope::parse(match &frames[0] {
                Frame::Text(t) => t,
                Frame::Binary(_) => panic!("first frame must be file-meta"),
            }),
            Ok(Envelope::FileMeta(_))
        ));
        let sizes: Vec<usize> = frames[1..5]
            .iter()
            .map(|f| match f {
                Frame::Binary(b) => b.len(),
                Frame::Text(_) => panic!("expected binary chunk"),
            })
            .collect();
        assert_eq!(sizes, vec![65536, 65536, 65536, 3392]);
        assert_eq!(
            frames[5],
            Envelope::file_end("movie.mp4").to_frame().unwrap()
        );
        assert_eq!(progress, vec![32, 65, 98, 100]);
    }

    #[tokio::test]
    async fn test_empty_payload_sends_meta_and_end_only() {
        let payload = PreparedPayload::prepare("empty.bin", "video/mp4", Bytes::new()).unwrap();
        let sink = RecordingSink::default();
        let mut progress = Vec::new();

        send_payload(&sink, &payload, CHUNK_SIZE, |p| progress.push(p))
            .await
            .unwrap();

        assert_eq!(sink.frames.into_inner().unwrap().len(), 2);
        assert_eq!(progress, vec![100]);
    }

    #[tokio::test]
    async fn test_refused_frame_aborts_transfer() {
        let payload =
            PreparedPayload::prepare("x.zip", "application/zip", Bytes::from(vec![0u8; 300_000]))
                .unwrap();
        let sink = RecordingSink {
            accept_limit: Some(2),
            ..Default::default()
        };

        let result = send_payload(&sink, &payload, CHUNK_SIZE, |_| {}).await;
        assert!(matches!(result, Err(ShareError::Connection(_))));
        assert_eq!(sink.frames.into_inner().unwrap().len(), 2);
    }
}
