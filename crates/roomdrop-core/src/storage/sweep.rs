//! 保留期清理
//!
//! 删除 `uploadedAt` 早于保留期的对象及其元数据。缺失或格式错误的元数据
//! 只记日志并跳过，单个删除失败不会中断整次清理。

use chrono::{DateTime, Duration, Utc};
use log::{info, warn};

use super::{StorageError, StorageGateway};

/// 默认保留天数
pub const RETENTION_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub async fn sweep_expired(
    gateway: &dyn StorageGateway,
    now: DateTime<Utc>,
    retention: Duration,
) -> Result<SweepReport, StorageError> {
    let records = gateway.list_metadata_raw().await?;
    let mut report = SweepReport {
        scanned: records.len(),
        ..Default::default()
    };

    for raw in records {
        let meta = match raw.parse() {
            Ok(meta) => meta,
            Err(e) => {
                warn!("Sweep skipping {}: {}", raw.key, e);
                report.skipped += 1;
                continue;
            }
        };

        if now.signed_duration_since(meta.uploaded_at) <= retention {
            continue;
        }

        let result = async {
            gateway.delete_object(&meta.filename).await?;
            gateway.delete_metadata(&raw.key).await
        }
        .await;

        match result {
            Ok(()) => {
                info!("Sweep deleted {} (uploaded {})", meta.filename, meta.uploaded_at);
                report.deleted += 1;
            }
            Err(e) => {
                warn!("Sweep failed to delete {}: {}", meta.filename, e);
                report.failed += 1;
            }
        }
    }

    info!(
        "Sweep finished: scanned={} deleted={} skipped={} failed={}",
        report.scanned, report.deleted, report.skipped, report.failed
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryGateway, StoredObjectMeta};
    use bytes::Bytes;

    fn meta(name: &str, uploaded_at: DateTime<Utc>) -> StoredObjectMeta {
        StoredObjectMeta {
            filename: name.to_string(),
            uploaded_at,
            content_type: "application/octet-stream".to_string(),
            size: 3,
            is_compressed: false,
        }
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired_objects() {
        let gateway = MemoryGateway::new();
        let now = Utc::now();
        for (name, age_days) in [("old", 8), ("edge", 7), ("fresh", 1)] {
            gateway.insert_object(name, Bytes::from_static(b"abc"));
            gateway
                .put_metadata(&meta(name, now - Duration::days(age_days)))
                .await
                .unwrap();
        }

        let report = sweep_expired(&gateway, now, Duration::days(RETENTION_DAYS))
            .await
            .unwrap();

        assert_eq!(
            report,
            SweepReport {
                scanned: 3,
                deleted: 1,
                skipped: 0,
                failed: 0
            }
        );
        assert!(gateway.object("old").is_none());
        assert!(gateway.get_metadata("old").await.unwrap().is_none());
        assert!(gateway.object("edge").is_some());
        assert!(gateway.object("fresh").is_some());
    }

    #[tokio::test]
    async fn test_sweep_skips_bad_metadata() {
        let gateway = MemoryGateway::new();
        let now = Utc::now();
        gateway.insert_raw_metadata("garbage", Some(serde_json::json!("???")));
        gateway.insert_raw_metadata("empty", None);
        gateway
            .put_metadata(&meta("stale", now - Duration::days(30)))
            .await
            .unwrap();

        let report = sweep_expired(&gateway, now, Duration::days(RETENTION_DAYS))
            .await
            .unwrap();

        assert_eq!(report.skipped, 2);
        assert_eq!(report.deleted, 1);
        assert_eq!(gateway.list_metadata_raw().await.unwrap().len(), 2);
    }
}
