//! 应用配置和持久化
//!
//! 中继地址、存储网关地址、超时等设置的存储和读取。

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::share::ShareSettings;
use crate::transfer::{CHUNK_SIZE, TransferSettings};
use crate::transport::STUN_SERVERS;

/// 应用设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// 信令中继地址
    pub relay_url: String,
    /// 存储网关地址
    pub gateway_url: String,
    pub stun_servers: Vec<String>,
    /// 单块字节数
    pub chunk_size: usize,
    pub connect_timeout_secs: u64,
    pub receive_timeout_secs: u64,
    /// 发送指针后关闭连接前的等待
    pub pointer_grace_ms: u64,
    /// 存储对象保留天数
    pub retention_days: i64,
    /// 下载目录
    pub download_dir: PathBuf,
    /// 详细日志模式
    pub verbose: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        let share = ShareSettings::default();
        Self {
            relay_url: "ws://127.0.0.1:8787".to_string(),
            gateway_url: "http://127.0.0.1:8788".to_string(),
            stun_servers: STUN_SERVERS.iter().map(ToString::to_string).collect(),
            chunk_size: CHUNK_SIZE,
            connect_timeout_secs: share.connect_timeout.as_secs(),
            receive_timeout_secs: share.transfer.receive_timeout.as_secs(),
            pointer_grace_ms: u64::try_from(share.pointer_grace.as_millis()).unwrap_or(500),
            retention_days: crate::storage::RETENTION_DAYS,
            download_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            verbose: false,
        }
    }
}

impl AppSettings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("roomdrop");
        config_dir.join("settings.toml")
    }

    /// 加载设置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &std::path::Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(settings) => {
                        debug!("Loaded settings from {:?}", path);
                        return settings;
                    }
                    Err(e) => {
                        log::warn!("Failed to parse settings: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read settings file: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    /// 保存设置
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &std::path::Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn transfer_settings(&self) -> TransferSettings {
        TransferSettings {
            chunk_size: self.chunk_size.clamp(1, CHUNK_SIZE),
            receive_timeout: Duration::from_secs(self.receive_timeout_secs.max(1)),
        }
    }

    pub fn share_settings(&self) -> ShareSettings {
        ShareSettings {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
            pointer_grace: Duration::from_millis(self.pointer_grace_ms),
            transfer: self.transfer_settings(),
        }
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days.max(0))
    }
}
