//! 用户可见的状态提示
//!
//! 错误和警告一直保留到被确认，信息和成功提示 5 秒后自动消失。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// 临时提示的显示时长
pub const TRANSIENT_NOTICE_TTL: Duration = Duration::from_secs(5);

/// 提示级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NoticeLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Success = 3,
}

impl NoticeLevel {
    /// 获取对应的 Emoji 图标
    pub fn icon(&self) -> &'static str {
        match self {
            NoticeLevel::Error => "❌",
            NoticeLevel::Warn => "⚠️",
            NoticeLevel::Info => "ℹ️",
            NoticeLevel::Success => "✅",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            NoticeLevel::Error => "ERROR",
            NoticeLevel::Warn => "WARN",
            NoticeLevel::Info => "INFO",
            NoticeLevel::Success => "SUCCESS",
        }
    }

    /// 是否需要用户确认
    pub fn is_persistent(&self) -> bool {
        matches!(self, NoticeLevel::Error | NoticeLevel::Warn)
    }
}

impl std::str::FromStr for NoticeLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ERROR" => Ok(NoticeLevel::Error),
            "WARN" | "WARNING" => Ok(NoticeLevel::Warn),
            "INFO" => Ok(NoticeLevel::Info),
            "SUCCESS" => Ok(NoticeLevel::Success),
            other => Err(format!("unknown notice level: {other}")),
        }
    }
}

impl fmt::Display for NoticeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn new(level: NoticeLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Error, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Warn, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Info, message)
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Success, message)
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.level.icon(), self.message)
    }
}

/// 当前显示的提示，新提示替换旧提示
#[derive(Debug, Default)]
pub struct NoticeBoard {
    current: Option<(Notice, Instant)>,
}

impl NoticeBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&mut self, notice: Notice, now: Instant) {
        self.current = Some((notice, now));
    }

    /// 在 `now` 时刻仍应显示的提示
    pub fn current(&self, now: Instant) -> Option<&Notice> {
        let (notice, posted_at) = self.current.as_ref()?;
        if notice.level.is_persistent() || now.duration_since(*posted_at) < TRANSIENT_NOTICE_TTL {
            Some(notice)
        } else {
            None
        }
    }

    /// 用户确认后清除
    pub fn acknowledge(&mut self) {
        self.current = None;
    }
}
