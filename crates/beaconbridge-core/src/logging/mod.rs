//! 日志模块
//!
//! 提供统一的日志级别和条目定义，以及广播/扫描生命周期的诊断记录。
//! 诊断记录只用于排障，不经过 UI 事件通道。

use crate::error::DiscoveryError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use uuid::Uuid;

/// 日志级别
///
/// 实现了 `PartialOrd` 以便过滤，数值越小越严重。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    /// 获取显示名称
    pub fn name(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ERROR" => Ok(LogLevel::Error),
            "WARN" => Ok(LogLevel::Warn),
            "INFO" => Ok(LogLevel::Info),
            "DEBUG" => Ok(LogLevel::Debug),
            "TRACE" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}

/// 全局日志条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub at: SystemTime,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            at: SystemTime::now(),
        }
    }
}

/// 广播器、扫描器和会话的生命周期事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    AdvertiseStarted { service: Uuid },
    AdvertiseStartFailed(DiscoveryError),
    AdvertiseStopped,
    ScanStarted { service: Uuid },
    ScanStartFailed(DiscoveryError),
    /// 平台在扫描过程中报告的终止性失败
    ScanFailed(i32),
    ScanStopped,
    SessionActive,
    SessionIdle { cleared: usize },
    SessionDegraded(DiscoveryError),
}

impl LifecycleEvent {
    pub fn level(&self) -> LogLevel {
        match self {
            LifecycleEvent::AdvertiseStartFailed(_)
            | LifecycleEvent::ScanStartFailed(_)
            | LifecycleEvent::ScanFailed(_) => LogLevel::Warn,
            LifecycleEvent::SessionDegraded(_) => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::AdvertiseStarted { service } => {
                write!(f, "advertising started (service {service})")
            }
            LifecycleEvent::AdvertiseStartFailed(e) => write!(f, "advertising start failed: {e}"),
            LifecycleEvent::AdvertiseStopped => write!(f, "advertising stopped"),
            LifecycleEvent::ScanStarted { service } => write!(f, "scan started (service {service})"),
            LifecycleEvent::ScanStartFailed(e) => write!(f, "scan start failed: {e}"),
            LifecycleEvent::ScanFailed(code) => write!(f, "scan failed with code {code}"),
            LifecycleEvent::ScanStopped => write!(f, "scan stopped"),
            LifecycleEvent::SessionActive => write!(f, "discovery session active"),
            LifecycleEvent::SessionIdle { cleared } => {
                write!(f, "discovery session idle ({cleared} peer(s) cleared)")
            }
            LifecycleEvent::SessionDegraded(e) => write!(f, "discovery session torn down: {e}"),
        }
    }
}

/// 诊断记录
///
/// 每条事件同时写入 `log` 门面和一个有界的内存环形缓冲区，
/// 守护进程通过 IPC 提供最近的记录。
#[derive(Debug, Clone)]
pub struct Diagnostics {
    entries: Arc<Mutex<VecDeque<LogEntry>>>,
    capacity: usize,
}

impl Diagnostics {
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn record(&self, event: LifecycleEvent) {
        let entry = LogEntry::new(event.level(), event.to_string());
        log::log!(target: "beaconbridge_core::lifecycle", log::Level::from(entry.level), "{}", entry.message);

        if let Ok(mut entries) = self.entries.lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
    }

    /// 返回严重程度不低于 `min_level` 的记录，按时间先后排列
    pub fn entries(&self, min_level: LogLevel) -> Vec<LogEntry> {
        self.entries
            .lock()
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.level <= min_level)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parse() {
        assert_eq!("warn".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert_eq!("TRACE".parse::<LogLevel>(), Ok(LogLevel::Trace));
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_ring_drops_oldest() {
        let diagnostics = Diagnostics::new(2);
        diagnostics.record(LifecycleEvent::AdvertiseStopped);
        diagnostics.record(LifecycleEvent::ScanStopped);
        diagnostics.record(LifecycleEvent::SessionActive);

        let entries = diagnostics.entries(LogLevel::Trace);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "scan stopped");
        assert_eq!(entries[1].message, "discovery session active");
    }

    #[test]
    fn test_filter_by_severity() {
        let diagnostics = Diagnostics::default();
        diagnostics.record(LifecycleEvent::ScanStarted {
            service: crate::ble::SERVICE_UUID,
        });
        diagnostics.record(LifecycleEvent::ScanFailed(3));
        diagnostics.record(LifecycleEvent::SessionDegraded(DiscoveryError::RadioUnavailable));

        let warnings = diagnostics.entries(LogLevel::Warn);
        assert_eq!(warnings.len(), 2);
        assert_eq!(warnings[0].level, LogLevel::Warn);
        assert_eq!(warnings[1].level, LogLevel::Error);
        assert_eq!(diagnostics.entries(LogLevel::Error).len(), 1);
    }
}
