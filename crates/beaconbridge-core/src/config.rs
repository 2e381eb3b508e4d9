//! 应用配置和持久化
//!
//! 提供广播设备名、适配器、无线电后端等设置的存储和读取。

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::discovery::SessionOptions;
use crate::logging::Diagnostics;

/// 无线电后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RadioBackend {
    /// BlueZ (D-Bus)
    #[default]
    Bluez,
    /// 进程内软件无线电，没有蓝牙硬件时使用
    Loopback,
}

/// 应用设置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// 广播中携带的设备名称
    pub device_name: String,
    /// BlueZ 适配器名称 (如 hci0)，为空时使用默认适配器
    pub adapter: Option<String>,
    pub backend: RadioBackend,
    /// tracing EnvFilter 表达式，`RUST_LOG` 优先
    pub log_filter: String,
    /// 诊断记录保留条数
    pub diagnostics_capacity: usize,
    /// 单次会话内扫描失败后的最多重启次数
    pub scan_restart_attempts: u32,
    /// IPC socket 路径，为空时使用 `$XDG_RUNTIME_DIR/beaconbridge.sock`
    pub socket_path: Option<PathBuf>,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            device_name: get_default_device_name(),
            adapter: None,
            backend: RadioBackend::Bluez,
            log_filter: "info,beaconbridge_core=debug".to_string(),
            diagnostics_capacity: Diagnostics::DEFAULT_CAPACITY,
            scan_restart_attempts: 1,
            socket_path: None,
        }
    }
}

impl BridgeSettings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("beaconbridge");
        config_dir.join("settings.toml")
    }

    /// 加载设置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        let path = Self::config_path();
        if path.exists() {
            match fs::read_to_string(&path) {
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
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            scan_restart_attempts: self.scan_restart_attempts,
            ..SessionOptions::default()
        }
    }
}

/// 获取默认设备名称（主机名）
fn get_default_device_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "Beaconbridge".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = BridgeSettings::default();
        assert_eq!(settings.backend, RadioBackend::Bluez);
        assert_eq!(settings.scan_restart_attempts, 1);
        assert!(!settings.device_name.is_empty());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let settings: BridgeSettings = toml::from_str(
            r#"
            backend = "loopback"
            scan_restart_attempts = 3
            "#,
        )
        .unwrap();

        assert_eq!(settings.backend, RadioBackend::Loopback);
        assert_eq!(settings.session_options().scan_restart_attempts, 3);
        assert_eq!(settings.diagnostics_capacity, Diagnostics::DEFAULT_CAPACITY);
        assert!(settings.adapter.is_none());
    }

    #[test]
    fn test_toml_roundtrip_keeps_adapter() {
        let settings = BridgeSettings {
            adapter: Some("hci1".to_string()),
            ..Default::default()
        };
        let text = toml::to_string_pretty(&settings).unwrap();
        let parsed: BridgeSettings = toml::from_str(&text).unwrap();
        assert_eq!(parsed.adapter.as_deref(), Some("hci1"));
    }
}
