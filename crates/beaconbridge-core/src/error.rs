//! 发现桥错误类型

use crate::ble::Permission;

/// 发现会话对外暴露的错误
///
/// 底层无线电故障在广播器/扫描器边界被翻译成这里的类型，
/// 不会以原始平台错误的形式向上传播。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Bluetooth radio is not available on this host")]
    RadioUnavailable,

    #[error("Bluetooth radio is disabled, enablement has been requested")]
    RadioDisabled,

    #[error("Missing permissions: {0:?}")]
    PermissionDenied(Vec<Permission>),

    #[error("Radio operation already active")]
    AlreadyActive,

    #[error("Advertising failed to start (code {0})")]
    StartFailed(i32),

    #[error("Scan failed (code {0})")]
    ScanFailed(i32),

    #[error("Platform error: {0}")]
    Platform(String),
}

impl DiscoveryError {
    /// 调用方在外部条件满足后（授权、开启蓝牙）重试即可恢复
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DiscoveryError::RadioDisabled | DiscoveryError::PermissionDenied(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(DiscoveryError::RadioDisabled.is_recoverable());
        assert!(DiscoveryError::PermissionDenied(vec![Permission::Scan]).is_recoverable());
        assert!(!DiscoveryError::RadioUnavailable.is_recoverable());
        assert!(!DiscoveryError::ScanFailed(3).is_recoverable());
    }

    #[test]
    fn test_display_carries_code() {
        assert_eq!(
            DiscoveryError::StartFailed(2).to_string(),
            "Advertising failed to start (code 2)"
        );
    }
}
