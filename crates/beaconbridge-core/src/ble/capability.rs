//! 能力检查
//!
//! 在任何广播/扫描操作之前确认无线电存在并已开启、授权齐全。
//! 不持有会话状态，只读取和监听平台。

use log::{debug, info, warn};

use crate::ble::{CapabilityState, Permission, PlatformEvent, REQUIRED_PERMISSIONS, Radio};
use crate::error::DiscoveryError;
use std::sync::Arc;
use tokio::sync::broadcast;

pub struct CapabilityGate {
    radio: Arc<dyn Radio>,
}

impl CapabilityGate {
    pub fn new(radio: Arc<dyn Radio>) -> Self {
        Self { radio }
    }

    /// 查询无线电状态
    ///
    /// `Disabled` 时向平台发出开启请求（不等待），调用方应在收到
    /// `PlatformEvent::CapabilityChanged(Enabled)` 后重试，而不是轮询。
    pub async fn ensure_ready(&self) -> CapabilityState {
        let state = self.radio.capability().await;
        match state {
            CapabilityState::Unsupported => {
                warn!("Bluetooth radio not supported on this host");
            }
            CapabilityState::Disabled => {
                info!("Bluetooth radio disabled, requesting enablement");
                self.radio.request_enable();
            }
            CapabilityState::Enabled => {
                debug!("Bluetooth radio enabled");
            }
        }
        state
    }

    /// 只读查询，不会请求开启
    pub async fn capability(&self) -> CapabilityState {
        self.radio.capability().await
    }

    /// `ensure_ready` 的 `Result` 形式
    pub async fn require_ready(&self) -> Result<(), DiscoveryError> {
        match self.ensure_ready().await {
            CapabilityState::Unsupported => Err(DiscoveryError::RadioUnavailable),
            CapabilityState::Disabled => Err(DiscoveryError::RadioDisabled),
            CapabilityState::Enabled => Ok(()),
        }
    }

    pub fn missing_permissions(&self) -> Vec<Permission> {
        REQUIRED_PERMISSIONS
            .iter()
            .copied()
            .filter(|p| !self.radio.is_granted(*p))
            .collect()
    }

    /// 授权预检：缺少任意一项都直接返回 `PermissionDenied`，不触碰无线电
    pub fn require_permissions(&self) -> Result<(), DiscoveryError> {
        let missing = self.missing_permissions();
        if missing.is_empty() {
            return Ok(());
        }
        warn!("Missing permissions {:?}, requesting grants", missing);
        self.radio.request_permissions(&missing);
        Err(DiscoveryError::PermissionDenied(missing))
    }

    /// 平台开关/授权变化通知
    pub fn subscribe(&self) -> broadcast::Receiver<PlatformEvent> {
        self.radio.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::LoopbackRadio;

    #[tokio::test]
    async fn test_disabled_requests_enablement() {
        let radio = Arc::new(LoopbackRadio::with_capability(CapabilityState::Disabled));
        let gate = CapabilityGate::new(radio.clone());

        assert_eq!(gate.ensure_ready().await, CapabilityState::Disabled);
        assert_eq!(radio.enable_requests(), 1);
        assert_eq!(gate.require_ready().await, Err(DiscoveryError::RadioDisabled));
    }

    #[tokio::test]
    async fn test_unsupported_maps_to_unavailable() {
        let radio = Arc::new(LoopbackRadio::with_capability(CapabilityState::Unsupported));
        let gate = CapabilityGate::new(radio.clone());

        assert_eq!(gate.require_ready().await, Err(DiscoveryError::RadioUnavailable));
        assert_eq!(radio.enable_requests(), 0);
    }

    #[tokio::test]
    async fn test_capability_query_does_not_request_enable() {
        let radio = Arc::new(LoopbackRadio::with_capability(CapabilityState::Disabled));
        let gate = CapabilityGate::new(radio.clone());

        assert_eq!(gate.capability().await, CapabilityState::Disabled);
        assert_eq!(radio.enable_requests(), 0);
    }

    #[test]
    fn test_missing_permissions_are_requested() {
        let radio = Arc::new(LoopbackRadio::new());
        radio.revoke(Permission::Advertise);
        radio.revoke(Permission::FineLocation);
        let gate = CapabilityGate::new(radio.clone());

        assert_eq!(
            gate.require_permissions(),
            Err(DiscoveryError::PermissionDenied(vec![
                Permission::Advertise,
                Permission::FineLocation
            ]))
        );
        assert_eq!(
            radio.permission_requests(),
            vec![Permission::Advertise, Permission::FineLocation]
        );
    }
}
