//! 信标广播器
//!
//! 以固定策略发布携带服务 UUID 的存在性广播（不可连接）。
//!
//! - 未停止前再次 `start` 返回 `AlreadyActive`
//! - `stop` 幂等：已停止或过期的句柄直接忽略

use log::{debug, warn};

use crate::ble::{AdvertiseParams, AdvertisingId, Permission, Radio, RadioFault};
use crate::error::DiscoveryError;
use crate::logging::{Diagnostics, LifecycleEvent};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

/// 一次成功广播的句柄
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastHandle {
    token: u64,
    advertising: AdvertisingId,
}

pub struct BeaconBroadcaster {
    radio: Arc<dyn Radio>,
    diagnostics: Diagnostics,
    active: Mutex<Option<u64>>,
    next_token: AtomicU64,
}

impl BeaconBroadcaster {
    pub fn new(radio: Arc<dyn Radio>, diagnostics: Diagnostics) -> Self {
        Self {
            radio,
            diagnostics,
            active: Mutex::new(None),
            next_token: AtomicU64::new(1),
        }
    }

    pub async fn start(&self, service_uuid: Uuid) -> Result<BroadcastHandle, DiscoveryError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(DiscoveryError::AlreadyActive);
        }

        if !self.radio.is_granted(Permission::Advertise) {
            self.radio.request_permissions(&[Permission::Advertise]);
            let err = DiscoveryError::PermissionDenied(vec![Permission::Advertise]);
            self.diagnostics
                .record(LifecycleEvent::AdvertiseStartFailed(err.clone()));
            return Err(err);
        }

        let params = AdvertiseParams::beacon(service_uuid);
        debug!("Starting beacon advertising: {:?}", params);

        match self.radio.start_advertising(&params).await {
            Ok(advertising) => {
                let token = self.next_token.fetch_add(1, Ordering::Relaxed);
                *active = Some(token);
                self.diagnostics.record(LifecycleEvent::AdvertiseStarted {
                    service: service_uuid,
                });
                Ok(BroadcastHandle { token, advertising })
            }
            Err(fault) => {
                let err = translate(fault);
                self.diagnostics
                    .record(LifecycleEvent::AdvertiseStartFailed(err.clone()));
                Err(err)
            }
        }
    }

    pub async fn stop(&self, handle: BroadcastHandle) {
        let mut active = self.active.lock().await;
        if *active != Some(handle.token) {
            debug!("Ignoring stop for inactive broadcast handle {:?}", handle);
            return;
        }
        *active = None;

        if let Err(e) = self.radio.stop_advertising(handle.advertising).await {
            warn!("Failed to stop advertising: {}", e);
        }
        self.diagnostics.record(LifecycleEvent::AdvertiseStopped);
    }

    pub async fn is_active(&self) -> bool {
        self.active.lock().await.is_some()
    }
}

fn translate(fault: RadioFault) -> DiscoveryError {
    match fault {
        RadioFault::Unavailable => DiscoveryError::RadioUnavailable,
        RadioFault::NotPermitted => DiscoveryError::PermissionDenied(vec![Permission::Advertise]),
        RadioFault::Code(code) => DiscoveryError::StartFailed(code),
        RadioFault::Other(message) => DiscoveryError::Platform(message),
    }
}
