//! Loopback Radio - 进程内软件无线电
//!
//! 没有蓝牙硬件的主机上使用，也是测试的驱动后端。开关状态、授权、
//! 平台失败和"空中"的广播都可以由调用方注入。
//!
//! 与真实无线电一致：过滤在这一层完成，只有携带扫描服务 UUID
//! 的广播才会投递给对应的扫描。

use log::{debug, info};

use crate::ble::{
    AdvertiseParams, AdvertisementReport, AdvertisingId, CapabilityState, Permission,
    PlatformEvent, REQUIRED_PERMISSIONS, Radio, RadioFault, ScanId, ScanParams, ScanReport,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

struct LoopbackScan {
    params: ScanParams,
    reports: mpsc::UnboundedSender<ScanReport>,
}

struct LoopbackState {
    capability: CapabilityState,
    granted: BTreeSet<Permission>,
    advertising: HashMap<AdvertisingId, AdvertiseParams>,
    scans: HashMap<ScanId, LoopbackScan>,
    next_id: u64,
    enable_requests: usize,
    permission_requests: Vec<Permission>,
    advertise_failure: Option<RadioFault>,
    scan_failure: Option<RadioFault>,
    advertise_delay: Option<Duration>,
    auto_enable: bool,
}

pub struct LoopbackRadio {
    state: Mutex<LoopbackState>,
    events: broadcast::Sender<PlatformEvent>,
}

impl LoopbackRadio {
    /// 已开启且授权齐全
    pub fn new() -> Self {
        Self::with_capability(CapabilityState::Enabled)
    }

    pub fn with_capability(capability: CapabilityState) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            state: Mutex::new(LoopbackState {
                capability,
                granted: REQUIRED_PERMISSIONS.iter().copied().collect(),
                advertising: HashMap::new(),
                scans: HashMap::new(),
                next_id: 1,
                enable_requests: 0,
                permission_requests: Vec::new(),
                advertise_failure: None,
                scan_failure: None,
                advertise_delay: None,
                auto_enable: false,
            }),
            events,
        }
    }

    /// 收到开启请求时立即模拟用户同意
    pub fn with_auto_enable(self) -> Self {
        self.lock().auto_enable = true;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LoopbackState> {
        // 持锁期间不会 panic，毒化时沿用内部数据
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// 改变开关状态并发出平台通知
    ///
    /// 关闭或移除无线电时，正在进行的广播和扫描随之消失。
    pub fn set_capability(&self, capability: CapabilityState) {
        {
            let mut state = self.lock();
            state.capability = capability;
            if capability != CapabilityState::Enabled {
                state.advertising.clear();
                state.scans.clear();
            }
        }
        info!("Loopback radio capability -> {:?}", capability);
        let _ = self.events.send(PlatformEvent::CapabilityChanged(capability));
    }

    pub fn grant(&self, permission: Permission) {
        self.lock().granted.insert(permission);
        let _ = self.events.send(PlatformEvent::PermissionGranted(permission));
    }

    pub fn revoke(&self, permission: Permission) {
        self.lock().granted.remove(&permission);
        let _ = self.events.send(PlatformEvent::PermissionRevoked(permission));
    }

    pub fn fail_next_advertise(&self, fault: RadioFault) {
        self.lock().advertise_failure = Some(fault);
    }

    pub fn fail_next_scan(&self, fault: RadioFault) {
        self.lock().scan_failure = Some(fault);
    }

    /// 广播注册在返回前先等待 `delay`，模拟慢速平台
    pub fn set_advertise_delay(&self, delay: Duration) {
        self.lock().advertise_delay = Some(delay);
    }

    /// 把一条广播"发送到空中"，返回收到它的扫描数
    pub fn advertise(&self, report: AdvertisementReport) -> usize {
        let state = self.lock();
        let mut delivered = 0;
        for scan in state.scans.values() {
            if report.service_uuids.contains(&scan.params.service_uuid)
                && scan.reports.send(ScanReport::Single(report.clone())).is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }

    /// 以批量形式投递，每个扫描只收到与其服务匹配的部分
    pub fn advertise_batch(&self, reports: Vec<AdvertisementReport>) -> usize {
        let state = self.lock();
        let mut delivered = 0;
        for scan in state.scans.values() {
            let matching: Vec<_> = reports
                .iter()
                .filter(|r| r.service_uuids.contains(&scan.params.service_uuid))
                .cloned()
                .collect();
            if !matching.is_empty() && scan.reports.send(ScanReport::Batch(matching)).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// 让所有进行中的扫描以 `code` 失败
    pub fn fail_scans(&self, code: i32) {
        let state = self.lock();
        for scan in state.scans.values() {
            let _ = scan.reports.send(ScanReport::Failed(code));
        }
    }

    pub fn active_advertisements(&self) -> usize {
        self.lock().advertising.len()
    }

    pub fn advertising_params(&self) -> Vec<AdvertiseParams> {
        self.lock().advertising.values().cloned().collect()
    }

    pub fn active_scans(&self) -> usize {
        self.lock().scans.len()
    }

    pub fn enable_requests(&self) -> usize {
        self.lock().enable_requests
    }

    pub fn permission_requests(&self) -> Vec<Permission> {
        self.lock().permission_requests.clone()
    }
}

impl Default for LoopbackRadio {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Radio for LoopbackRadio {
    async fn capability(&self) -> CapabilityState {
        self.lock().capability
    }

    fn request_enable(&self) {
        let auto_enable = {
            let mut state = self.lock();
            state.enable_requests += 1;
            state.auto_enable && state.capability == CapabilityState::Disabled
        };
        if auto_enable {
            self.set_capability(CapabilityState::Enabled);
        }
    }

    fn is_granted(&self, permission: Permission) -> bool {
        self.lock().granted.contains(&permission)
    }

    fn request_permissions(&self, permissions: &[Permission]) {
        debug!("Loopback permission request: {:?}", permissions);
        self.lock().permission_requests.extend_from_slice(permissions);
    }

    async fn start_advertising(
        &self,
        params: &AdvertiseParams,
    ) -> Result<AdvertisingId, RadioFault> {
        let delay = self.lock().advertise_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.capability != CapabilityState::Enabled {
            return Err(RadioFault::Unavailable);
        }
        if let Some(fault) = state.advertise_failure.take() {
            return Err(fault);
        }
        let id = state.next_id;
        state.next_id += 1;
        state.advertising.insert(id, params.clone());
        Ok(id)
    }

    async fn stop_advertising(&self, id: AdvertisingId) -> Result<(), RadioFault> {
        self.lock().advertising.remove(&id);
        Ok(())
    }

    async fn start_scan(
        &self,
        params: &ScanParams,
        reports: mpsc::UnboundedSender<ScanReport>,
    ) -> Result<ScanId, RadioFault> {
        let mut state = self.lock();
        if state.capability != CapabilityState::Enabled {
            return Err(RadioFault::Unavailable);
        }
        if let Some(fault) = state.scan_failure.take() {
            return Err(fault);
        }
        let id = state.next_id;
        state.next_id += 1;
        state.scans.insert(
            id,
            LoopbackScan {
                params: params.clone(),
                reports,
            },
        );
        Ok(id)
    }

    async fn stop_scan(&self, id: ScanId) -> Result<(), RadioFault> {
        self.lock().scans.remove(&id);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<PlatformEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::SERVICE_UUID;

    #[tokio::test]
    async fn test_auto_enable_emits_notification() {
        let radio = LoopbackRadio::with_capability(CapabilityState::Disabled).with_auto_enable();
        let mut events = radio.subscribe();

        radio.request_enable();

        assert_eq!(radio.capability().await, CapabilityState::Enabled);
        assert_eq!(
            events.recv().await.unwrap(),
            PlatformEvent::CapabilityChanged(CapabilityState::Enabled)
        );
    }

    #[tokio::test]
    async fn test_disabling_drops_radio_operations() {
        let radio = LoopbackRadio::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        radio
            .start_advertising(&AdvertiseParams::beacon(SERVICE_UUID))
            .await
            .unwrap();
        radio
            .start_scan(&ScanParams::low_latency(SERVICE_UUID), tx)
            .await
            .unwrap();

        radio.set_capability(CapabilityState::Disabled);

        assert_eq!(radio.active_advertisements(), 0);
        assert_eq!(radio.active_scans(), 0);
    }
}
