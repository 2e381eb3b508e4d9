//! BlueZ Radio - 基于 bluer (BlueZ D-Bus) 的无线电后端
//!
//! # 能力
//!
//! - 无适配器 / 无 BlueZ 服务: `Unsupported`
//! - 适配器未上电: `Disabled`，开启请求即 `set_powered(true)`
//! - 适配器电源变化和适配器消失通过 `PlatformEvent` 通知
//!
//! # 广播
//!
//! 使用 `Broadcast` 类型（不可连接），携带服务 UUID、设备名和发射功率，
//! 广播间隔固定为低延迟值。
//!
//! # 扫描
//!
//! 通过 `DiscoveryFilter` 把服务 UUID 过滤交给 BlueZ，并开启
//! `duplicate_data` 以便重复广播也能上报。
//!
//! BlueZ 在 discovery 开始时会把缓存的设备重新作为 `DeviceAdded` 上报，
//! 这些设备没有 RSSI，不算观测。同一设备之后的广播只以属性变化
//! (`Rssi` / `ServiceData` / `ManufacturerData`) 出现，因此每个新设备
//! 都订阅其属性事件。
//!
//! # 权限
//!
//! BlueZ 没有运行时授权，权限由 D-Bus 策略在调用时检查，
//! `NotAuthorized` / `NotPermitted` 被翻译为 `RadioFault::NotPermitted`。

use log::{debug, info, trace, warn};

use crate::ble::{
    AdvertiseParams, AdvertisementReport, AdvertisingId, CapabilityState, Permission,
    PlatformEvent, Radio, RadioFault, ScanId, ScanMode, ScanParams, ScanReport,
    advertise_failure, scan_failure,
};
use bluer::adv::{Advertisement, AdvertisementHandle, Type};
use bluer::{
    Adapter, AdapterEvent, AdapterProperty, Address, DeviceEvent, DeviceProperty,
    DiscoveryFilter, DiscoveryTransport, ErrorKind,
};
use futures_util::stream::SelectAll;
use futures_util::{Stream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

type DeviceEvents = Pin<Box<dyn Stream<Item = (Address, DeviceEvent)> + Send>>;

pub struct BluezRadio {
    adapter: Option<Adapter>,
    device_name: String,
    events: broadcast::Sender<PlatformEvent>,
    advertisements: Mutex<HashMap<AdvertisingId, AdvertisementHandle>>,
    scans: Mutex<HashMap<ScanId, JoinHandle<()>>>,
    next_id: AtomicU64,
    watcher: Option<JoinHandle<()>>,
}

impl BluezRadio {
    /// 连接 BlueZ 并选择适配器
    ///
    /// 连接失败不会返回错误，而是得到一个 `Unsupported` 的无线电，
    /// 由能力检查统一处理。
    pub async fn open(adapter_name: Option<&str>, device_name: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(32);

        let adapter = match Self::connect(adapter_name).await {
            Ok(adapter) => {
                info!("Using Bluetooth adapter '{}'", adapter.name());
                Some(adapter)
            }
            Err(e) => {
                warn!("BlueZ adapter unavailable: {}", e);
                None
            }
        };

        let watcher = adapter
            .clone()
            .map(|adapter| tokio::spawn(watch_adapter(adapter, events.clone())));

        Self {
            adapter,
            device_name: device_name.into(),
            events,
            advertisements: Mutex::new(HashMap::new()),
            scans: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            watcher,
        }
    }

    async fn connect(adapter_name: Option<&str>) -> bluer::Result<Adapter> {
        let session = bluer::Session::new().await?;
        match adapter_name {
            Some(name) => session.adapter(name),
            None => session.default_adapter().await,
        }
    }

    fn adapter(&self) -> Result<&Adapter, RadioFault> {
        self.adapter.as_ref().ok_or(RadioFault::Unavailable)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Drop for BluezRadio {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        for (_, task) in registry(&self.scans).drain() {
            task.abort();
        }
        // AdvertisementHandle 在 drop 时自动注销广播
    }
}

#[async_trait::async_trait]
impl Radio for BluezRadio {
    async fn capability(&self) -> CapabilityState {
        let Some(adapter) = &self.adapter else {
            return CapabilityState::Unsupported;
        };
        match adapter.is_powered().await {
            Ok(true) => CapabilityState::Enabled,
            Ok(false) => CapabilityState::Disabled,
            Err(e) => {
                debug!("Failed to query adapter power: {}", e);
                CapabilityState::Unsupported
            }
        }
    }

    fn request_enable(&self) {
        let Some(adapter) = self.adapter.clone() else {
            return;
        };
        tokio::spawn(async move {
            debug!("Powering on adapter '{}'", adapter.name());
            if let Err(e) = adapter.set_powered(true).await {
                warn!("Failed to power on adapter '{}': {}", adapter.name(), e);
            }
        });
    }

    fn is_granted(&self, _permission: Permission) -> bool {
        true
    }

    fn request_permissions(&self, permissions: &[Permission]) {
        warn!(
            "BlueZ denied {:?}; check that the user may access org.bluez over D-Bus",
            permissions
        );
    }

    async fn start_advertising(
        &self,
        params: &AdvertiseParams,
    ) -> Result<AdvertisingId, RadioFault> {
        let adapter = self.adapter()?;

        let adv = Advertisement {
            advertisement_type: if params.connectable {
                Type::Peripheral
            } else {
                Type::Broadcast
            },
            service_uuids: [params.service_uuid].into_iter().collect(),
            local_name: params
                .include_device_name
                .then(|| self.device_name.clone()),
            tx_power: Some(params.tx_power.dbm()),
            min_interval: Some(params.interval),
            max_interval: Some(params.interval),
            ..Default::default()
        };

        let handle = adapter.advertise(adv).await.map_err(advertise_fault)?;
        let id = self.next_id();
        registry(&self.advertisements).insert(id, handle);
        info!(
            "Advertising {} as '{}' on '{}'",
            params.service_uuid,
            self.device_name,
            adapter.name()
        );
        Ok(id)
    }

    async fn stop_advertising(&self, id: AdvertisingId) -> Result<(), RadioFault> {
        let handle = registry(&self.advertisements).remove(&id);
        if handle.is_some() {
            debug!("Advertisement {} unregistered", id);
        }
        Ok(())
    }

    async fn start_scan(
        &self,
        params: &ScanParams,
        reports: mpsc::UnboundedSender<ScanReport>,
    ) -> Result<ScanId, RadioFault> {
        let adapter = self.adapter()?.clone();

        let filter = DiscoveryFilter {
            uuids: HashSet::from([params.service_uuid]),
            transport: DiscoveryTransport::Le,
            duplicate_data: params.mode == ScanMode::LowLatency,
            ..Default::default()
        };
        adapter
            .set_discovery_filter(filter)
            .await
            .map_err(scan_fault)?;
        let discoverer = adapter
            .discover_devices_with_changes()
            .await
            .map_err(scan_fault)?;

        let id = self.next_id();
        let task = tokio::spawn(run_discovery(
            adapter,
            discoverer,
            params.service_uuid,
            reports,
        ));
        registry(&self.scans).insert(id, task);
        Ok(id)
    }

    async fn stop_scan(&self, id: ScanId) -> Result<(), RadioFault> {
        let task = registry(&self.scans).remove(&id);
        // 丢弃发现流即停止 BlueZ discovery
        if let Some(task) = task {
            task.abort();
            debug!("Scan {} stopped", id);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<PlatformEvent> {
        self.events.subscribe()
    }
}

/// 句柄表毒化时沿用内部数据，已注册的句柄不能丢
fn registry<T>(table: &Mutex<T>) -> MutexGuard<'_, T> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn run_discovery(
    adapter: Adapter,
    discoverer: impl Stream<Item = AdapterEvent> + Send + 'static,
    service_uuid: Uuid,
    reports: mpsc::UnboundedSender<ScanReport>,
) {
    futures_util::pin_mut!(discoverer);
    let mut device_events: SelectAll<DeviceEvents> = SelectAll::new();
    let mut tracked: HashSet<Address> = HashSet::new();

    loop {
        let addr = tokio::select! {
            event = discoverer.next() => match event {
                Some(AdapterEvent::DeviceAdded(addr)) => {
                    if tracked.insert(addr) {
                        match watch_device(&adapter, addr).await {
                            Ok(events) => device_events.push(events),
                            Err(e) => {
                                debug!("Cannot watch device {}: {}", addr, e);
                                tracked.remove(&addr);
                            }
                        }
                    }
                    addr
                }
                Some(AdapterEvent::DeviceRemoved(addr)) => {
                    tracked.remove(&addr);
                    continue;
                }
                Some(_) => continue,
                None => break,
            },
            Some((addr, event)) = device_events.next(), if !device_events.is_empty() => {
                match event {
                    DeviceEvent::PropertyChanged(property)
                        if tracked.contains(&addr) && is_fresh_advertisement(&property) =>
                    {
                        addr
                    }
                    _ => continue,
                }
            }
        };

        match advertisement_report(&adapter, addr, service_uuid).await {
            Ok(Some(report)) => {
                if reports.send(ScanReport::Single(report)).is_err() {
                    return;
                }
            }
            Ok(None) => trace!("{} is not a live {} advertiser", addr, service_uuid),
            Err(e) => debug!("Failed to read device {}: {}", addr, e),
        }
    }

    warn!("BlueZ discovery stream ended");
    let _ = reports.send(ScanReport::Failed(scan_failure::INTERNAL_ERROR));
}

async fn watch_device(adapter: &Adapter, addr: Address) -> bluer::Result<DeviceEvents> {
    let events = adapter.device(addr)?.events().await?;
    Ok(Box::pin(events.map(move |event| (addr, event))))
}

/// 只有随广播包更新的属性才代表一次新的观测
fn is_fresh_advertisement(property: &DeviceProperty) -> bool {
    matches!(
        property,
        DeviceProperty::Rssi(_)
            | DeviceProperty::ServiceData(_)
            | DeviceProperty::ManufacturerData(_)
    )
}

async fn advertisement_report(
    adapter: &Adapter,
    addr: Address,
    service_uuid: Uuid,
) -> bluer::Result<Option<AdvertisementReport>> {
    let device = adapter.device(addr)?;
    let uuids = device.uuids().await?.unwrap_or_default();
    let rssi = device.rssi().await?;
    Ok(live_report(addr, uuids, rssi, service_uuid))
}

/// 缓存设备没有 RSSI；UUID 再确认一次，BlueZ 的过滤对缓存设备不生效
fn live_report(
    addr: Address,
    uuids: HashSet<Uuid>,
    rssi: Option<i16>,
    service_uuid: Uuid,
) -> Option<AdvertisementReport> {
    if rssi.is_none() || !uuids.contains(&service_uuid) {
        return None;
    }
    Some(AdvertisementReport {
        address: addr.to_string(),
        service_uuids: uuids.into_iter().collect(),
        rssi,
        received_at: SystemTime::now(),
    })
}

async fn watch_adapter(adapter: Adapter, events: broadcast::Sender<PlatformEvent>) {
    let stream = match adapter.events().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Cannot watch adapter '{}': {}", adapter.name(), e);
            return;
        }
    };
    futures_util::pin_mut!(stream);

    while let Some(event) = stream.next().await {
        if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
            let state = if powered {
                CapabilityState::Enabled
            } else {
                CapabilityState::Disabled
            };
            info!("Adapter '{}' powered={}", adapter.name(), powered);
            let _ = events.send(PlatformEvent::CapabilityChanged(state));
        }
    }

    warn!("Adapter '{}' went away", adapter.name());
    let _ = events.send(PlatformEvent::CapabilityChanged(
        CapabilityState::Unsupported,
    ));
}

fn advertise_fault(err: bluer::Error) -> RadioFault {
    debug!("BlueZ advertise error: {:?}", err);
    match err.kind {
        ErrorKind::NotAuthorized | ErrorKind::NotPermitted => RadioFault::NotPermitted,
        ErrorKind::NotReady | ErrorKind::NotAvailable => RadioFault::Unavailable,
        ErrorKind::InvalidLength => RadioFault::Code(advertise_failure::DATA_TOO_LARGE),
        ErrorKind::AlreadyExists => RadioFault::Code(advertise_failure::ALREADY_STARTED),
        ErrorKind::NotSupported => RadioFault::Code(advertise_failure::FEATURE_UNSUPPORTED),
        _ => RadioFault::Code(advertise_failure::INTERNAL_ERROR),
    }
}

fn scan_fault(err: bluer::Error) -> RadioFault {
    debug!("BlueZ discovery error: {:?}", err);
    match err.kind {
        ErrorKind::NotAuthorized | ErrorKind::NotPermitted => RadioFault::NotPermitted,
        ErrorKind::NotReady | ErrorKind::NotAvailable => RadioFault::Unavailable,
        ErrorKind::InProgress => RadioFault::Code(scan_failure::ALREADY_STARTED),
        ErrorKind::NotSupported => RadioFault::Code(scan_failure::FEATURE_UNSUPPORTED),
        _ => RadioFault::Code(scan_failure::INTERNAL_ERROR),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::SERVICE_UUID;

    #[test]
    fn test_permission_errors_map_to_not_permitted() {
        let err = bluer::Error {
            kind: ErrorKind::NotAuthorized,
            message: "denied".to_string(),
        };
        assert_eq!(advertise_fault(err), RadioFault::NotPermitted);
    }

    #[test]
    fn test_unknown_errors_map_to_internal_code() {
        let err = bluer::Error {
            kind: ErrorKind::Failed,
            message: "boom".to_string(),
        };
        assert_eq!(
            scan_fault(err),
            RadioFault::Code(scan_failure::INTERNAL_ERROR)
        );
    }

    #[test]
    fn test_cached_device_without_rssi_is_not_observed() {
        let addr = Address::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let uuids = HashSet::from([SERVICE_UUID]);

        assert!(live_report(addr, uuids.clone(), None, SERVICE_UUID).is_none());

        let report = live_report(addr, uuids, Some(-60), SERVICE_UUID).unwrap();
        assert_eq!(report.address, "AA:BB:CC:DD:EE:FF");
        assert_eq!(report.rssi, Some(-60));
    }

    #[test]
    fn test_other_service_is_not_observed() {
        let addr = Address::new([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        let other = Uuid::from_u128(0x0000_180d_0000_1000_8000_0080_5f9b_34fb);
        assert!(live_report(addr, HashSet::from([other]), Some(-40), SERVICE_UUID).is_none());
    }

    #[test]
    fn test_repeat_advertisement_properties() {
        assert!(is_fresh_advertisement(&DeviceProperty::Rssi(-70)));
        assert!(is_fresh_advertisement(&DeviceProperty::ServiceData(
            HashMap::new()
        )));
        assert!(!is_fresh_advertisement(&DeviceProperty::Connected(true)));
    }

    #[test]
    fn test_poisoned_registry_keeps_entries() {
        let table = Mutex::new(HashMap::from([(1u64, "advertisement")]));
        let _ = std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    let _guard = table.lock().unwrap();
                    panic!("poison");
                })
                .join()
        });
        assert!(table.is_poisoned());

        registry(&table).insert(2, "scan");
        assert_eq!(registry(&table).len(), 2);
    }

    #[tokio::test]
    #[ignore = "requires BlueZ adapter"]
    async fn test_advertise_on_real_adapter() {
        let radio = BluezRadio::open(None, "beaconbridge-test").await;
        assert_eq!(radio.capability().await, CapabilityState::Enabled);

        let id = radio
            .start_advertising(&AdvertiseParams::beacon(SERVICE_UUID))
            .await
            .unwrap();
        radio.stop_advertising(id).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires BlueZ adapter"]
    async fn test_scan_on_real_adapter() {
        let radio = BluezRadio::open(None, "beaconbridge-test").await;
        let (tx, _rx) = mpsc::unbounded_channel();

        let id = radio
            .start_scan(&ScanParams::low_latency(SERVICE_UUID), tx)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        radio.stop_scan(id).await.unwrap();
    }
}
