pub mod advertiser;
pub mod bluez;
pub mod capability;
pub mod loopback;
pub mod radio;
pub mod scanner;

pub use advertiser::{BeaconBroadcaster, BroadcastHandle};
pub use bluez::BluezRadio;
pub use capability::CapabilityGate;
pub use loopback::LoopbackRadio;
pub use radio::{
    AdvertiseParams, AdvertisementReport, AdvertisingId, PlatformEvent, Radio, RadioFault,
    ScanId, ScanMode, ScanParams, ScanReport, TxPowerLevel,
};
pub use scanner::{PeerScanner, ScanEvent, ScanHandle};

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

/// 本应用信标的服务 UUID，广播端与扫描端必须完全一致，不做协商
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);

/// 平台授权项
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Scan,
    Advertise,
    Connect,
    FineLocation,
}

/// 启动会话前必须全部持有的授权
pub const REQUIRED_PERMISSIONS: [Permission; 4] = [
    Permission::Scan,
    Permission::Advertise,
    Permission::Connect,
    Permission::FineLocation,
];

/// 无线电子系统状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityState {
    /// 没有蓝牙硬件或协议栈
    Unsupported,
    /// 有硬件但未开启
    Disabled,
    Enabled,
}

/// 广播启动失败码
pub mod advertise_failure {
    pub const DATA_TOO_LARGE: i32 = 1;
    pub const TOO_MANY_ADVERTISERS: i32 = 2;
    pub const ALREADY_STARTED: i32 = 3;
    pub const INTERNAL_ERROR: i32 = 4;
    pub const FEATURE_UNSUPPORTED: i32 = 5;
}

/// 扫描失败码
pub mod scan_failure {
    pub const ALREADY_STARTED: i32 = 1;
    pub const APPLICATION_REGISTRATION_FAILED: i32 = 2;
    pub const INTERNAL_ERROR: i32 = 3;
    pub const FEATURE_UNSUPPORTED: i32 = 4;
    pub const OUT_OF_HARDWARE_RESOURCES: i32 = 5;
}

/// 一次扫描回调对应的对端观测，会话立即消费，不做持久化
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerObservation {
    /// 对端无线电地址，对会话而言是不透明字符串
    pub address: String,
    pub observed_at: SystemTime,
    pub rssi: Option<i16>,
}

impl PeerObservation {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            observed_at: SystemTime::now(),
            rssi: None,
        }
    }
}

impl From<AdvertisementReport> for PeerObservation {
    fn from(report: AdvertisementReport) -> Self {
        Self {
            address: report.address,
            observed_at: report.received_at,
            rssi: report.rssi,
        }
    }
}
