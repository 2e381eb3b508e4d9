//! 平台无线电能力抽象
//!
//! 广播、扫描、开关状态和授权都由平台提供，这里只定义会话依赖的最小接口。
//! 平台回调统一建模为 channel：扫描结果写入调用方提供的 `mpsc` 发送端，
//! 开关/授权变化通过 `broadcast` 通知。
//!
//! 已有实现：
//! - [`BluezRadio`](super::BluezRadio): Linux BlueZ (D-Bus)
//! - [`LoopbackRadio`](super::LoopbackRadio): 进程内软件无线电

use super::{CapabilityState, Permission};
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

pub type AdvertisingId = u64;
pub type ScanId = u64;

/// 底层无线电故障，由广播器/扫描器翻译成 [`DiscoveryError`](crate::DiscoveryError)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RadioFault {
    #[error("radio unavailable")]
    Unavailable,

    #[error("operation not permitted")]
    NotPermitted,

    #[error("platform failure code {0}")]
    Code(i32),

    #[error("{0}")]
    Other(String),
}

/// 发射功率档位 (dBm)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPowerLevel {
    UltraLow,
    Low,
    Medium,
    High,
}

impl TxPowerLevel {
    pub fn dbm(self) -> i16 {
        match self {
            TxPowerLevel::UltraLow => -21,
            TxPowerLevel::Low => -15,
            TxPowerLevel::Medium => -7,
            TxPowerLevel::High => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    LowPower,
    Balanced,
    LowLatency,
}

/// 广播参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertiseParams {
    pub service_uuid: Uuid,
    pub interval: Duration,
    pub tx_power: TxPowerLevel,
    pub connectable: bool,
    pub include_device_name: bool,
}

impl AdvertiseParams {
    /// 低延迟间隔
    pub const LOW_LATENCY_INTERVAL: Duration = Duration::from_millis(100);

    /// 信标广播策略：固定，不接受调用方配置
    ///
    /// 最低延迟、最高功率、不可连接（仅存在性广播）、携带设备名和服务 UUID。
    pub fn beacon(service_uuid: Uuid) -> Self {
        Self {
            service_uuid,
            interval: Self::LOW_LATENCY_INTERVAL,
            tx_power: TxPowerLevel::High,
            connectable: false,
            include_device_name: true,
        }
    }
}

/// 扫描参数，过滤条件下推到无线电层
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanParams {
    pub service_uuid: Uuid,
    pub mode: ScanMode,
}

impl ScanParams {
    pub fn low_latency(service_uuid: Uuid) -> Self {
        Self {
            service_uuid,
            mode: ScanMode::LowLatency,
        }
    }
}

/// 无线电层上报的一条广播
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementReport {
    pub address: String,
    pub service_uuids: Vec<Uuid>,
    pub rssi: Option<i16>,
    pub received_at: SystemTime,
}

impl AdvertisementReport {
    pub fn new(address: impl Into<String>, service_uuid: Uuid) -> Self {
        Self {
            address: address.into(),
            service_uuids: vec![service_uuid],
            rssi: None,
            received_at: SystemTime::now(),
        }
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }
}

/// 扫描回调
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanReport {
    Single(AdvertisementReport),
    /// 批量结果，按接收顺序排列
    Batch(Vec<AdvertisementReport>),
    /// 该扫描已终止，不会自动恢复
    Failed(i32),
}

/// 平台级通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    CapabilityChanged(CapabilityState),
    PermissionRevoked(Permission),
    PermissionGranted(Permission),
}

/// 平台无线电
#[async_trait::async_trait]
pub trait Radio: Send + Sync + 'static {
    async fn capability(&self) -> CapabilityState;

    /// 请求平台开启无线电（可能弹出用户提示），不等待结果
    fn request_enable(&self);

    fn is_granted(&self, permission: Permission) -> bool;

    /// 请求平台授予权限，不等待结果
    fn request_permissions(&self, permissions: &[Permission]);

    async fn start_advertising(&self, params: &AdvertiseParams)
    -> Result<AdvertisingId, RadioFault>;

    async fn stop_advertising(&self, id: AdvertisingId) -> Result<(), RadioFault>;

    /// 开始扫描，匹配的广播写入 `reports`，直到 `stop_scan` 或上报 `ScanReport::Failed`
    async fn start_scan(
        &self,
        params: &ScanParams,
        reports: mpsc::UnboundedSender<ScanReport>,
    ) -> Result<ScanId, RadioFault>;

    async fn stop_scan(&self, id: ScanId) -> Result<(), RadioFault>;

    fn subscribe(&self) -> broadcast::Receiver<PlatformEvent>;
}
