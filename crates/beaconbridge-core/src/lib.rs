//! Beaconbridge Core Library
//!
//! 近距离发现桥的核心实现：同时广播自身 BLE 信标并扫描广播相同服务 UUID 的对端，
//! 将发现结果按顺序实时转发给 UI 层。
//!
//! # 模块
//!
//! - **ble**: 无线电能力抽象、能力检查、信标广播、对端扫描，以及 BlueZ / Loopback 后端
//! - **discovery**: 发现会话状态机、去重集合、事件投递
//! - **logging**: 生命周期诊断日志
//! - **config**: 持久化设置
//! - **ipc**: 守护进程与客户端之间的 JSON 行协议
//!
//! # 使用示例
//!
//! ```ignore
//! use beaconbridge_core::{BluezRadio, DiscoverySession, EventSink, SessionOptions};
//! use beaconbridge_core::logging::Diagnostics;
//!
//! let radio = Arc::new(BluezRadio::open(None, "my-laptop").await);
//! let (sink, _delivery) = EventSink::spawn(|event: &BridgeEvent| {
//!     println!("{}", event.script_call());
//!     Ok(())
//! });
//! let session = DiscoverySession::new(radio, sink, Diagnostics::default(), SessionOptions::default());
//!
//! session.start().await?;
//! // ... PeerDetected 事件通过 sink 到达 UI
//! session.stop().await;
//! ```

pub mod ble;
pub mod config;
pub mod discovery;
pub mod error;
pub mod ipc;
pub mod logging;

// BLE re-exports
pub use ble::{
    AdvertisementReport, BeaconBroadcaster, BluezRadio, BroadcastHandle, CapabilityGate,
    CapabilityState, LoopbackRadio, PeerObservation, PeerScanner, Permission, PlatformEvent,
    REQUIRED_PERMISSIONS, Radio, RadioFault, SERVICE_UUID, ScanEvent, ScanHandle, ScanReport,
};

// Discovery re-exports
pub use discovery::{
    BridgeEvent, DiscoverySession, EventSink, SeenPeerSet, SessionOptions, SessionState, UiBridge,
};

pub use config::{BridgeSettings, RadioBackend};
pub use error::DiscoveryError;
