//! Bridge Service - 发现会话的宿主
//!
//! 持有唯一的 [`DiscoverySession`]，把会话事件扇出给 IPC 订阅者，
//! 并在无线电关闭或授权缺失导致启动失败后，等待平台通知自动重试。

use beaconbridge_core::logging::Diagnostics;
use beaconbridge_core::{
    BridgeEvent, BridgeSettings, BluezRadio, DiscoveryError, DiscoverySession, EventSink,
    LoopbackRadio, PlatformEvent, Radio, RadioBackend,
};
use beaconbridge_core::{CapabilityState, ipc::IpcResponse};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast};

/// IPC 订阅者的事件缓冲
const SUBSCRIBER_BUFFER: usize = 256;

pub struct Bridge {
    session: DiscoverySession,
    events: broadcast::Sender<BridgeEvent>,
    /// 启动因可恢复错误失败，等待平台通知后重试
    pending_start: AtomicBool,
    /// 串行化 start/stop/重试，`pending_start` 的检查与启动在同一临界区
    control: Mutex<()>,
}

/// 按配置打开无线电后端
pub async fn open_radio(settings: &BridgeSettings) -> Arc<dyn Radio> {
    match settings.backend {
        RadioBackend::Bluez => Arc::new(
            BluezRadio::open(settings.adapter.as_deref(), settings.device_name.clone()).await,
        ),
        RadioBackend::Loopback => {
            tracing::warn!("使用软件回环无线电，不会收发真实广播");
            Arc::new(LoopbackRadio::new().with_auto_enable())
        }
    }
}

impl Bridge {
    pub fn new(radio: Arc<dyn Radio>, settings: &BridgeSettings) -> Arc<Self> {
        let (events, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        let fanout = events.clone();
        let (sink, _delivery) = EventSink::spawn(move |event: &BridgeEvent| {
            tracing::debug!("UI 调用: {}", event.script_call());
            // 没有订阅者时事件直接丢弃
            let _ = fanout.send(event.clone());
            Ok(())
        });

        let session = DiscoverySession::new(
            radio,
            sink,
            Diagnostics::new(settings.diagnostics_capacity),
            settings.session_options(),
        );

        Arc::new(Self {
            session,
            events,
            pending_start: AtomicBool::new(false),
            control: Mutex::new(()),
        })
    }

    pub fn session(&self) -> &DiscoverySession {
        &self.session
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    pub fn pending_start(&self) -> bool {
        self.pending_start.load(Ordering::SeqCst)
    }

    /// 启动发现；可恢复的失败会挂起一次自动重试
    pub async fn start(&self) -> Result<(), DiscoveryError> {
        let _control = self.control.lock().await;
        self.start_locked().await
    }

    async fn start_locked(&self) -> Result<(), DiscoveryError> {
        match self.session.start().await {
            Ok(()) => {
                self.pending_start.store(false, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                let retry = e.is_recoverable();
                self.pending_start.store(retry, Ordering::SeqCst);
                if retry {
                    tracing::info!("启动失败 ({})，等待无线电或授权恢复后重试", e);
                }
                Err(e)
            }
        }
    }

    /// 停止发现并取消挂起的重试
    pub async fn stop(&self) {
        let _control = self.control.lock().await;
        self.pending_start.store(false, Ordering::SeqCst);
        self.session.stop().await;
    }

    pub async fn status(&self) -> IpcResponse {
        IpcResponse::Status {
            state: self.session.state(),
            seen_peers: self.session.seen_count().await,
            last_fault: self.session.last_fault().await.map(|e| e.to_string()),
            pending_start: self.pending_start(),
        }
    }

    /// 监听平台通知，挂起的启动在无线电开启或授权恢复后重试
    pub async fn run_retry_loop(self: Arc<Self>) -> anyhow::Result<()> {
        let mut platform = self.session.platform_events();
        loop {
            let event = match platform.recv().await {
                Ok(event) => Some(event),
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("错过 {} 条平台通知", missed);
                    None
                }
                Err(RecvError::Closed) => break,
            };

            let ready = match event {
                Some(PlatformEvent::CapabilityChanged(CapabilityState::Enabled))
                | Some(PlatformEvent::PermissionGranted(_))
                | None => true,
                Some(_) => false,
            };
            if !ready {
                continue;
            }

            // 用户的 stop 可能在通知到达后抢先执行，持锁后再确认
            let _control = self.control.lock().await;
            if !self.pending_start() {
                continue;
            }
            tracing::info!("平台状态变化，重试启动发现");
            if let Err(e) = self.start_locked().await {
                tracing::warn!("重试启动失败: {}", e);
            }
        }
        tracing::warn!("平台通知通道已关闭");
        Ok(())
    }
}
