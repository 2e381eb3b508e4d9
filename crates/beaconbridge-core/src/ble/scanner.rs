//! 对端扫描器
//!
//! 以低延迟模式扫描携带服务 UUID 的广播。过滤在无线电层完成，
//! 不匹配的广播不会到达这里。
//!
//! # 上报
//!
//! 单条与批量结果都按接收顺序拆成一条条 [`ScanEvent::Observed`]，
//! 每条广播恰好对应一个观测。平台报告的扫描失败以 [`ScanEvent::Failed`]
//! 上报，对该句柄是终止性的，调用方需要显式 `stop` 后重新 `start`。

use log::{debug, trace, warn};

use crate::ble::{Permission, PeerObservation, Radio, RadioFault, ScanId, ScanParams, ScanReport};
use crate::error::DiscoveryError;
use crate::logging::{Diagnostics, LifecycleEvent};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// 扫描器向观察者上报的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Observed(PeerObservation),
    Failed(i32),
}

/// 一次成功扫描的句柄
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanHandle {
    token: u64,
    scan: ScanId,
}

struct ActiveScan {
    token: u64,
    relay: JoinHandle<()>,
}

pub struct PeerScanner {
    radio: Arc<dyn Radio>,
    diagnostics: Diagnostics,
    active: Mutex<Option<ActiveScan>>,
    next_token: AtomicU64,
}

impl PeerScanner {
    pub fn new(radio: Arc<dyn Radio>, diagnostics: Diagnostics) -> Self {
        Self {
            radio,
            diagnostics,
            active: Mutex::new(None),
            next_token: AtomicU64::new(1),
        }
    }

    pub async fn start(
        &self,
        service_uuid: Uuid,
        observer: mpsc::UnboundedSender<ScanEvent>,
    ) -> Result<ScanHandle, DiscoveryError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(DiscoveryError::AlreadyActive);
        }

        if !self.radio.is_granted(Permission::Scan) {
            self.radio.request_permissions(&[Permission::Scan]);
            let err = DiscoveryError::PermissionDenied(vec![Permission::Scan]);
            self.diagnostics
                .record(LifecycleEvent::ScanStartFailed(err.clone()));
            return Err(err);
        }

        let params = ScanParams::low_latency(service_uuid);
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        debug!("Starting peer scan: {:?}", params);

        match self.radio.start_scan(&params, reports_tx).await {
            Ok(scan) => {
                let token = self.next_token.fetch_add(1, Ordering::Relaxed);
                let relay = tokio::spawn(relay_reports(
                    reports_rx,
                    observer,
                    self.diagnostics.clone(),
                ));
                *active = Some(ActiveScan { token, relay });
                self.diagnostics.record(LifecycleEvent::ScanStarted {
                    service: service_uuid,
                });
                Ok(ScanHandle { token, scan })
            }
            Err(fault) => {
                let err = translate(fault);
                self.diagnostics
                    .record(LifecycleEvent::ScanStartFailed(err.clone()));
                Err(err)
            }
        }
    }

    pub async fn stop(&self, handle: ScanHandle) {
        let mut active = self.active.lock().await;
        let current = match active.take() {
            Some(current) if current.token == handle.token => current,
            other => {
                *active = other;
                debug!("Ignoring stop for inactive scan handle {:?}", handle);
                return;
            }
        };

        current.relay.abort();
        if let Err(e) = self.radio.stop_scan(handle.scan).await {
            warn!("Failed to stop scan: {}", e);
        }
        self.diagnostics.record(LifecycleEvent::ScanStopped);
    }

    pub async fn is_active(&self) -> bool {
        self.active.lock().await.is_some()
    }
}

/// 单一任务按接收顺序转发，保证批量结果不被重排
async fn relay_reports(
    mut reports: mpsc::UnboundedReceiver<ScanReport>,
    observer: mpsc::UnboundedSender<ScanEvent>,
    diagnostics: Diagnostics,
) {
    while let Some(report) = reports.recv().await {
        match report {
            ScanReport::Single(advertisement) => {
                trace!("Advertisement from {}", advertisement.address);
                if observer
                    .send(ScanEvent::Observed(advertisement.into()))
                    .is_err()
                {
                    break;
                }
            }
            ScanReport::Batch(batch) => {
                trace!("Batch of {} advertisement(s)", batch.len());
                for advertisement in batch {
                    if observer
                        .send(ScanEvent::Observed(advertisement.into()))
                        .is_err()
                    {
                        return;
                    }
                }
            }
            ScanReport::Failed(code) => {
                diagnostics.record(LifecycleEvent::ScanFailed(code));
                let _ = observer.send(ScanEvent::Failed(code));
                break;
            }
        }
    }
    debug!("Scan relay finished");
}

fn translate(fault: RadioFault) -> DiscoveryError {
    match fault {
        RadioFault::Unavailable => DiscoveryError::RadioUnavailable,
        RadioFault::NotPermitted => DiscoveryError::PermissionDenied(vec![Permission::Scan]),
        RadioFault::Code(code) => DiscoveryError::ScanFailed(code),
        RadioFault::Other(message) => DiscoveryError::Platform(message),
    }
}
