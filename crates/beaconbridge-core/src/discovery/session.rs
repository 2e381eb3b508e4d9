//! 发现会话状态机
//!
//! ```text
//! Idle -> Starting -> Active -> Stopping -> Idle
//! ```
//!
//! - `start()` 只在 `Idle` 下生效，其它状态下为空操作
//! - `stop()` 只在 `Active` 下生效，`Idle` 下为空操作
//! - `Active` 期间广播器和扫描器句柄同时存在
//!
//! 状态迁移和去重集合的修改在同一把 `tokio::sync::Mutex` 下完成，
//! 迁移期间一直持锁。每次进入或离开 `Active` 都会推进 `generation`，
//! 与停止过程赛跑的扫描回调因代数不符被丢弃，不会把对端重新加入刚清空的集合。
//!
//! 授权被撤销、无线电关闭或消失时会话自动走停止流程（降级），
//! 故障记录在 [`DiscoverySession::last_fault`]。

use log::{debug, info, trace, warn};

use crate::ble::{
    BeaconBroadcaster, BroadcastHandle, CapabilityGate, CapabilityState, PeerObservation,
    PeerScanner, PlatformEvent, REQUIRED_PERMISSIONS, Radio, SERVICE_UUID, ScanEvent, ScanHandle,
};
use crate::discovery::{BridgeEvent, EventSink, SeenPeerSet};
use crate::error::DiscoveryError;
use crate::logging::{Diagnostics, LifecycleEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Stopping,
}

/// 会话选项
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub service_uuid: Uuid,
    /// 单个 Active 期内扫描失败后的最多重启次数，用尽后会话降级停止
    pub scan_restart_attempts: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            service_uuid: SERVICE_UUID,
            scan_restart_attempts: 1,
        }
    }
}

struct SessionCore {
    state: SessionState,
    broadcast: Option<BroadcastHandle>,
    scan: Option<ScanHandle>,
    seen: SeenPeerSet,
    generation: u64,
    cancel: Option<CancellationToken>,
    scan_restarts: u32,
    last_fault: Option<DiscoveryError>,
}

struct Shared {
    gate: CapabilityGate,
    broadcaster: BeaconBroadcaster,
    scanner: PeerScanner,
    sink: EventSink,
    diagnostics: Diagnostics,
    options: SessionOptions,
    core: Mutex<SessionCore>,
    state_tx: watch::Sender<SessionState>,
}

/// 发现会话
///
/// 构造没有副作用，何时 `start()` 由调用方决定。
pub struct DiscoverySession {
    shared: Arc<Shared>,
}

impl DiscoverySession {
    pub fn new(
        radio: Arc<dyn Radio>,
        sink: EventSink,
        diagnostics: Diagnostics,
        options: SessionOptions,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            shared: Arc::new(Shared {
                gate: CapabilityGate::new(radio.clone()),
                broadcaster: BeaconBroadcaster::new(radio.clone(), diagnostics.clone()),
                scanner: PeerScanner::new(radio, diagnostics.clone()),
                sink,
                diagnostics,
                options,
                core: Mutex::new(SessionCore {
                    state: SessionState::Idle,
                    broadcast: None,
                    scan: None,
                    seen: SeenPeerSet::new(),
                    generation: 0,
                    cancel: None,
                    scan_restarts: 0,
                    last_fault: None,
                }),
                state_tx,
            }),
        }
    }

    /// 启动广播和扫描
    ///
    /// 已经是 `Starting`/`Active` 时直接返回 `Ok(())`。任一方启动失败时
    /// 回滚另一方，会话保持 `Idle` 并返回该错误。
    pub async fn start(&self) -> Result<(), DiscoveryError> {
        let mut core = self.shared.core.lock().await;
        if core.state != SessionState::Idle {
            debug!("Start ignored, session is {:?}", core.state);
            return Ok(());
        }

        self.shared.set_state(&mut core, SessionState::Starting);
        let platform_events = self.shared.gate.subscribe();

        match self.shared.bring_up().await {
            Ok((broadcast, scan, scan_events)) => {
                core.broadcast = Some(broadcast);
                core.scan = Some(scan);
                core.generation += 1;
                core.scan_restarts = 0;
                core.last_fault = None;

                let cancel = CancellationToken::new();
                tokio::spawn(Shared::pump(
                    self.shared.clone(),
                    scan_events,
                    core.generation,
                    cancel.clone(),
                ));
                tokio::spawn(Shared::watch_platform(
                    self.shared.clone(),
                    platform_events,
                    core.generation,
                    cancel.clone(),
                ));
                core.cancel = Some(cancel);

                self.shared.set_state(&mut core, SessionState::Active);
                self.shared.diagnostics.record(LifecycleEvent::SessionActive);
                info!("Discovery session active");
                Ok(())
            }
            Err(e) => {
                warn!("Discovery session failed to start: {}", e);
                core.last_fault = Some(e.clone());
                self.shared.set_state(&mut core, SessionState::Idle);
                Err(e)
            }
        }
    }

    /// 停止广播和扫描，清空去重集合并通知 UI
    ///
    /// 非 `Active` 时为空操作。
    pub async fn stop(&self) {
        self.shared.teardown(None, None).await;
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    /// 平台开关/授权通知，调用方据此决定何时重试 `start()`
    pub fn platform_events(&self) -> broadcast::Receiver<PlatformEvent> {
        self.shared.gate.subscribe()
    }

    pub async fn seen_count(&self) -> usize {
        self.shared.core.lock().await.seen.len()
    }

    /// 最近一次启动失败或降级停止的原因，成功启动后清除
    pub async fn last_fault(&self) -> Option<DiscoveryError> {
        self.shared.core.lock().await.last_fault.clone()
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.shared.diagnostics
    }
}

impl Drop for DiscoverySession {
    fn drop(&mut self) {
        // 会话句柄丢失后后台任务随之退出；无线电句柄只能通过 stop() 释放
        if let Ok(mut core) = self.shared.core.try_lock() {
            if let Some(cancel) = core.cancel.take() {
                cancel.cancel();
            }
        }
    }
}

impl Shared {
    fn set_state(&self, core: &mut SessionCore, state: SessionState) {
        core.state = state;
        self.state_tx.send_replace(state);
    }

    async fn bring_up(
        &self,
    ) -> Result<(BroadcastHandle, ScanHandle, mpsc::UnboundedReceiver<ScanEvent>), DiscoveryError>
    {
        self.gate.require_ready().await?;
        self.gate.require_permissions()?;

        let service = self.options.service_uuid;
        let (scan_tx, scan_rx) = mpsc::unbounded_channel();
        let (broadcast, scan) = tokio::join!(
            self.broadcaster.start(service),
            self.scanner.start(service, scan_tx)
        );

        match (broadcast, scan) {
            (Ok(broadcast), Ok(scan)) => Ok((broadcast, scan, scan_rx)),
            (Ok(broadcast), Err(e)) => {
                debug!("Rolling back advertising after scan failure");
                self.broadcaster.stop(broadcast).await;
                Err(e)
            }
            (Err(e), Ok(scan)) => {
                debug!("Rolling back scan after advertising failure");
                self.scanner.stop(scan).await;
                Err(e)
            }
            (Err(e), Err(_)) => Err(e),
        }
    }

    /// 停止流程，`generation` 不为空时只对该代 Active 期生效
    async fn teardown(&self, generation: Option<u64>, fault: Option<DiscoveryError>) -> bool {
        let mut core = self.core.lock().await;
        if core.state != SessionState::Active {
            debug!("Stop ignored, session is {:?}", core.state);
            return false;
        }
        if generation.is_some_and(|g| g != core.generation) {
            return false;
        }
        self.teardown_locked(&mut core, fault).await;
        true
    }

    /// 调用方持有 `core` 锁且会话处于 `Active`
    async fn teardown_locked(&self, core: &mut SessionCore, fault: Option<DiscoveryError>) {
        self.set_state(core, SessionState::Stopping);
        core.generation += 1;
        if let Some(cancel) = core.cancel.take() {
            cancel.cancel();
        }

        // 两者独立停止，一方失败不影响另一方
        let broadcast = core.broadcast.take();
        let scan = core.scan.take();
        tokio::join!(
            async {
                if let Some(handle) = broadcast {
                    self.broadcaster.stop(handle).await;
                }
            },
            async {
                if let Some(handle) = scan {
                    self.scanner.stop(handle).await;
                }
            }
        );

        let cleared = core.seen.len();
        core.seen.clear();
        self.sink.deliver(BridgeEvent::PeersCleared);

        if let Some(fault) = fault {
            warn!("Discovery session torn down: {}", fault);
            self.diagnostics
                .record(LifecycleEvent::SessionDegraded(fault.clone()));
            core.last_fault = Some(fault);
        }

        self.set_state(core, SessionState::Idle);
        self.diagnostics
            .record(LifecycleEvent::SessionIdle { cleared });
        info!("Discovery session idle");
    }

    async fn observe(&self, generation: u64, observation: PeerObservation) {
        let mut core = self.core.lock().await;
        if core.state != SessionState::Active || core.generation != generation {
            trace!("Dropping stale observation of {}", observation.address);
            return;
        }

        if core.seen.record(&observation) {
            info!(
                "Peer detected: {} (rssi={:?})",
                observation.address, observation.rssi
            );
            // 持锁投递，保证与 PeersCleared 的先后顺序
            self.sink
                .deliver(BridgeEvent::peer_detected(observation.address));
        } else {
            trace!("Suppressing repeat of {}", observation.address);
        }
    }

    /// 扫描失败后按预算重启，返回新的事件接收端；预算用尽则降级停止
    async fn restart_scan(
        &self,
        generation: u64,
        code: i32,
    ) -> Option<mpsc::UnboundedReceiver<ScanEvent>> {
        let mut core = self.core.lock().await;
        if core.state != SessionState::Active || core.generation != generation {
            return None;
        }

        if let Some(failed) = core.scan.take() {
            self.scanner.stop(failed).await;
        }

        if core.scan_restarts >= self.options.scan_restart_attempts {
            self.teardown_locked(&mut core, Some(DiscoveryError::ScanFailed(code)))
                .await;
            return None;
        }
        core.scan_restarts += 1;
        info!(
            "Restarting scan after failure code {} (attempt {}/{})",
            code, core.scan_restarts, self.options.scan_restart_attempts
        );

        let (scan_tx, scan_rx) = mpsc::unbounded_channel();
        match self.scanner.start(self.options.service_uuid, scan_tx).await {
            Ok(handle) => {
                core.scan = Some(handle);
                Some(scan_rx)
            }
            Err(e) => {
                self.teardown_locked(&mut core, Some(e)).await;
                None
            }
        }
    }

    async fn pump(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<ScanEvent>,
        generation: u64,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                ScanEvent::Observed(observation) => self.observe(generation, observation).await,
                ScanEvent::Failed(code) => match self.restart_scan(generation, code).await {
                    Some(restarted) => events = restarted,
                    None => break,
                },
            }
        }
        debug!("Scan pump for generation {} finished", generation);
    }

    async fn watch_platform(
        self: Arc<Self>,
        mut events: broadcast::Receiver<PlatformEvent>,
        generation: u64,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => event,
            };

            let fault = match event {
                Ok(PlatformEvent::PermissionRevoked(permission))
                    if REQUIRED_PERMISSIONS.contains(&permission) =>
                {
                    DiscoveryError::PermissionDenied(vec![permission])
                }
                Ok(PlatformEvent::CapabilityChanged(CapabilityState::Disabled)) => {
                    DiscoveryError::RadioDisabled
                }
                Ok(PlatformEvent::CapabilityChanged(CapabilityState::Unsupported)) => {
                    DiscoveryError::RadioUnavailable
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(missed)) => {
                    // 错过的通知无法重放，直接重新检查当前状态
                    warn!("Missed {} platform event(s), re-checking radio", missed);
                    match self.recheck().await {
                        Some(fault) => fault,
                        None => continue,
                    }
                }
                Err(RecvError::Closed) => break,
            };

            self.teardown(Some(generation), Some(fault)).await;
            break;
        }
        debug!("Platform watcher for generation {} finished", generation);
    }

    /// 只查询不请求开启，开关或授权任一不满足都视为故障
    async fn recheck(&self) -> Option<DiscoveryError> {
        match self.gate.capability().await {
            CapabilityState::Unsupported => return Some(DiscoveryError::RadioUnavailable),
            CapabilityState::Disabled => return Some(DiscoveryError::RadioDisabled),
            CapabilityState::Enabled => {}
        }
        let missing = self.gate.missing_permissions();
        (!missing.is_empty()).then(|| DiscoveryError::PermissionDenied(missing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::{AdvertisementReport, LoopbackRadio, Permission, RadioFault, scan_failure};
    use std::time::Duration;

    fn session(radio: &Arc<LoopbackRadio>) -> (DiscoverySession, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (sink, events) = EventSink::channel();
        let session = DiscoverySession::new(
            radio.clone(),
            sink,
            Diagnostics::default(),
            SessionOptions::default(),
        );
        (session, events)
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<BridgeEvent>) -> BridgeEvent {
        tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("sink closed")
    }

    async fn wait_for_state(session: &DiscoverySession, state: SessionState) {
        let mut rx = session.subscribe_state();
        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|s| *s == state))
            .await
            .expect("timed out waiting for state")
            .expect("state channel closed");
    }

    #[tokio::test]
    async fn test_construction_has_no_side_effects() {
        let radio = Arc::new(LoopbackRadio::new());
        let (session, _events) = session(&radio);

        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(radio.active_advertisements(), 0);
        assert_eq!(radio.active_scans(), 0);
    }

    #[tokio::test]
    async fn test_scan_start_failure_rolls_back_advertising() {
        let radio = Arc::new(LoopbackRadio::new());
        radio.fail_next_scan(RadioFault::Code(scan_failure::APPLICATION_REGISTRATION_FAILED));
        let (session, _events) = session(&radio);

        assert_eq!(
            session.start().await,
            Err(DiscoveryError::ScanFailed(
                scan_failure::APPLICATION_REGISTRATION_FAILED
            ))
        );
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(radio.active_advertisements(), 0);
        assert_eq!(radio.active_scans(), 0);
    }

    #[tokio::test]
    async fn test_advertise_failure_rolls_back_scan() {
        let radio = Arc::new(LoopbackRadio::new());
        radio.fail_next_advertise(RadioFault::Code(4));
        let (session, _events) = session(&radio);

        assert_eq!(session.start().await, Err(DiscoveryError::StartFailed(4)));
        assert_eq!(radio.active_scans(), 0);
        assert_eq!(
            session.last_fault().await,
            Some(DiscoveryError::StartFailed(4))
        );

        // 调用方重试
        session.start().await.unwrap();
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.last_fault().await, None);
    }

    #[tokio::test]
    async fn test_missing_grant_never_touches_radio() {
        let radio = Arc::new(LoopbackRadio::new());
        radio.revoke(Permission::FineLocation);
        let (session, _events) = session(&radio);

        assert_eq!(
            session.start().await,
            Err(DiscoveryError::PermissionDenied(vec![Permission::FineLocation]))
        );
        assert!(radio.advertising_params().is_empty());
        assert_eq!(radio.active_scans(), 0);
        assert_eq!(radio.permission_requests(), vec![Permission::FineLocation]);
    }

    #[tokio::test]
    async fn test_scan_failure_restarts_once_then_degrades() {
        let radio = Arc::new(LoopbackRadio::new());
        let (session, mut events) = session(&radio);
        session.start().await.unwrap();

        radio.advertise(AdvertisementReport::new("AA:AA:AA:AA:AA:AA", SERVICE_UUID));
        assert_eq!(
            next_event(&mut events).await,
            BridgeEvent::peer_detected("AA:AA:AA:AA:AA:AA")
        );

        // 第一次失败：扫描被重启，已见集合保留
        radio.fail_scans(scan_failure::INTERNAL_ERROR);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(radio.active_scans(), 1);

        radio.advertise(AdvertisementReport::new("AA:AA:AA:AA:AA:AA", SERVICE_UUID));
        radio.advertise(AdvertisementReport::new("BB:BB:BB:BB:BB:BB", SERVICE_UUID));
        assert_eq!(
            next_event(&mut events).await,
            BridgeEvent::peer_detected("BB:BB:BB:BB:BB:BB")
        );

        // 第二次失败：预算用尽，降级停止
        radio.fail_scans(scan_failure::INTERNAL_ERROR);
        assert_eq!(next_event(&mut events).await, BridgeEvent::PeersCleared);
        wait_for_state(&session, SessionState::Idle).await;
        assert_eq!(
            session.last_fault().await,
            Some(DiscoveryError::ScanFailed(scan_failure::INTERNAL_ERROR))
        );
        assert_eq!(radio.active_advertisements(), 0);
        assert_eq!(radio.active_scans(), 0);
    }

    #[tokio::test]
    async fn test_radio_disabled_while_active_tears_down() {
        let radio = Arc::new(LoopbackRadio::new());
        let (session, mut events) = session(&radio);
        session.start().await.unwrap();

        radio.set_capability(CapabilityState::Disabled);

        assert_eq!(next_event(&mut events).await, BridgeEvent::PeersCleared);
        wait_for_state(&session, SessionState::Idle).await;
        assert_eq!(
            session.last_fault().await,
            Some(DiscoveryError::RadioDisabled)
        );
    }

    #[tokio::test]
    async fn test_disable_lost_in_lagged_notices_still_tears_down() {
        let radio = Arc::new(LoopbackRadio::new());
        let (session, mut events) = session(&radio);
        session.start().await.unwrap();

        // 关闭通知被后续通知挤出平台事件缓冲
        radio.set_capability(CapabilityState::Disabled);
        for _ in 0..40 {
            radio.grant(Permission::Connect);
        }

        assert_eq!(next_event(&mut events).await, BridgeEvent::PeersCleared);
        wait_for_state(&session, SessionState::Idle).await;
        assert_eq!(
            session.last_fault().await,
            Some(DiscoveryError::RadioDisabled)
        );
        // 故障检查不会替用户请求开启
        assert_eq!(radio.enable_requests(), 0);
    }

    #[tokio::test]
    async fn test_observation_racing_stop_is_dropped() {
        let radio = Arc::new(LoopbackRadio::new());
        let (session, mut events) = session(&radio);
        session.start().await.unwrap();

        // 持锁期间让观测进入 pump，pump 在锁上排队
        let mut core = session.shared.core.lock().await;
        assert_eq!(
            radio.advertise(AdvertisementReport::new("DD:DD:DD:DD:DD:DD", SERVICE_UUID)),
            1
        );
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        // 停止先拿到锁
        session.shared.teardown_locked(&mut core, None).await;
        drop(core);

        assert_eq!(next_event(&mut events).await, BridgeEvent::PeersCleared);
        assert!(
            tokio::time::timeout(Duration::from_millis(100), events.recv())
                .await
                .is_err()
        );
        assert_eq!(session.seen_count().await, 0);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_exhausted_restart_never_exposes_active_without_scan() {
        let radio = Arc::new(LoopbackRadio::new());
        let options = SessionOptions {
            scan_restart_attempts: 0,
            ..SessionOptions::default()
        };
        let (sink, mut events) = EventSink::channel();
        let session = DiscoverySession::new(radio.clone(), sink, Diagnostics::default(), options);
        session.start().await.unwrap();

        let mut states = session.subscribe_state();
        radio.fail_scans(scan_failure::INTERNAL_ERROR);

        assert_eq!(next_event(&mut events).await, BridgeEvent::PeersCleared);
        // 降级过程中每个被观察到的 Active 状态都同时持有两个句柄
        loop {
            if *states.borrow_and_update() == SessionState::Idle {
                break;
            }
            let core = session.shared.core.lock().await;
            if core.state == SessionState::Active {
                assert!(core.scan.is_some() && core.broadcast.is_some());
            }
            drop(core);
            states.changed().await.unwrap();
        }
        assert_eq!(
            session.last_fault().await,
            Some(DiscoveryError::ScanFailed(scan_failure::INTERNAL_ERROR))
        );
    }

    #[tokio::test]
    async fn test_observations_after_stop_are_dropped() {
        let radio = Arc::new(LoopbackRadio::new());
        let (session, mut events) = session(&radio);
        session.start().await.unwrap();
        session.stop().await;
        assert_eq!(next_event(&mut events).await, BridgeEvent::PeersCleared);

        // 扫描已注销，广播不会到达
        assert_eq!(
            radio.advertise(AdvertisementReport::new("CC:CC:CC:CC:CC:CC", SERVICE_UUID)),
            0
        );
        assert_eq!(session.seen_count().await, 0);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_state_transitions_are_published() {
        let radio = Arc::new(LoopbackRadio::new());
        let (session, _events) = session(&radio);
        let mut states = session.subscribe_state();

        session.start().await.unwrap();
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), SessionState::Active);

        session.stop().await;
        assert_eq!(*states.borrow_and_update(), SessionState::Idle);
    }
}
