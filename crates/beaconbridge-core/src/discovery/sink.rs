//! 事件投递
//!
//! 所有事件经过同一个无界 channel，由唯一的投递任务依次交给 UI 桥，
//! 因此 UI 看到的顺序与会话产生的顺序一致。投递不等待 UI 确认，
//! UI 侧失败只记录日志，不会反过来阻断发现流程。

use log::{debug, warn};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// 发往 UI 的事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BridgeEvent {
    PeerDetected { address: String },
    PeersCleared,
}

impl BridgeEvent {
    pub fn peer_detected(address: impl Into<String>) -> Self {
        BridgeEvent::PeerDetected {
            address: address.into(),
        }
    }

    /// UI 桥上的处理函数名
    pub fn name(&self) -> &'static str {
        match self {
            BridgeEvent::PeerDetected { .. } => "handleDetectedDevice",
            BridgeEvent::PeersCleared => "clearDetectedDevices",
        }
    }

    /// 渲染为 UI 桥脚本调用，例如 `handleDetectedDevice('AA:BB:CC:DD:EE:FF')`
    pub fn script_call(&self) -> String {
        match self {
            BridgeEvent::PeerDetected { address } => {
                let escaped = address.replace('\\', "\\\\").replace('\'', "\\'");
                format!("{}('{}')", self.name(), escaped)
            }
            BridgeEvent::PeersCleared => format!("{}()", self.name()),
        }
    }
}

/// 外部 UI 协作方
pub trait UiBridge: Send + 'static {
    fn invoke(&mut self, event: &BridgeEvent) -> anyhow::Result<()>;
}

impl<F> UiBridge for F
where
    F: FnMut(&BridgeEvent) -> anyhow::Result<()> + Send + 'static,
{
    fn invoke(&mut self, event: &BridgeEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// 事件投递端，本身无状态，可随意克隆
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<BridgeEvent>,
}

impl EventSink {
    /// 启动投递任务，所有事件在该任务上依次调用 `bridge`
    pub fn spawn<B: UiBridge>(bridge: B) -> (Self, JoinHandle<()>) {
        let (sink, rx) = Self::channel();
        let task = tokio::spawn(run_delivery(rx, bridge));
        (sink, task)
    }

    /// 由调用方自己在指定执行上下文中消费事件
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn deliver(&self, event: BridgeEvent) {
        if let Err(e) = self.tx.send(event) {
            warn!("UI collaborator is gone, dropping {:?}", e.0);
        }
    }
}

async fn run_delivery<B: UiBridge>(mut rx: mpsc::UnboundedReceiver<BridgeEvent>, mut bridge: B) {
    while let Some(event) = rx.recv().await {
        if let Err(e) = bridge.invoke(&event) {
            warn!("UI bridge failed to handle {}: {:#}", event.name(), e);
        }
    }
    debug!("Event delivery finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_script_call_rendering() {
        assert_eq!(
            BridgeEvent::peer_detected("AA:BB:CC:DD:EE:FF").script_call(),
            "handleDetectedDevice('AA:BB:CC:DD:EE:FF')"
        );
        assert_eq!(
            BridgeEvent::PeersCleared.script_call(),
            "clearDetectedDevices()"
        );
        assert_eq!(
            BridgeEvent::peer_detected("a'b").script_call(),
            "handleDetectedDevice('a\\'b')"
        );
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_string(&BridgeEvent::peer_detected("AA:BB")).unwrap();
        assert_eq!(json, r#"{"event":"peer_detected","address":"AA:BB"}"#);

        let cleared: BridgeEvent = serde_json::from_str(r#"{"event":"peers_cleared"}"#).unwrap();
        assert_eq!(cleared, BridgeEvent::PeersCleared);
    }

    #[tokio::test]
    async fn test_failures_are_swallowed_and_order_kept() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let log = received.clone();
        let (sink, task) = EventSink::spawn(move |event: &BridgeEvent| {
            log.lock().unwrap().push(event.clone());
            if matches!(event, BridgeEvent::PeerDetected { address } if address == "bad") {
                anyhow::bail!("page torn down");
            }
            Ok(())
        });

        sink.deliver(BridgeEvent::peer_detected("one"));
        sink.deliver(BridgeEvent::peer_detected("bad"));
        sink.deliver(BridgeEvent::peer_detected("two"));
        sink.deliver(BridgeEvent::PeersCleared);
        drop(sink);
        task.await.unwrap();

        assert_eq!(
            *received.lock().unwrap(),
            vec![
                BridgeEvent::peer_detected("one"),
                BridgeEvent::peer_detected("bad"),
                BridgeEvent::peer_detected("two"),
                BridgeEvent::PeersCleared,
            ]
        );
    }

    #[test]
    fn test_deliver_after_ui_gone_does_not_panic() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.deliver(BridgeEvent::PeersCleared);
    }
}
