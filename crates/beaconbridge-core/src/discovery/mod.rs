//! 发现会话
//!
//! 把广播器和扫描器编排为一个逻辑会话，负责去重并按顺序把事件交给 UI。

pub mod seen;
pub mod session;
pub mod sink;

pub use seen::SeenPeerSet;
pub use session::{DiscoverySession, SessionOptions, SessionState};
pub use sink::{BridgeEvent, EventSink, UiBridge};
