//! IPC 协议 - 守护进程与客户端之间的 Unix Socket JSON 行协议
//!
//! 每个请求/响应占一行。`subscribe` 之后连接保持打开，
//! 守护进程逐行推送 `event` 响应，直到客户端断开。

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::discovery::{BridgeEvent, SessionState};
use crate::logging::{LogEntry, LogLevel};

pub fn socket_path() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join("beaconbridge.sock")
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum IpcRequest {
    #[serde(rename = "start")]
    Start,
    #[serde(rename = "stop")]
    Stop,
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "subscribe")]
    Subscribe,
    #[serde(rename = "diagnostics")]
    Diagnostics { min_level: Option<LogLevel> },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum IpcResponse {
    #[serde(rename = "ok")]
    Ok { message: String },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "status")]
    Status {
        state: SessionState,
        seen_peers: usize,
        last_fault: Option<String>,
        /// 等待无线电开启后自动重试启动
        pending_start: bool,
    },
    #[serde(rename = "event")]
    Event { event: BridgeEvent },
    #[serde(rename = "diagnostics")]
    Diagnostics { entries: Vec<LogEntry> },
}

/// 写一行 JSON
pub async fn write_line<W, T>(writer: &mut W, message: &T) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    writer
        .write_all(serde_json::to_string(message)?.as_bytes())
        .await?;
    writer.write_all(b"\n").await?;
    Ok(())
}

/// 读一行 JSON，对端关闭时返回 `None`
pub async fn read_line<R, T>(reader: &mut R) -> anyhow::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&line)?))
}
