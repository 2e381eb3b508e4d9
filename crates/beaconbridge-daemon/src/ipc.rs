//! IPC Server - Unix Domain Socket 通信

use anyhow::Result;
use beaconbridge_core::ipc::{IpcRequest, IpcResponse, read_line, write_line};
use beaconbridge_core::logging::LogLevel;
use futures_util::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::service::Bridge;

pub async fn run_ipc_server(path: PathBuf, bridge: Arc<Bridge>) -> Result<()> {
    // 删除旧的 socket 文件
    let _ = std::fs::remove_file(&path);

    let listener = UnixListener::bind(&path)?;
    tracing::info!("IPC 服务器已启动: {:?}", path);

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let bridge = bridge.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, bridge).await {
                        tracing::debug!("客户端连接结束: {:#}", e);
                    }
                });
            }
            Err(e) => {
                tracing::warn!("接受连接失败: {}", e);
            }
        }
    }
}

async fn handle_client(stream: UnixStream, bridge: Arc<Bridge>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    loop {
        let request: IpcRequest = match read_line(&mut reader).await {
            Ok(Some(req)) => req,
            Ok(None) => break,
            Err(e) if e.is::<serde_json::Error>() => {
                let resp = IpcResponse::Error {
                    message: format!("Invalid request: {}", e),
                };
                write_line(&mut writer, &resp).await?;
                continue;
            }
            Err(e) => return Err(e),
        };

        tracing::debug!("收到请求: {:?}", request);

        let response = match request {
            IpcRequest::Start => match bridge.start().await {
                Ok(()) => IpcResponse::Ok {
                    message: "发现已启动".to_string(),
                },
                Err(e) if bridge.pending_start() => IpcResponse::Error {
                    message: format!("{}，恢复后将自动重试", e),
                },
                Err(e) => IpcResponse::Error {
                    message: e.to_string(),
                },
            },
            IpcRequest::Stop => {
                bridge.stop().await;
                IpcResponse::Ok {
                    message: "已停止".to_string(),
                }
            }
            IpcRequest::Status => bridge.status().await,
            IpcRequest::Diagnostics { min_level } => IpcResponse::Diagnostics {
                entries: bridge
                    .session()
                    .diagnostics()
                    .entries(min_level.unwrap_or(LogLevel::Trace)),
            },
            IpcRequest::Subscribe => {
                write_line(
                    &mut writer,
                    &IpcResponse::Ok {
                        message: "已订阅".to_string(),
                    },
                )
                .await?;
                stream_events(&mut reader, &mut writer, &bridge).await?;
                break;
            }
        };

        write_line(&mut writer, &response).await?;
    }

    Ok(())
}

/// 逐行推送会话事件，客户端发送任意内容或断开时结束
async fn stream_events<R>(
    reader: &mut R,
    writer: &mut OwnedWriteHalf,
    bridge: &Bridge,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    tracing::info!("IPC 订阅者已连接");
    let mut events = BroadcastStream::new(bridge.subscribe());
    let mut line = String::new();

    loop {
        tokio::select! {
            read = reader.read_line(&mut line) => {
                read?;
                break;
            }
            event = events.next() => match event {
                Some(Ok(event)) => write_line(writer, &IpcResponse::Event { event }).await?,
                Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                    tracing::warn!("订阅者落后，丢弃 {} 条事件", missed);
                }
                None => break,
            },
        }
    }

    tracing::info!("IPC 订阅者已断开");
    Ok(())
}
