//! IPC Client - 与守护进程通信

use anyhow::Result;
use beaconbridge_core::BridgeSettings;
use beaconbridge_core::ipc::{self, IpcRequest, IpcResponse, read_line, write_line};
use tokio::io::BufReader;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

/// 已连接的守护进程会话
pub struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Connection {
    pub async fn open(settings: &BridgeSettings) -> Result<Self> {
        let path = settings
            .socket_path
            .clone()
            .unwrap_or_else(ipc::socket_path);

        let stream = match UnixStream::connect(&path).await {
            Ok(s) => s,
            Err(e) => {
                eprintln!("❌ 无法连接到守护进程: {}", e);
                eprintln!("   请确保 beaconbridge-daemon 正在运行 ({:?})", path);
                return Err(e.into());
            }
        };

        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    pub async fn send(&mut self, request: &IpcRequest) -> Result<()> {
        write_line(&mut self.writer, request).await
    }

    /// 读取下一条响应，守护进程关闭连接时返回 `None`
    pub async fn next(&mut self) -> Result<Option<IpcResponse>> {
        read_line(&mut self.reader).await
    }
}

pub async fn send_request(settings: &BridgeSettings, request: IpcRequest) -> Result<IpcResponse> {
    let mut conn = Connection::open(settings).await?;
    conn.send(&request).await?;

    let Some(response) = conn.next().await? else {
        anyhow::bail!("守护进程提前关闭了连接");
    };

    match &response {
        IpcResponse::Ok { message } => println!("✅ {}", message),
        IpcResponse::Error { message } => eprintln!("❌ {}", message),
        _ => {}
    }

    Ok(response)
}
