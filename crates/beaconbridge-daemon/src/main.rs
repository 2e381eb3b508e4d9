//! Beaconbridge Daemon
//!
//! 后台守护进程，负责：
//! - 持有发现会话（BLE 广播 + 扫描）
//! - 无线电开启后自动重试挂起的启动
//! - 通过 Unix Socket 与 CLI 通信

mod ipc;
mod service;

use anyhow::Result;
use beaconbridge_core::BridgeSettings;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = BridgeSettings::load();

    // 桥接 log crate（beaconbridge-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    // 初始化日志，RUST_LOG 优先于配置文件
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.log_filter)),
        )
        .try_init();

    tracing::info!(
        "Beaconbridge Daemon starting (backend: {:?}, device: {})",
        settings.backend,
        settings.device_name
    );

    let radio = service::open_radio(&settings).await;
    let bridge = service::Bridge::new(radio, &settings);

    let socket = settings
        .socket_path
        .clone()
        .unwrap_or_else(beaconbridge_core::ipc::socket_path);

    // 启动 IPC 服务器
    let ipc_handle = tokio::spawn(ipc::run_ipc_server(socket.clone(), bridge.clone()));

    // 监听无线电开关和授权变化
    let retry_handle = tokio::spawn(bridge.clone().run_retry_loop());

    // 等待任一任务完成或收到退出信号
    tokio::select! {
        res = ipc_handle => {
            tracing::error!("IPC server exited: {:?}", res);
        }
        res = retry_handle => {
            tracing::error!("Retry loop exited: {:?}", res);
        }
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutting down...");
        }
    }

    bridge.stop().await;
    let _ = std::fs::remove_file(&socket);

    Ok(())
}
