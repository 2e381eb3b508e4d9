//! Beaconbridge CLI
//!
//! 命令行客户端，通过 Unix Socket 与守护进程通信

mod client;

use anyhow::Result;
use beaconbridge_core::BridgeSettings;
use beaconbridge_core::ipc::{IpcRequest, IpcResponse};
use beaconbridge_core::logging::LogLevel;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "beaconbridge", version, about = "BLE 近场发现桥")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 开始广播并扫描附近设备
    Start,
    /// 停止发现
    Stop,
    /// 查看会话状态
    Status,
    /// 持续输出发现事件
    Watch {
        /// 以 UI 脚本调用形式输出
        #[arg(long)]
        script: bool,
    },
    /// 查看生命周期诊断记录
    Diagnostics {
        /// 最低输出级别 (error/warn/info/debug/trace)
        #[arg(short, long)]
        level: Option<LogLevel>,
    },
    /// 查看或初始化配置文件
    Config {
        /// 把当前（或默认）配置写入配置文件
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = BridgeSettings::load();

    match cli.command {
        Commands::Start => {
            println!("📡 启动发现");
            client::send_request(&settings, IpcRequest::Start).await?;
        }
        Commands::Stop => {
            println!("⏹️  停止发现");
            client::send_request(&settings, IpcRequest::Stop).await?;
        }
        Commands::Status => {
            let resp = client::send_request(&settings, IpcRequest::Status).await?;
            if let IpcResponse::Status {
                state,
                seen_peers,
                last_fault,
                pending_start,
            } = resp
            {
                println!("状态: {:?}", state);
                println!("已发现设备: {}", seen_peers);
                if pending_start {
                    println!("⏳ 等待无线电或授权恢复后自动启动");
                }
                if let Some(fault) = last_fault {
                    println!("最近故障: {}", fault);
                }
            }
        }
        Commands::Watch { script } => {
            let mut conn = client::Connection::open(&settings).await?;
            conn.send(&IpcRequest::Subscribe).await?;
            println!("🔍 等待发现事件 (Ctrl-C 退出)...");

            while let Some(resp) = conn.next().await? {
                match resp {
                    IpcResponse::Event { event } if script => println!("{}", event.script_call()),
                    IpcResponse::Event { event } => println!("{}", serde_json::to_string(&event)?),
                    IpcResponse::Error { message } => eprintln!("❌ {}", message),
                    _ => {}
                }
            }
        }
        Commands::Diagnostics { level } => {
            let resp =
                client::send_request(&settings, IpcRequest::Diagnostics { min_level: level })
                    .await?;
            if let IpcResponse::Diagnostics { entries } = resp {
                if entries.is_empty() {
                    println!("   暂无记录");
                }
                for entry in entries {
                    println!("[{:>5}] {}", entry.level.name(), entry.message);
                }
            }
        }
        Commands::Config { init } => {
            if init {
                settings.save()?;
                println!("✅ 配置已写入 {:?}", BridgeSettings::config_path());
            } else {
                println!("# {:?}", BridgeSettings::config_path());
                print!("{}", toml::to_string_pretty(&settings)?);
            }
        }
    }

    Ok(())
}
