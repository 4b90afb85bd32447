//! Roomdrop Relay
//!
//! 信令中继服务:
//! - `GET /signal/{room_id}` 升级为 WebSocket，按房间转发消息
//! - `GET /health` 健康检查

use anyhow::Result;
use clap::Parser;
use roomdrop_core::RelayServer;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "roomdrop-relay", version, about = "Roomdrop 信令中继")]
struct Args {
    /// 监听地址
    #[arg(short, long, env = "ROOMDROP_BIND", default_value = "0.0.0.0:8787")]
    bind: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 桥接 log crate（roomdrop-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,roomdrop_core=debug")),
        )
        .try_init();

    let args = Args::parse();
    tracing::info!("Roomdrop relay starting on {}", args.bind);

    let listener = TcpListener::bind(&args.bind).await?;
    let server = RelayServer::new();

    tokio::select! {
        res = server.serve(listener) => {
            if let Err(e) = &res {
                tracing::error!("Relay exited: {}", e);
            }
            res
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down, {} rooms open", server.registry().room_count().await);
            Ok(())
        }
    }
}
