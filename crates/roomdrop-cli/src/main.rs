//! Roomdrop CLI
//!
//! 命令行客户端: 按房间号发送和接收文件，管理存储网关上的文件

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use roomdrop_core::share::ProgressPhase;
use roomdrop_core::storage::sweep_expired;
use roomdrop_core::{
    AppSettings, ChannelShareCallback, HttpGateway, ReceiveEvent, ReceiverEvent, ShareEvent,
    ShareItem, ShareOrchestrator, ShareReceiver, ShareState, StorageGateway, StoredObjectMeta,
    WebRtcConnector,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "roomdrop", version, about = "Roomdrop - 按房间号的点对点文件分享")]
struct Cli {
    /// 信令中继地址 (覆盖配置文件)
    #[arg(long, global = true, env = "ROOMDROP_RELAY")]
    relay: Option<String>,
    /// 存储网关地址 (覆盖配置文件)
    #[arg(long, global = true, env = "ROOMDROP_GATEWAY")]
    gateway: Option<String>,
    /// 输出详细日志
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 发送文件
    Send {
        /// 要发送的文件路径
        file: PathBuf,
        /// 房间号 (不指定则随机生成)
        #[arg(short, long)]
        room: Option<String>,
        /// 直连失败时不询问，直接上传到存储
        #[arg(long)]
        fallback: bool,
    },
    /// 把存储中的文件分享给房间内的对端
    Share {
        /// 存储中的文件名
        filename: String,
        #[arg(short, long)]
        room: String,
    },
    /// 接收文件
    Receive {
        #[arg(short, long)]
        room: String,
        /// 保存目录 (默认: 配置中的下载目录)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// 从存储下载文件
    Download {
        filename: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// 列出存储中的文件
    List,
    /// 删除超过保留期的文件
    Sweep,
    /// 查看配置
    Config {
        /// 写入默认配置文件
        #[arg(long)]
        init: bool,
    },
}

fn init_logging(verbose: bool) {
    // 桥接 log crate（roomdrop-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let default = if verbose {
        "debug"
    } else {
        "warn,roomdrop_core=info"
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = AppSettings::load();
    if let Some(relay) = cli.relay {
        settings.relay_url = relay;
    }
    if let Some(gateway) = cli.gateway {
        settings.gateway_url = gateway;
    }
    init_logging(cli.verbose || settings.verbose);

    match cli.command {
        Commands::Send {
            file,
            room,
            fallback,
        } => {
            let room = room.unwrap_or_else(random_room_id);
            let item = ShareItem::from_path(&file)
                .await
                .with_context(|| format!("无法读取 {}", file.display()))?;
            println!("📤 发送文件: {} → 房间 {}", item.name(), room);
            run_share(&settings, item, &room, fallback).await?;
        }
        Commands::Share { filename, room } => {
            let gateway = gateway(&settings)?;
            let Some(meta) = gateway.get_metadata(&filename).await? else {
                bail!("存储中没有 {}", filename);
            };
            println!("🔗 分享存储文件: {} → 房间 {}", meta.filename, room);
            run_share(&settings, ShareItem::Stored(meta), &room, false).await?;
        }
        Commands::Receive { room, output } => {
            let dir = output.unwrap_or_else(|| settings.download_dir.clone());
            println!("📥 接收模式: 房间 {} (保存到: {})", room, dir.display());
            run_receive(&settings, &room, &dir).await?;
        }
        Commands::Download { filename, output } => {
            let gateway = gateway(&settings)?;
            let Some(meta) = gateway.get_metadata(&filename).await? else {
                bail!("存储中没有 {}", filename);
            };
            let dir = output.unwrap_or_else(|| settings.download_dir.clone());
            let path = download(gateway.as_ref(), &meta, &dir).await?;
            println!("✅ 已保存到 {}", path.display());
        }
        Commands::List => {
            let gateway = gateway(&settings)?;
            let mut files = gateway.list_metadata().await?;
            if files.is_empty() {
                println!("   存储中没有文件");
            }
            files.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
            for meta in files {
                println!(
                    "   {}  {:>10} B  {}  {}",
                    meta.uploaded_at.format("%Y-%m-%d %H:%M"),
                    meta.size,
                    meta.content_type,
                    meta.filename
                );
            }
        }
        Commands::Sweep => {
            let gateway = gateway(&settings)?;
            println!("🧹 清理超过 {} 天的文件...", settings.retention_days);
            let report = sweep_expired(gateway.as_ref(), chrono::Utc::now(), settings.retention()).await?;
            println!(
                "   扫描 {}，删除 {}，跳过 {}，失败 {}",
                report.scanned, report.deleted, report.skipped, report.failed
            );
        }
        Commands::Config { init } => {
            let path = AppSettings::config_path();
            if init {
                settings.save()?;
                println!("✅ 已写入 {}", path.display());
            }
            println!("配置文件: {}", path.display());
            print!("{}", toml::to_string_pretty(&settings)?);
        }
    }

    Ok(())
}

/// 8 位随机房间号，告诉对端后由对端输入
fn random_room_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn gateway(settings: &AppSettings) -> Result<Arc<HttpGateway>> {
    Ok(Arc::new(HttpGateway::new(&settings.gateway_url)?))
}

fn connector(settings: &AppSettings) -> Arc<WebRtcConnector> {
    Arc::new(
        WebRtcConnector::new(settings.relay_url.clone())
            .with_stun_servers(settings.stun_servers.clone()),
    )
}

async fn run_share(settings: &AppSettings, item: ShareItem, room: &str, fallback: bool) -> Result<()> {
    let (callback, mut events) = ChannelShareCallback::new();
    let orchestrator = ShareOrchestrator::new(
        connector(settings),
        gateway(settings)?,
        settings.share_settings(),
        Arc::new(callback),
    );
    orchestrator.share(item, room).await?;

    while let Some(event) = events.recv().await {
        match event {
            ShareEvent::Progress(progress) => {
                let label = match progress.phase {
                    ProgressPhase::Direct => "直连传输",
                    ProgressPhase::Upload => "上传",
                };
                print!("\r   {} {:>3}%", label, progress.percent);
                let _ = std::io::stdout().flush();
                if progress.percent == 100 {
                    println!();
                }
            }
            ShareEvent::Notice(notice) => println!("{}", notice),
            ShareEvent::State(state) => match state {
                ShareState::P2pConnectAttempt => println!("⏳ 等待对端加入房间..."),
                ShareState::P2pConnectedForAction => println!("🔗 已连接"),
                ShareState::ShareCompleteSuccess => {
                    drain_notices(&mut events);
                    return Ok(());
                }
                ShareState::ShareFailed => {
                    drain_notices(&mut events);
                    bail!("分享失败");
                }
                ShareState::P2pDirectTransferFailedOfferR2 => {
                    drain_notices(&mut events);
                    if fallback || confirm("改为上传到存储吗? [y/N] ").await? {
                        let meta = orchestrator.confirm_fallback().await?;
                        drain_notices(&mut events);
                        println!("   对端可以运行: roomdrop download {}", meta.filename);
                    } else {
                        orchestrator.decline_fallback()?;
                        println!("已取消");
                    }
                    return Ok(());
                }
                _ => {}
            },
        }
    }
    Ok(())
}

fn drain_notices(events: &mut tokio::sync::mpsc::UnboundedReceiver<ShareEvent>) {
    while let Ok(event) = events.try_recv() {
        if let ShareEvent::Notice(notice) = event {
            println!("{}", notice);
        }
    }
}

async fn confirm(prompt: &str) -> Result<bool> {
    print!("{}", prompt);
    std::io::stdout().flush()?;
    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    Ok(matches!(line.trim().to_lowercase().as_str(), "y" | "yes"))
}

async fn run_receive(settings: &AppSettings, room: &str, dir: &Path) -> Result<()> {
    let (receiver, mut events) =
        ShareReceiver::join(connector(settings), room, settings.transfer_settings());

    let result = loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => break Ok(()),
        };
        let Some(event) = event else {
            break Ok(());
        };

        match event {
            ReceiveEvent::Connected => println!("🔗 已连接"),
            ReceiveEvent::Text(text) => println!("💬 {}", text),
            ReceiveEvent::Transfer(ReceiverEvent::Started(descriptor)) => {
                println!("📦 接收 {} ({} B)", descriptor.name, descriptor.size);
            }
            ReceiveEvent::Transfer(ReceiverEvent::Progress { percent, .. }) => {
                print!("\r   {:>3}%", percent);
                let _ = std::io::stdout().flush();
            }
            ReceiveEvent::Transfer(ReceiverEvent::Completed(file)) => {
                println!();
                let path = save(dir, &file.descriptor.name, &file.data).await?;
                println!("✅ 已保存到 {}", path.display());
                break Ok(());
            }
            ReceiveEvent::Transfer(ReceiverEvent::TimedOut { name }) => {
                println!();
                println!("⚠️ {} 接收超时", name);
            }
            ReceiveEvent::Transfer(ReceiverEvent::Failed { name, error }) => {
                println!();
                println!("❌ {} 接收失败: {}", name, error);
            }
            ReceiveEvent::Pointer(meta) => {
                println!("🔗 对端分享了存储文件 {}", meta.filename);
                let gateway = gateway(settings)?;
                let path = download(gateway.as_ref(), &meta, dir).await?;
                println!("✅ 已保存到 {}", path.display());
                break Ok(());
            }
            ReceiveEvent::Failed(e) => break Err(anyhow::anyhow!("连接失败: {}", e)),
            ReceiveEvent::Closed => {
                println!("连接已关闭");
                break Ok(());
            }
        }
    };

    receiver.close().await;
    result
}

async fn download(gateway: &dyn StorageGateway, meta: &StoredObjectMeta, dir: &Path) -> Result<PathBuf> {
    println!("⬇️  下载 {} ({} B)", meta.filename, meta.size);
    let data = gateway.download(meta).await?;
    save(dir, &meta.filename, &data).await
}

/// 写入目录，只使用名称中的文件名部分
async fn save(dir: &Path, name: &str, data: &[u8]) -> Result<PathBuf> {
    let file_name = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "received".to_string());
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(file_name);
    tokio::fs::write(&path, data).await?;
    Ok(path)
}
