use anyhow::{Context, Result};
use kitstore_upload::{
    logging, AppConfig, KitScanner, LocalObjectStore, MemoryCatalog, SessionStore,
    UploadOrchestrator,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 配置文件路径
const CONFIG_PATH: &str = "config/app.toml";

fn usage() -> ! {
    eprintln!("用法: kitstore-upload <音色包文件夹> [标题]");
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let kit_dir = match args.next() {
        Some(dir) => PathBuf::from(dir),
        None => usage(),
    };

    let config = AppConfig::load_or_default(CONFIG_PATH)
        .await
        .with_context(|| format!("加载配置失败: {}", CONFIG_PATH))?;

    // 🔥 必须保持 _log_guard 存活
    let _log_guard = logging::init_logging(&config.log);

    let kit_name = kit_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "kit".to_string());
    let title = args.next().unwrap_or_else(|| kit_name.clone());

    info!("Kitstore Upload v{} 启动中...", env!("CARGO_PKG_VERSION"));

    // 服务端：本地对象存储 + 会话存储 + 过期回收
    let backend = LocalObjectStore::new(&config.session.staging_dir, &config.session.object_dir)
        .await
        .context("初始化本地对象存储失败")?;
    let sessions = Arc::new(SessionStore::new(
        Arc::new(backend),
        config.session.idle_timeout(),
    ));
    let shutdown = CancellationToken::new();
    let reaper = sessions
        .clone()
        .spawn_reaper(config.session.reap_interval(), shutdown.clone());

    let catalog = Arc::new(MemoryCatalog::new());
    let orchestrator =
        UploadOrchestrator::new(&config.upload, config.progress, sessions.clone(), catalog)
            .context("创建上传编排器失败")?;

    // 进度事件输出为 JSON 行
    let mut events = orchestrator.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!("序列化进度事件失败: {}", e),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("进度事件积压，跳过 {} 条", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let files = KitScanner::new().scan(&kit_dir)?;
    let tasks = KitScanner::into_tasks(&kit_name, files);
    if tasks.is_empty() {
        anyhow::bail!("音色包中没有可上传的文件: {}", kit_dir.display());
    }

    // Ctrl+C 取消任务
    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，取消上传...");
            ctrl_c_cancel.cancel();
        }
    });

    let report = orchestrator.submit(&title, tasks, cancel).await;

    // 关闭事件通道，等待输出完成
    drop(orchestrator);
    let _ = printer.await;
    shutdown.cancel();
    let _ = reaper.await;

    let report = report.context("上传任务无法开始")?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Err(e) = report.into_result() {
        error!("上传结束: {}", e);
        return Err(e.into());
    }

    info!("上传完成");
    Ok(())
}
