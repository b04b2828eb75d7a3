use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use content_publish_rust::{
    config::AppConfig,
    logging, server,
    storage::AssetMetadata,
    uploader::{Asset, OrchestrationReport},
    AppState,
};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use walkdir::WalkDir;

#[derive(Parser)]
#[command(name = "content-publish-rust")]
#[command(about = "内容寻址资产的冗余发布工具", long_about = None)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, global = true, default_value = "config/app.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// 启动诊断 API 服务（默认）
    Serve,

    /// 发布文件或目录下的所有文件
    Upload {
        /// 文件或目录
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// 失败的资产再重试一轮
        #[arg(long)]
        retry: bool,
    },
}

/// 展开目录，保持输入顺序
fn collect_assets(paths: &[PathBuf]) -> Vec<Asset> {
    let mut assets = Vec::new();
    for path in paths {
        for entry in WalkDir::new(path).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("遍历目录失败: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            assets.push(Asset::from_file(
                entry.into_path(),
                AssetMetadata::named(name),
            ));
        }
    }
    assets
}

async fn serve(state: AppState) -> Result<()> {
    let background = state.spawn_background_tasks();
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let app = server::router(state.clone());

    info!("诊断服务启动在: http://{}", addr);
    info!("API 基础路径: http://{}/api/v1", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("绑定地址失败: {}", addr))?;

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                error!("服务器错误: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl+C，开始优雅关闭...");
        }
    }

    state.shutdown();
    for handle in background {
        if let Err(e) = handle.await {
            warn!("后台任务退出异常: {}", e);
        }
    }
    info!("应用已安全退出");
    Ok(())
}

async fn upload(state: AppState, paths: Vec<PathBuf>, retry: bool) -> Result<()> {
    let assets = collect_assets(&paths);
    if assets.is_empty() {
        anyhow::bail!("没有找到可上传的文件");
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到 Ctrl+C，取消剩余上传");
            ctrl_c.cancel();
        }
    });

    // 先探测一轮，让候选节点按实测延迟排序
    state
        .registry
        .check_all(state.client.as_ref(), &state.limiter)
        .await;

    let mut report = state.orchestrator.run(&assets, &cancel).await;
    if retry && report.failure_count() > 0 && !cancel.is_cancelled() {
        let retried = state.orchestrator.retry_failed(&assets, &report, &cancel).await;
        report = merge_retry(report, retried);
    }

    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.failure_count() > 0 {
        anyhow::bail!(
            "{} 个资产上传失败（共 {} 个）",
            report.failure_count(),
            assets.len()
        );
    }
    Ok(())
}

/// 用重试结果覆盖首轮的失败项
///
/// 重试报告中的任务按首轮失败项的顺序排列
fn merge_retry(mut first: OrchestrationReport, retried: OrchestrationReport) -> OrchestrationReport {
    let indices: Vec<usize> = first.failed.iter().map(|f| f.index).collect();
    for (task, index) in retried.tasks.into_iter().zip(indices) {
        first.tasks[index] = task;
    }
    first.failed = retried.failed;
    first.succeeded.extend(retried.succeeded);
    first.succeeded.sort_by_key(|s| s.index);
    first.batches.extend(retried.batches);
    first
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match AppConfig::load_from_file(&cli.config).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("配置文件加载失败，使用默认配置: {:#}", e);
            AppConfig::default()
        }
    };

    // 必须保持 _log_guard 存活
    let _log_guard = logging::init_logging(&config.log);
    info!("content-publish-rust v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let state = AppState::new(config)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(state).await,
        Commands::Upload { paths, retry } => upload(state, paths, retry).await,
    }
}
