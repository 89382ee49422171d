use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use ws_seq::config::Config;
use ws_seq::core::{MemoryUserDirectory, StaticIdentity, UserId};
use ws_seq::index::WorkspaceRegistry;
use ws_seq::query::QueryServer;
use ws_seq::storage::SnapshotStore;

#[derive(Parser)]
#[command(name = "ws-seq")]
#[command(about = "Workspace registry with per-workspace update sequences")]
#[command(version)]
struct Cli {
    /// 配置文件（toml）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 覆盖配置中的 data_dir
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// 覆盖 HTTP 端口
    #[arg(short, long)]
    port: Option<u16>,

    /// 覆盖默认 workspace id
    #[arg(long)]
    default_workspace: Option<u64>,

    /// 启动时（默认 workspace 不存在）作为其 owner 的用户
    #[arg(long, default_value_t = 1)]
    bootstrap_user: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = match &cli.config {
        Some(p) => Config::load(p)?,
        None => Config::default(),
    };
    if let Some(d) = cli.data_dir {
        cfg.data_dir = d;
    }
    if let Some(p) = cli.port {
        cfg.http_port = p;
    }
    if let Some(id) = cli.default_workspace {
        cfg.default_workspace = id;
    }

    info!(
        "Starting ws-seq: data_dir={:?} default_workspace={}",
        cfg.data_dir, cfg.default_workspace
    );

    let users = Arc::new(MemoryUserDirectory::from_users(cfg.user_list()));
    let store = Arc::new(SnapshotStore::new(cfg.snapshot_path()));
    let mut registry = WorkspaceRegistry::load_or_empty(&store, cfg.default_workspace_id()).await?;
    // 未配置用户时不做 owner 引用检查
    if !users.is_empty() {
        info!("Owner references checked against {} configured users", users.len());
        registry = registry.with_users(users.clone());
    }
    registry.attach_wal(cfg.wal_dir())?;
    let registry = Arc::new(registry);

    let live = registry.ensure_default_workspace(&StaticIdentity(UserId(cli.bootstrap_user)))?;
    info!(
        "Default workspace {:?} (id={}) at update_seq {}",
        live.machine_name(),
        cfg.default_workspace,
        live.update_seq(registry.sequences())
    );

    // 周期快照
    tokio::spawn(
        registry
            .clone()
            .snapshot_loop(store.clone(), cfg.snapshot_interval_secs),
    );

    // 查询服务 (HTTP)
    let server = QueryServer::new(registry.clone(), users, UserId(cfg.anonymous_user));
    let port = cfg.http_port;
    tokio::spawn(async move {
        if let Err(e) = server.run(port).await {
            tracing::error!("HTTP server stopped: {}", e);
        }
    });

    info!(
        "ws-seq ready. Query via: http://localhost:{}/workspaces",
        cfg.http_port
    );

    // 优雅退出：落最后一次快照
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    registry.snapshot_now(&store).await?;
    info!("\n{}", registry.report());

    Ok(())
}
