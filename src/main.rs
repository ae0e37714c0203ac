use clap::Parser;
use kanti::api;
use kanti::models::ProxyConfig;
use kanti::proxy::ProxyServer;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "kanti-backend")]
#[command(about = "Intercepting HTTP/HTTPS proxy backend", long_about = None)]
struct Args {
  /// Data directory for CA material
  #[arg(long, value_name = "PATH")]
  data: Option<PathBuf>,

  /// Control-plane listen port
  #[arg(long = "ipc-port", default_value_t = api::DEFAULT_IPC_PORT)]
  ipc_port: u16,

  /// Initial proxy port
  #[arg(long = "proxy-port", default_value_t = 8080)]
  proxy_port: u16,
}

#[tokio::main]
async fn main() -> ExitCode {
  let args = Args::parse();

  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kanti=info")),
    )
    .init();

  match run(args).await {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      error!("fatal: {}", e);
      ExitCode::FAILURE
    }
  }
}

async fn run(args: Args) -> kanti::Result<()> {
  let data_dir = args.data.unwrap_or_else(default_data_dir);
  info!(data_dir = %data_dir.display(), ipc_port = args.ipc_port, proxy_port = args.proxy_port, "starting kanti backend");

  tokio::fs::create_dir_all(&data_dir).await?;

  let config = ProxyConfig {
    port: args.proxy_port,
    ..Default::default()
  };

  // CA load/generate failures are fatal here, before anything listens
  let server = ProxyServer::new(&data_dir, config).await?;
  info!(ca = %server.certificate_path(), "proxy initialized");

  api::serve(server.clone(), args.ipc_port, shutdown_signal()).await?;

  if server.is_running().await {
    info!("stopping proxy server");
    if let Err(e) = server.stop().await {
      error!("error stopping proxy server: {}", e);
    }
  }

  info!("shutdown complete");
  Ok(())
}

fn default_data_dir() -> PathBuf {
  dirs::home_dir()
    .map(|home| home.join(".kanti"))
    .unwrap_or_else(|| PathBuf::from("./data"))
}

async fn shutdown_signal() {
  let ctrl_c = async {
    if signal::ctrl_c().await.is_err() {
      error!("failed to install Ctrl+C handler");
      std::future::pending::<()>().await;
    }
  };

  #[cfg(unix)]
  let terminate = async {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
      Ok(mut sigterm) => {
        sigterm.recv().await;
      }
      Err(_) => std::future::pending::<()>().await,
    }
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => info!("received interrupt signal"),
    _ = terminate => info!("received terminate signal"),
  }
}
