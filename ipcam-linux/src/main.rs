// IPCam Linux: peer registry, worker and media proxy bridge daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use ipcam_core::{
    Catalog, Central, Context, DeviceFamily, FileStorage, IpCamFamily, ListenInfo, LogSink, Worker,
};
use ipcam_linux::{config, server};
use tokio::net::TcpListener;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const DEFAULT_LOG_FILTER: &str = "ipcam_linux=info,ipcam_core=info";

fn init_tracing(cfg: &config::Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directive = cfg.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER);
        tracing_subscriber::EnvFilter::try_new(directive)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("ipcam-linux {}", VERSION);
            return Ok(());
        }
    }

    let cfg = config::load();
    init_tracing(&cfg);
    tracing::info!(version = VERSION, "IPCam daemon starting");

    if let Some(dir) = cfg.data_file.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let storage = FileStorage::open(&cfg.data_file)
        .with_context(|| format!("opening {}", cfg.data_file.display()))?;
    let mut catalog = Catalog::builtin().context("loading built-in catalog")?;
    if let Some(dir) = &cfg.catalog_dir {
        match catalog.load_dir(dir) {
            Ok(n) => tracing::info!(dir = %dir.display(), count = n, "Loaded device descriptions"),
            Err(e) => tracing::error!(dir = %dir.display(), error = %e, "Could not read catalog directory"),
        }
    }
    let ctx = Arc::new(Context::new(
        Arc::new(storage),
        Arc::new(catalog),
        Arc::new(LogSink),
        cfg.settings(),
    ));

    let family = IpCamFamily;
    let central = family.create_central(ctx);
    let loaded = central.load_peers().context("loading peers")?;
    tracing::info!(count = loaded, "Peers loaded");
    let mut worker = Worker::spawn(central.clone()).context("starting worker")?;

    let rt = tokio::runtime::Runtime::new()?;
    let served = rt.block_on(run(&cfg, central.clone()));

    central.hub_shutting_down();
    worker.stop();
    central.save_peers(true);
    central.dispose();
    rt.shutdown_timeout(Duration::from_secs(2));
    tracing::info!("IPCam daemon stopped");
    served
}

async fn run(cfg: &config::Config, central: Arc<Central>) -> anyhow::Result<()> {
    let listener = TcpListener::bind((cfg.listen_address.as_str(), cfg.port))
        .await
        .with_context(|| format!("binding {}:{}", cfg.listen_address, cfg.port))?;
    let port = listener.local_addr()?.port();
    tracing::info!(address = %cfg.listen_address, port, "Bridge listening");
    central.listen_changed(ListenInfo {
        address: cfg.advertised(),
        port,
    });
    central.hub_started();
    tokio::select! {
        r = server::serve(listener, central) => r?,
        r = shutdown_signal() => r?,
    }
    tracing::info!("Shutting down");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
