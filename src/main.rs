use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use mimalloc::MiMalloc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use telehub::api::{self, AppState};
use telehub::command::CommandDispatcher;
use telehub::config::{Cli, Config};
use telehub::monitor::Monitor;
use telehub::store::{FileStore, NullStore, StoreAdapter};
use telehub::sweeper;
use telehub::udp::UdpEngine;
use telehub_service::clock::{Clock, SystemClock};
use telehub_service::ChannelTable;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Arc::new(Config::load(&cli)?);

    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };
    simple_logger::SimpleLogger::new().with_level(level).init()?;

    log::info!("telehub starting, udp={} http={}", config.net.udp_bind, config.net.http_bind);

    let table = Arc::new(ChannelTable::new(config.session.max_channels));
    let monitor = Arc::new(Monitor::default());
    let dispatcher = Arc::new(CommandDispatcher::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let store: Arc<dyn StoreAdapter> = if config.store.enabled {
        Arc::new(FileStore::new(config.store.data_dir.clone()))
    } else {
        Arc::new(NullStore)
    };

    for record in store.load_channels().await {
        table.restore(&record.id, &record.devid, record.vin.as_deref(), record.flags, clock.now_ms());
    }
    log::info!("restored {} channels from the store", table.len());

    let socket = Arc::new(UdpSocket::bind(config.net.udp_bind).await?);
    let engine = Arc::new(UdpEngine::new(
        socket,
        table.clone(),
        dispatcher,
        monitor.clone(),
        store,
        clock.clone(),
        config.session.sync_interval_secs * 1000,
        config.session.server_key.clone(),
    ));

    let shutdown = CancellationToken::new();

    let udp_task = {
        let engine = engine.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { engine.run(shutdown).await })
    };

    let sweeper_task = {
        let table = table.clone();
        let clock = clock.clone();
        let timeout_ms = config.session.channel_timeout_secs * 1000;
        let shutdown = shutdown.clone();
        tokio::spawn(async move { sweeper::run(table, clock, timeout_ms, shutdown).await })
    };

    let state = Arc::new(AppState {
        table,
        engine,
        monitor,
        config: config.clone(),
        clock,
    });

    let http_shutdown = shutdown.clone();
    let http_task = tokio::spawn(async move {
        if let Err(e) = api::serve(state, async move { http_shutdown.cancelled().await }).await {
            log::error!("http frontend exited: {e}");
        }
    });

    tokio::signal::ctrl_c().await?;
    log::info!("shutdown requested");
    shutdown.cancel();

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = udp_task.await;
        let _ = sweeper_task.await;
        let _ = http_task.await;
    })
    .await;

    Ok(())
}
