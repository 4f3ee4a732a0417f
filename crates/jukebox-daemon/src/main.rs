mod http;
mod library;
mod mpv;
mod presentation;
mod socket;
#[cfg(test)]
mod testing;

use jukebox_core::collab::{AwakeGuard, PlaybackSignals};
use jukebox_core::config::{Config, ConfigFilePreferences};
use jukebox_core::dispatcher::{self, Service, Setup, SharedController};
use jukebox_core::persist::FileStore;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// A custom tracing layer that forwards log messages to connected clients
struct BroadcastLayer {
    sender: broadcast::Sender<String>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<String>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        // Only WARN and ERROR go out to clients
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = String::new();
        let now = chrono::Local::now();
        message.push_str(&format!("{} ", now.format("%H:%M:%S")));
        message.push_str(&format!("[{}] ", level));

        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // No receivers is fine
        let _ = self.sender.send(message);
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Log channel first so the tracing layer can use it
    let (log_tx, _) = broadcast::channel::<String>(100);

    let data_dir = jukebox_core::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("jukeboxd.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(BroadcastLayer::new(log_tx.clone()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,jukeboxd=debug,jukebox_core=debug")
            }),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    // Dispatcher queue comes first: the mpv event pump reports into it
    let (tx, rx) = dispatcher::channel();
    let guard = AwakeGuard::new();
    let signals = PlaybackSignals::new(tx.clone(), guard.clone());

    let mut driver = mpv::MpvDriver::new(&config.mpv);
    let (mpv_event_tx, mpv_event_rx) = mpsc::channel(256);
    let mpv_handle = driver.spawn_and_connect(mpv_event_tx).await?;
    mpv_handle.observe_all_properties().await;

    let player = mpv::MpvPlayer::new(mpv_handle.clone());
    tokio::spawn(mpv::event_pump(
        mpv_event_rx,
        mpv_handle,
        player.observed(),
        signals,
    ));
    let player: SharedController = Arc::new(Mutex::new(player));

    let seed = config.daemon.shuffle_seed.unwrap_or_else(rand::random);
    let service = Service::start(Setup {
        tx,
        rx,
        player,
        catalog: Box::new(library::TomlCatalog::new(&config.library.catalog_file)),
        sink: Box::new(presentation::StatusFileSink::new(&config.daemon.status_file)),
        store: Box::new(FileStore::new(&config.daemon.state_file)),
        preference_source: Box::new(ConfigFilePreferences::new(Config::config_path())),
        preferences: config.playback,
        guard,
        seed,
    });
    let handle = service.handle();

    let _socket_handle = socket::start_server(
        config.server.bind_address.clone(),
        config.server.port,
        handle.clone(),
        log_tx.clone(),
    );

    if config.server.http_enabled {
        let _http_handle = http::start_server(
            config.server.bind_address.clone(),
            config.server.http_port,
            handle.clone(),
        );
    }

    info!("Daemon initialised, waiting for shutdown signal");
    wait_for_shutdown(&handle).await;

    service.shutdown().await;
    driver.kill().await;
    info!("Daemon stopped");
    Ok(())
}

/// Ctrl-C (or SIGTERM) ends the daemon; SIGHUP re-reads the catalog.
#[cfg(unix)]
async fn wait_for_shutdown(handle: &dispatcher::PlayerHandle) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut hangup, mut terminate) = match (
        signal(SignalKind::hangup()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(h), Ok(t)) => (h, t),
        _ => {
            warn!("Failed to install signal handlers, only Ctrl-C will stop the daemon");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = terminate.recv() => break,
            _ = hangup.recv() => {
                info!("SIGHUP: refreshing catalog");
                if handle.catalog_changed().is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(windows)]
async fn wait_for_shutdown(_handle: &dispatcher::PlayerHandle) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to wait for Ctrl-C: {}", e);
    }
}
