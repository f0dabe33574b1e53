pub mod bridge;
pub mod broker;
pub mod config;
pub mod notify;
pub mod serial;

use std::process::ExitCode;
use std::sync::Arc;

use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::bridge::{Bridge, BridgeError};
use crate::broker::broker_link::BrokerLink;
use crate::broker::{BrokerError, BrokerSettings};
use crate::config::BridgeConfig;
use crate::notify::{Notify, TelegramNotifier};
use crate::serial::{SerialHandle, SerialSettings};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    setup()?;

    let config = BridgeConfig::load().wrap_err("configuration is unusable")?;
    info!(device = %config.device_id, "starting bridge");

    let notifier: Arc<dyn Notify> = Arc::new(
        TelegramNotifier::new(&config.notifier).wrap_err("failed to build the notifier client")?,
    );

    // The device is non-negotiable; refuse to start without it.
    let serial = SerialHandle::open(SerialSettings::from_config(&config.serial))
        .wrap_err("serial device unavailable")?;

    let link = BrokerLink::new(BrokerSettings::from_config(&config), notifier);
    let bridge = Bridge::new(serial, link, config.poll_interval());

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    match bridge.run(shutdown).await {
        Ok(()) => {
            info!("graceful shutdown");
            Ok(ExitCode::SUCCESS)
        }
        Err(BridgeError::Broker(BrokerError::RetriesExhausted { attempts })) => {
            error!(attempts, "broker unreachable, exiting");
            Ok(ExitCode::FAILURE)
        }
        Err(err) => Err(err.into()),
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

/// Cancels the shutdown token on SIGINT or SIGTERM. The duties treat the
/// cancellation as an expected stop, not an error.
fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut terminate) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
                        _ = terminate.recv() => info!("termination signal received, shutting down"),
                    }
                }
                Err(err) => {
                    warn!(%err, "no SIGTERM handler, falling back to ctrl-c only");
                    let _ = tokio::signal::ctrl_c().await;
                    info!("interrupt received, shutting down");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("interrupt received, shutting down");
        }
        shutdown.cancel();
    });
}
