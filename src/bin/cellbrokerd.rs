//! Daemon entry point. Device discovery, plugin/quirk loading, and the host
//! IPC binding are external collaborators (spec.md §1 "OUT OF SCOPE") — this
//! binary wires up logging and brings up a single statically-configured
//! modem from the environment, the same scope the library's own test
//! tooling exercises against mock transports.

use std::env;
use std::time::Duration;

use cellbroker::config::{BackendKind, Config};
use cellbroker::modem::Modem;
use cellbroker::registry::Registry;

fn backend_from_env() -> BackendKind {
    match env::var("CELLBROKER_BACKEND").as_deref() {
        Ok("qmi") => BackendKind::Qmi,
        _ => BackendKind::At,
    }
}

fn config_from_env() -> Config {
    let port = env::var("CELLBROKER_PORT").unwrap_or_else(|_| "/dev/ttyUSB2".to_string());
    let mut config = Config::new(backend_from_env(), port);

    if let Ok(apn) = env::var("CELLBROKER_APN") {
        config = config.with_default_apn(apn);
    }
    if let Ok(rate) = env::var("CELLBROKER_SIGNAL_RATE_SECS") {
        if let Ok(secs) = rate.parse::<u64>() {
            config = config.with_signal_refresh_rate(Duration::from_secs(secs));
        }
    }
    config
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    env_logger::init();

    let config = config_from_env();
    let modem = std::sync::Arc::new(Modem::new(config));
    let mut registry = Registry::new();
    let path = registry.register_modem(modem.clone());
    log::info!("registered modem at {path}");

    if let Err(e) = modem.initialize().await {
        log::error!("modem initialization failed: {e}");
        std::process::exit(1);
    }
    if let Err(e) = modem.enable().await {
        log::error!("modem enable failed: {e}");
        std::process::exit(1);
    }

    log::info!("modem enabled, waiting for shutdown signal");
    match tokio::signal::ctrl_c().await {
        Ok(()) => log::info!("shutdown signal received"),
        Err(e) => log::error!("failed to listen for shutdown signal: {e}"),
    }

    if let Err(e) = modem.disable().await {
        log::warn!("modem disable on shutdown failed: {e}");
    }
    registry.unregister_modem(modem.id);
}
