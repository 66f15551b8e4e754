use std::{io::ErrorKind, time::Duration};

use anyhow::Context;
use rapt_common::BridgeConfig;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::api::RaptApiClient;
use crate::bus::{self, MqttBus};
use crate::reconcile::{self, Reconciler};
use crate::store::CredentialStore;
use crate::token::{RaptTokenEndpoint, TokenManager};

const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

pub async fn run() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_config().await?;
    info!(
        poll_interval_secs = config.timing.poll_interval_secs,
        token_path = %config.timing.token_path,
        "starting RAPT bridge"
    );

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.rapt.request_timeout_secs))
        .build()
        .context("failed to build HTTP client")?;

    let tokens = TokenManager::new(
        RaptTokenEndpoint::new(http.clone(), &config.rapt.auth_url, &config.rapt.client_id),
        CredentialStore::new(&config.timing.token_path),
        &config.rapt.username,
        &config.rapt.secret,
    );
    let api = RaptApiClient::new(http, &config.rapt.api_url);
    let (bus, eventloop) = MqttBus::connect(&config.mqtt);
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let transport = bus::spawn_event_loop(bus.clone(), eventloop, command_tx);

    let reconciler = Reconciler::new(
        tokens,
        api,
        bus.clone(),
        Duration::from_secs(config.timing.settle_delay_secs),
    );

    let outcome = reconcile::run(
        reconciler,
        command_rx,
        Duration::from_secs(config.timing.poll_interval_secs),
        reconcile::shutdown_signal(),
    )
    .await;

    match bus.disconnect() {
        Ok(()) => {
            if tokio::time::timeout(DISCONNECT_GRACE, transport).await.is_err() {
                warn!("mqtt disconnect did not complete in time");
            }
        }
        Err(err) => warn!("{err}"),
    }
    outcome.context("bridge stopped")?;

    info!("bridge stopped");
    Ok(())
}

async fn load_config() -> anyhow::Result<BridgeConfig> {
    let mut config = match std::env::var("RAPT_BRIDGE_CONFIG") {
        Ok(path) => match tokio::fs::read(&path).await {
            Ok(raw) => BridgeConfig::from_json(&raw)?,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!("config file {path} not found, using defaults");
                BridgeConfig::default()
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read config file {path}"))
            }
        },
        Err(_) => BridgeConfig::default(),
    };

    config.apply_env(|key| std::env::var(key).ok());
    config.sanitize();
    config.validate()?;
    Ok(config)
}
