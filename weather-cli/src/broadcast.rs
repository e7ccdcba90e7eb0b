//! Process lifecycle around the core broadcaster: broker connection,
//! Ctrl-C handling and orderly shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use weather_core::{
    Broadcaster, Config, ConnectError, IgnoreInbound, MqttSettings, MqttTransport, StateTracker,
    Transport, protocol,
};

/// Runs the broadcaster until Ctrl-C.
pub async fn run(config: Config) -> Result<()> {
    let table = config.city_table()?;
    let settings = config.mqtt_settings();
    let broadcaster = Arc::new(Broadcaster::new(table));

    let cancel = CancellationToken::new();
    spawn_interrupt_watcher(cancel.clone());

    let Some(transport) = connect(&settings, broadcaster.clone(), &cancel).await? else {
        return Ok(());
    };

    let ticks = broadcaster
        .run(&transport, &settings.topic, config.tick_interval(), &cancel)
        .await;

    transport.shutdown().await;
    info!(ticks, "broadcaster stopped");
    Ok(())
}

/// Publishes a single `[CITY]` command and disconnects.
pub async fn select(config: Config, city: &str) -> Result<()> {
    match config.city_table() {
        Ok(table) if !table.contains(city) => {
            warn!(city, "city is not in the local table; the broadcaster may ignore it")
        }
        _ => {}
    }

    let mut settings = config.mqtt_settings();
    if config.broker.client_id.is_some() {
        // Must not collide with the broadcaster's own session.
        settings.client_id.push_str("-select");
    }

    let cancel = CancellationToken::new();
    spawn_interrupt_watcher(cancel.clone());

    let Some(transport) = connect(&settings, Arc::new(IgnoreInbound), &cancel).await? else {
        return Ok(());
    };

    let payload = protocol::encode_select_city(city);
    let published = transport
        .publish(&settings.topic, payload.as_bytes())
        .await
        .with_context(|| format!("Failed to publish '{payload}'"));

    transport.shutdown().await;
    published?;

    println!("Sent '{payload}' to topic '{}'", settings.topic);
    Ok(())
}

/// `Ok(None)` when interrupted before the connection was ready.
async fn connect(
    settings: &MqttSettings,
    handler: Arc<dyn weather_core::InboundHandler>,
    cancel: &CancellationToken,
) -> Result<Option<MqttTransport>> {
    match MqttTransport::connect(settings, handler, StateTracker::new(), cancel).await {
        Ok(transport) => Ok(Some(transport)),
        Err(ConnectError::Cancelled) => {
            info!("interrupted before the broker connection was ready");
            Ok(None)
        }
        Err(err) => Err(err).with_context(|| {
            format!(
                "Could not connect to MQTT broker {}:{}",
                settings.host, settings.port
            )
        }),
    }
}

fn spawn_interrupt_watcher(cancel: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, shutting down");
                cancel.cancel();
            }
            Err(err) => error!(error = %err, "failed to listen for Ctrl-C"),
        }
    });
}
