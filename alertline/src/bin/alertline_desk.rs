//! Headless operator console: follows the notification push stream, logs toasts and speaks
//! high-priority alerts.
//!
//! Configuration comes from `ALERTLINE_*` environment variables, log filtering from `RUST_LOG`.

use alertline::{
    AlertlineConfig, BackendApi, CommandAudioPlayer, ConnectionManager, FallbackSpeech,
    LocalSpeechProvider, LocalStore, NotificationCenter, RemoteSpeechProvider, VoiceAlertQueue,
};
use rustls::crypto::ring::default_provider;
use std::{error::Error, sync::Arc, time::Duration};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let _ = default_provider().install_default();
    init_logging();

    let config = AlertlineConfig::from_env()?;
    info!(
        api = %config.api_base_url,
        push = %config.push_url,
        state = %config.state_path.display(),
        voice_min_priority = %config.voice_min_priority,
        "Starting alertline-desk"
    );

    let store = LocalStore::open(&config.state_path);
    let api = Arc::new(BackendApi::new(config.api_base_url.clone()));

    match api.health().await {
        Ok(health) if health.is_healthy() => info!("Backend healthy"),
        Ok(health) => warn!(status = %health.status, "Backend reports degraded health"),
        Err(e) => warn!("Backend health check failed: {}", e.user_message()),
    }

    match api.tts_providers().await {
        Ok(providers) => {
            for provider in providers {
                info!(name = %provider.name, available = provider.available, "TTS provider");
            }
        }
        Err(e) => warn!("Could not list TTS providers, local voice will cover: {}", e),
    }

    let center = Arc::new(NotificationCenter::new(api.clone(), store));
    if let Err(e) = center.activate().await {
        // The push loop refreshes again after its first reconnect
        error!("Initial notification load failed: {}", e.user_message());
    }
    info!(
        total = center.notifications().len(),
        unread = center.unread_count(),
        "Notifications loaded"
    );
    for toast in center.pending_toasts() {
        info!(id = %toast.id, priority = %toast.priority, "[toast] {}", toast.spoken_text());
    }

    let speech = FallbackSpeech::new(
        Arc::new(RemoteSpeechProvider::new(
            api.clone(),
            Arc::new(CommandAudioPlayer::new(config.audio_player.clone())),
        )),
        Arc::new(LocalSpeechProvider::new(config.local_voice_program.clone())),
    );
    let voice = VoiceAlertQueue::new(Arc::new(speech));

    // Alert routing: toast log + voice
    let routing = {
        let center = Arc::clone(&center);
        let voice = voice.clone();
        let config = config.clone();
        let mut alerts = center.subscribe_alerts();
        tokio::spawn(async move {
            loop {
                match alerts.recv().await {
                    Ok(notification) => {
                        if !center.is_dismissed(&notification.id) {
                            info!(
                                id = %notification.id,
                                priority = %notification.priority,
                                "[toast] {}",
                                notification.spoken_text()
                            );
                        }
                        if config.speaks(notification.priority) {
                            voice.enqueue(notification.spoken_text(), notification.priority);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Alert routing lagged, skipped {} notifications", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    let manager = ConnectionManager::new();
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let push_loop = {
        let center = Arc::clone(&center);
        let manager = manager.clone();
        let url = config.push_url.clone();
        tokio::spawn(async move { center.run_push_loop(&manager, &url, shutdown_rx).await })
    };

    let status_log = {
        let center = Arc::clone(&center);
        let voice = voice.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATUS_LOG_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                info!(
                    connected = center.is_connected(),
                    unread = center.unread_count(),
                    toasts = center.pending_toasts().len(),
                    voice_waiting = voice.pending().len(),
                    "status"
                );
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    voice.stop();
    let _ = shutdown_tx.send(()).await;
    if let Err(e) = push_loop.await {
        error!("Push loop task failed: {}", e);
    }
    routing.abort();
    status_log.abort();

    Ok(())
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
