use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;

use auction_realtime::clock::{ClockOffsetEstimator, TimeSyncProbe};
use auction_realtime::config::Settings;
use auction_realtime::connection_manager::{ConnectionEvent, ConnectionManager};
use auction_realtime::shutdown::{wait_for_signal, GracefulShutdown};
use auction_realtime::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize tracing (keep the guard alive until exit)
    let _telemetry = init_telemetry(&settings.otel)?;
    tracing::info!(
        api_base_url = %settings.realtime.api_base_url,
        hub = %settings.realtime.hub_endpoint(),
        "Configuration loaded"
    );

    let estimator = Arc::new(ClockOffsetEstimator::from_config(&settings.clock));
    let manager = Arc::new(ConnectionManager::new(&settings.realtime));
    register_log_handlers(&manager, &estimator);

    let (shutdown_tx, _) = broadcast::channel(1);
    let mut shutdown = GracefulShutdown::new(manager.clone(), shutdown_tx.clone());

    // Keep the server clock estimate warm in the background
    let probe = TimeSyncProbe::new(
        reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?,
        settings.realtime.api_base_url.clone(),
        estimator.clone(),
        Duration::from_secs(settings.clock.probe_interval_secs),
    );
    shutdown.track(tokio::spawn(probe.run(shutdown_tx.subscribe())));

    match manager.ensure_connected().await {
        Ok(()) => {
            if !settings.watch.items.is_empty() {
                if let Err(e) = manager.set_visible_items(&settings.watch.items).await {
                    tracing::error!(error = %e, items = ?settings.watch.items, "Failed to subscribe to watched items");
                }
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "Initial hub connection failed");
        }
    }

    wait_for_signal().await;
    shutdown.execute("signal received").await;

    tracing::info!("Client shutdown complete");
    Ok(())
}

fn register_log_handlers(manager: &ConnectionManager, estimator: &Arc<ClockOffsetEstimator>) {
    let clock = estimator.clone();
    let _ = manager.on_bid_update(move |update| {
        let remaining = clock.remaining_until(update.end_time);
        tracing::info!(
            item_id = update.item_id,
            price = update.current_price,
            bidder = %update.highest_bidder_name,
            remaining_secs = remaining.num_seconds(),
            "Bid update"
        );
    });

    let _ = manager.on_auction_closed(|closed| {
        tracing::info!(
            item_id = closed.item_id,
            final_price = closed.final_price,
            status = closed.status.as_str(),
            winner_id = ?closed.winner_id,
            "Auction closed"
        );
    });

    let _ = manager.on_state_change(|event| match event {
        ConnectionEvent::StateChanged { state, reason } => {
            tracing::info!(state = %state, reason = ?reason, "Hub connection state");
        }
        ConnectionEvent::ResyncFailed { item_ids, error } => {
            tracing::warn!(items = ?item_ids, error = %error, "Hub interest resync failed");
        }
    });
}
