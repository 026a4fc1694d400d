use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;

use crate::error::Result;

use super::{observe_response, ClockOffsetEstimator, OffsetEstimate};

/// Periodically samples the server clock with a lightweight GET against the
/// REST API, for sessions that make few REST calls of their own
pub struct TimeSyncProbe {
    client: reqwest::Client,
    url: String,
    estimator: Arc<ClockOffsetEstimator>,
    interval: Duration,
}

impl TimeSyncProbe {
    pub fn new(
        client: reqwest::Client,
        url: impl Into<String>,
        estimator: Arc<ClockOffsetEstimator>,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            estimator,
            interval,
        }
    }

    /// Take one sample. Any HTTP status is accepted; only transport failures
    /// are errors.
    pub async fn sync_once(&self) -> Result<Option<OffsetEstimate>> {
        let sent_at = Utc::now();
        let response = self.client.get(&self.url).send().await?;
        let received_at = Utc::now();

        Ok(observe_response(
            &self.estimator,
            response.headers(),
            sent_at,
            received_at,
        ))
    }

    /// Sample on every tick until a shutdown signal arrives. A zero interval
    /// disables the probe.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        if self.interval.is_zero() {
            tracing::info!(url = %self.url, "Time sync probe disabled");
            return;
        }

        let mut ticker = tokio::time::interval(self.interval);
        tracing::info!(url = %self.url, interval_secs = self.interval.as_secs(), "Time sync probe started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Time sync probe stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match self.sync_once().await {
                        Ok(Some(estimate)) => {
                            tracing::debug!(
                                offset_ms = estimate.offset_ms,
                                samples = estimate.sample_count,
                                "Server clock sampled"
                            );
                        }
                        Ok(None) => {
                            tracing::debug!(url = %self.url, "Response carried no usable server timestamp");
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, url = %self.url, "Time sync probe failed");
                        }
                    }
                }
            }
        }
    }
}
