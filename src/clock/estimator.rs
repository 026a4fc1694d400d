use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::config::ClockConfig;
use crate::metrics::ClockMetrics;

use super::ClockSample;

/// Current smoothed estimate of `serverTime - localTime`
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OffsetEstimate {
    /// Positive means the server is ahead of the local clock
    pub offset_ms: f64,
    pub sample_count: u64,
    pub last_updated_at: Option<DateTime<Utc>>,
}

impl OffsetEstimate {
    const EMPTY: OffsetEstimate = OffsetEstimate {
        offset_ms: 0.0,
        sample_count: 0,
        last_updated_at: None,
    };
}

impl Default for OffsetEstimate {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Why a sample did not update the estimate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleRejection {
    NonFiniteOffset,
}

/// Result of feeding one observation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleOutcome {
    Accepted(OffsetEstimate),
    Rejected(SampleRejection),
}

impl SampleOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SampleOutcome::Accepted(_))
    }
}

/// Exponentially smoothed server clock offset.
///
/// The first accepted observation sets the estimate directly; each later one
/// moves it by `alpha * (observed - estimate)`. With the default alpha of 0.2
/// single-sample jitter is damped while a real skew change is absorbed within
/// roughly 10 to 15 samples.
pub struct ClockOffsetEstimator {
    alpha: f64,
    estimate: RwLock<OffsetEstimate>,
}

impl ClockOffsetEstimator {
    pub const DEFAULT_ALPHA: f64 = 0.2;

    pub fn new() -> Self {
        Self::with_alpha(Self::DEFAULT_ALPHA)
    }

    /// Alpha outside `(0, 1]` falls back to the default
    pub fn with_alpha(alpha: f64) -> Self {
        let alpha = if alpha.is_finite() && alpha > 0.0 && alpha <= 1.0 {
            alpha
        } else {
            tracing::warn!(alpha, "Invalid clock smoothing factor, using default");
            Self::DEFAULT_ALPHA
        };

        Self {
            alpha,
            estimate: RwLock::new(OffsetEstimate::EMPTY),
        }
    }

    pub fn from_config(config: &ClockConfig) -> Self {
        Self::with_alpha(config.alpha)
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Feed a round-trip sample
    pub fn record(&self, sample: &ClockSample) -> SampleOutcome {
        self.observe(sample.observed_offset_ms())
    }

    /// Feed an already computed observed offset in milliseconds
    pub fn observe(&self, observed_ms: f64) -> SampleOutcome {
        if !observed_ms.is_finite() {
            ClockMetrics::record_rejected();
            tracing::debug!(observed_ms, "Discarding non-finite clock sample");
            return SampleOutcome::Rejected(SampleRejection::NonFiniteOffset);
        }

        let updated = {
            let mut estimate = self.estimate.write();
            if estimate.sample_count == 0 {
                estimate.offset_ms = observed_ms;
            } else {
                estimate.offset_ms += self.alpha * (observed_ms - estimate.offset_ms);
            }
            estimate.sample_count += 1;
            estimate.last_updated_at = Some(Utc::now());
            *estimate
        };

        ClockMetrics::record_accepted(updated.offset_ms);
        tracing::trace!(
            observed_ms,
            offset_ms = updated.offset_ms,
            samples = updated.sample_count,
            "Clock offset updated"
        );

        SampleOutcome::Accepted(updated)
    }

    /// Set the offset without smoothing. Non-finite values are ignored.
    pub fn force_offset(&self, offset_ms: f64) -> bool {
        if !offset_ms.is_finite() {
            return false;
        }
        let mut estimate = self.estimate.write();
        estimate.offset_ms = offset_ms;
        estimate.last_updated_at = Some(Utc::now());
        ClockMetrics::set_offset(offset_ms);
        true
    }

    /// Forget all samples, e.g. at a session boundary
    pub fn reset(&self) {
        *self.estimate.write() = OffsetEstimate::EMPTY;
        ClockMetrics::set_offset(0.0);
    }

    pub fn estimate(&self) -> OffsetEstimate {
        *self.estimate.read()
    }

    pub fn offset_ms(&self) -> f64 {
        self.estimate.read().offset_ms
    }

    /// Approximate authoritative server time
    pub fn approx_now(&self) -> DateTime<Utc> {
        Utc::now() + Duration::milliseconds(self.offset_ms().round() as i64)
    }

    /// Approximate server time for a given local epoch-millisecond reading
    pub fn approx_now_at(&self, local_now_ms: f64) -> f64 {
        local_now_ms + self.offset_ms()
    }

    /// Time left until `deadline` on the server's clock; negative once passed
    pub fn remaining_until(&self, deadline: DateTime<Utc>) -> Duration {
        deadline.signed_duration_since(self.approx_now())
    }
}

impl Default for ClockOffsetEstimator {
    fn default() -> Self {
        Self::new()
    }
}
