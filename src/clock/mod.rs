//! Server clock offset estimation
//!
//! - `ClockSample`: one round trip of clock evidence
//! - `ClockOffsetEstimator`: EMA-smoothed `serverTime - localTime`
//! - `ClockSyncLayer`: tower layer feeding the estimator from HTTP responses
//! - `TimeSyncProbe`: periodic sampling against the REST API

mod estimator;
mod layer;
mod probe;
mod sample;

pub use estimator::{ClockOffsetEstimator, OffsetEstimate, SampleOutcome, SampleRejection};
pub use layer::{observe_response, ClockSync, ClockSyncLayer};
pub use probe::TimeSyncProbe;
pub use sample::{parse_server_timestamp, ClockSample, SERVER_TIME_HEADER};
