mod settings;

pub use settings::{ClockConfig, OtelConfig, RealtimeConfig, Settings, WatchConfig};
