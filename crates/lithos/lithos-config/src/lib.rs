mod config;

pub use config::{ConfigError, OverflowMode, TransportConfig};
