// Handle registry
// Opaque integer tags for owned values that cross an integer-only boundary

#![warn(rust_2018_idioms)]

pub mod config;
pub mod metrics;
pub mod registry;

// Re-exports for convenience
pub use config::RegistryConfig;
pub use error::{Error, Fault, Result};
pub use metrics::{RegistryMetrics, RegistryStats};
pub use registry::{Layout, Location, Registry, ShardGuard, ShardRef, Tag};

/// Registry error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Invalid configuration: {0}")]
        InvalidConfig(String),

        #[error("Configuration error: {0}")]
        Config(#[from] ::config::ConfigError),

        #[error("TOML error: {0}")]
        Toml(#[from] toml::de::Error),

        #[error("Metrics error: {0}")]
        Metrics(#[from] prometheus::Error),
    }

    pub type Result<T> = std::result::Result<T, Error>;

    /// Degraded outcome of a registry operation
    ///
    /// Faults never surface as errors. The operation falls back (shared
    /// shard, `None`, no-op) and the fault is logged and counted.
    #[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Fault {
        #[error("shard capacity exhausted")]
        CapacityExhausted,

        #[error("invalid shard reference")]
        InvalidShardRef,

        #[error("stale tag")]
        StaleTag,

        #[error("tag out of range")]
        OutOfRange,

        #[error("shared shard exhausted")]
        SharedExhausted,

        #[error("entries leaked on shard release")]
        LeakedEntries,
    }

    impl Fault {
        pub const ALL: [Fault; 6] = [
            Fault::CapacityExhausted,
            Fault::InvalidShardRef,
            Fault::StaleTag,
            Fault::OutOfRange,
            Fault::SharedExhausted,
            Fault::LeakedEntries,
        ];

        /// Metric label value
        pub fn label(self) -> &'static str {
            match self {
                Fault::CapacityExhausted => "capacity_exhausted",
                Fault::InvalidShardRef => "invalid_shard_ref",
                Fault::StaleTag => "stale_tag",
                Fault::OutOfRange => "out_of_range",
                Fault::SharedExhausted => "shared_exhausted",
                Fault::LeakedEntries => "leaked_entries",
            }
        }
    }
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
