//! Registry configuration
//!
//! The dimensions of a registry are fixed for its whole lifetime. Every table
//! is allocated with exactly these lengths and never grows or shrinks.
//!
//! ```text
//! max_slots      shards (slot 0 is the shared overflow shard)
//!   └─→ hunks_per_slot - spare     hunks per shard
//!        └─→ items_per_hunk - spare    entries per hunk
//! ```
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then `HANDLE_REGISTRY_*` environment variables.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable prefix for overrides (`HANDLE_REGISTRY_MAX_SLOTS=64`)
pub const ENV_PREFIX: &str = "HANDLE_REGISTRY";

/// Upper bound on the number of distinct marks. Keeps marks well clear of the
/// complemented free-list links they share storage with inside a hunk.
pub(crate) const MARK_CEILING: u64 = 1 << 28;

/// Registry dimensions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Instance name, used as the `registry` label on exported metrics
    pub name: String,
    /// Entry address range per hunk (usable entries: `items_per_hunk - spare`)
    pub items_per_hunk: usize,
    /// Hunk address range per slot (usable hunks: `hunks_per_slot - spare`)
    pub hunks_per_slot: usize,
    /// Number of shards, including the shared shard 0
    pub max_slots: usize,
    /// Address space held back from each hunk and slot
    pub spare: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            items_per_hunk: 4096,
            hunks_per_slot: 4096,
            max_slots: 4096,
            spare: 10,
        }
    }
}

impl RegistryConfig {
    /// Create a configuration with the given dimensions and default name
    pub fn new(items_per_hunk: usize, hunks_per_slot: usize, max_slots: usize) -> Self {
        Self {
            items_per_hunk,
            hunks_per_slot,
            max_slots,
            ..Self::default()
        }
    }

    /// Set the instance name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the spare address space per level
    pub fn with_spare(mut self, spare: usize) -> Self {
        self.spare = spare;
        self
    }

    /// Load defaults, an optional TOML file and environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            ::config::Config::builder().add_source(::config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Toml)
                    .required(true),
            );
        }

        let loaded: Self = builder
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;

        loaded.validate()?;
        Ok(loaded)
    }

    /// Parse a TOML document; missing keys fall back to defaults
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let parsed: Self = toml::from_str(source)?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Check that the dimensions describe an encodable tag space
    pub fn validate(&self) -> Result<()> {
        if self.spare == 0 {
            // a zero spare lets a fully-zero location encode to tag 0
            return Err(Error::InvalidConfig("spare must be at least 1".to_string()));
        }
        if self.items_per_hunk <= self.spare {
            return Err(Error::InvalidConfig(format!(
                "items_per_hunk ({}) must exceed spare ({})",
                self.items_per_hunk, self.spare
            )));
        }
        if self.hunks_per_slot <= self.spare {
            return Err(Error::InvalidConfig(format!(
                "hunks_per_slot ({}) must exceed spare ({})",
                self.hunks_per_slot, self.spare
            )));
        }
        if self.max_slots < 2 {
            return Err(Error::InvalidConfig(format!(
                "max_slots ({}) must leave room for at least one private shard",
                self.max_slots
            )));
        }
        if u32::try_from(self.items_per_hunk).is_err() || u32::try_from(self.hunks_per_slot).is_err()
        {
            return Err(Error::InvalidConfig(
                "items_per_hunk and hunks_per_slot must fit in 32 bits".to_string(),
            ));
        }

        let mark_base = (self.items_per_hunk as u64)
            .checked_mul(self.hunks_per_slot as u64)
            .and_then(|base| base.checked_mul(self.max_slots as u64))
            .ok_or_else(|| {
                Error::InvalidConfig("tag address space overflows 64 bits".to_string())
            })?;
        if u64::MAX / mark_base < 2 {
            return Err(Error::InvalidConfig(
                "tag address space leaves no room for marks".to_string(),
            ));
        }

        Ok(())
    }

    /// Usable entries per hunk
    pub fn items_len(&self) -> usize {
        self.items_per_hunk - self.spare
    }

    /// Usable hunks per slot
    pub fn hunks_len(&self) -> usize {
        self.hunks_per_slot - self.spare
    }

    /// Entries pre-booked in the first hunk of every slot
    pub fn reserved(&self) -> usize {
        self.items_len() / 2
    }

    /// Number of items a single shard accepts before overflowing
    pub fn shard_capacity(&self) -> usize {
        self.hunks_len() * self.items_len() - self.reserved()
    }
}
