//! Prometheus counters for registry anomalies and shard churn
//!
//! Only cold paths are counted. Inserts, lookups and removals on private
//! shards stay free of shared atomics so worker threads never contend on a
//! counter cache line.

use crate::error::{Fault, Result};
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

/// Counters for one registry instance, labelled `registry="<name>"`
#[derive(Clone)]
pub struct RegistryMetrics {
    shards_acquired: IntCounter,
    shards_released: IntCounter,
    shard_pool_exhausted: IntCounter,
    faults: IntCounterVec,
}

impl RegistryMetrics {
    pub fn new(name: &str) -> Result<Self> {
        let opts = |metric: &str, help: &str| Opts::new(metric, help).const_label("registry", name);

        Ok(Self {
            shards_acquired: IntCounter::with_opts(opts(
                "handle_registry_shards_acquired_total",
                "Private shards handed out",
            ))?,
            shards_released: IntCounter::with_opts(opts(
                "handle_registry_shards_released_total",
                "Private shards returned to the pool",
            ))?,
            shard_pool_exhausted: IntCounter::with_opts(opts(
                "handle_registry_shard_pool_exhausted_total",
                "Acquire calls answered with the shared shard",
            ))?,
            faults: IntCounterVec::new(
                opts(
                    "handle_registry_faults_total",
                    "Degraded operations by fault kind",
                ),
                &["kind"],
            )?,
        })
    }

    /// Expose the counters through a prometheus registry
    pub fn register(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.shards_acquired.clone()))?;
        registry.register(Box::new(self.shards_released.clone()))?;
        registry.register(Box::new(self.shard_pool_exhausted.clone()))?;
        registry.register(Box::new(self.faults.clone()))?;
        Ok(())
    }

    pub(crate) fn shard_acquired(&self) {
        self.shards_acquired.inc();
    }

    pub(crate) fn shard_released(&self) {
        self.shards_released.inc();
    }

    pub(crate) fn pool_exhausted(&self) {
        self.shard_pool_exhausted.inc();
    }

    pub(crate) fn fault(&self, fault: Fault) {
        self.faults.with_label_values(&[fault.label()]).inc();
    }

    pub(crate) fn fault_by(&self, fault: Fault, count: u64) {
        self.faults.with_label_values(&[fault.label()]).inc_by(count);
    }

    /// Point-in-time copy of all counters
    pub fn snapshot(&self) -> RegistryStats {
        let fault = |kind: Fault| self.faults.with_label_values(&[kind.label()]).get();

        RegistryStats {
            shards_acquired: self.shards_acquired.get(),
            shards_released: self.shards_released.get(),
            shard_pool_exhausted: self.shard_pool_exhausted.get(),
            capacity_exhausted: fault(Fault::CapacityExhausted),
            invalid_shard_refs: fault(Fault::InvalidShardRef),
            stale_tags: fault(Fault::StaleTag),
            out_of_range: fault(Fault::OutOfRange),
            shared_exhausted: fault(Fault::SharedExhausted),
            leaked_entries: fault(Fault::LeakedEntries),
        }
    }
}

/// Registry statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub shards_acquired: u64,
    pub shards_released: u64,
    pub shard_pool_exhausted: u64,
    pub capacity_exhausted: u64,
    pub invalid_shard_refs: u64,
    pub stale_tags: u64,
    pub out_of_range: u64,
    pub shared_exhausted: u64,
    pub leaked_entries: u64,
}

impl RegistryStats {
    /// Sum of all fault counters
    pub fn faults(&self) -> u64 {
        self.capacity_exhausted
            + self.invalid_shard_refs
            + self.stale_tags
            + self.out_of_range
            + self.shared_exhausted
            + self.leaked_entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts_faults() -> Result<()> {
        let metrics = RegistryMetrics::new("test")?;
        metrics.fault(Fault::StaleTag);
        metrics.fault(Fault::StaleTag);
        metrics.fault_by(Fault::LeakedEntries, 5);
        metrics.shard_acquired();

        let stats = metrics.snapshot();
        assert_eq!(stats.stale_tags, 2);
        assert_eq!(stats.leaked_entries, 5);
        assert_eq!(stats.shards_acquired, 1);
        assert_eq!(stats.faults(), 7);
        Ok(())
    }

    #[test]
    fn test_register_with_prometheus() -> Result<()> {
        let registry = Registry::new();
        let metrics = RegistryMetrics::new("filters")?;
        metrics.register(&registry)?;
        metrics.pool_exhausted();

        let families = registry.gather();
        let exhausted = families
            .iter()
            .find(|family| family.get_name() == "handle_registry_shard_pool_exhausted_total")
            .expect("metric family should be registered");
        assert_eq!(exhausted.get_metric()[0].get_counter().get_value(), 1.0);
        Ok(())
    }

    #[test]
    fn test_distinct_instances_register_side_by_side() -> Result<()> {
        let registry = Registry::new();
        RegistryMetrics::new("filters")?.register(&registry)?;
        RegistryMetrics::new("factories")?.register(&registry)?;

        // same name twice collides
        assert!(RegistryMetrics::new("filters")?.register(&registry).is_err());
        Ok(())
    }
}
