//! Multi-threaded tests for shard isolation and lifecycle churn

use handle_registry::{Registry, RegistryConfig, Result, Tag};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[test]
fn test_threads_keep_their_items_apart() -> Result<()> {
    let registry: Registry<(usize, usize)> =
        Registry::new(RegistryConfig::new(64, 16, 16).with_name("isolation"))?;
    let threads = 8;
    let per_thread = 250;

    let tags: Vec<Vec<Tag>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|worker| {
                let registry = &registry;
                scope.spawn(move || {
                    let shard = registry.shard();
                    assert!(!shard.is_shared());

                    let tags: Vec<Tag> =
                        (0..per_thread).map(|i| shard.insert((worker, i))).collect();
                    for (i, &tag) in tags.iter().enumerate() {
                        assert_eq!(shard.lookup(tag), Some((worker, i)));
                    }
                    for (i, &tag) in tags.iter().enumerate().step_by(2) {
                        assert_eq!(shard.remove(tag), Some((worker, i)));
                    }
                    tags
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| handle.join().expect("worker panicked"))
            .collect()
    });

    let all: HashSet<Tag> = tags.iter().flatten().copied().collect();
    assert_eq!(all.len(), threads * per_thread);

    let stats = registry.stats();
    assert_eq!(stats.shards_acquired, threads as u64);
    assert_eq!(stats.shards_released, threads as u64);
    // odd-indexed items were still registered when each guard went away
    assert_eq!(stats.leaked_entries, (threads * per_thread / 2) as u64);
    assert_eq!(registry.shared_len(), 0);
    Ok(())
}

#[test]
fn test_overflow_from_many_threads_lands_in_shared() -> Result<()> {
    let registry: Registry<usize> = Registry::new(RegistryConfig::new(64, 16, 4))?;
    let capacity = registry.shard_capacity();
    let threads = 3;

    std::thread::scope(|scope| {
        for _ in 0..threads {
            scope.spawn(|| {
                let shard = registry.shard();
                for i in 0..capacity + 10 {
                    assert!(!shard.insert(i).is_none());
                }
            });
        }
    });

    assert_eq!(registry.stats().capacity_exhausted, (threads * 10) as u64);
    assert_eq!(registry.shared_len(), threads * 10);
    Ok(())
}

#[test]
fn test_acquire_release_churn() -> Result<()> {
    let max_slots = 6;
    let registry: Registry<u64> = Registry::new(RegistryConfig::new(64, 16, max_slots))?;
    let in_use: Vec<AtomicBool> = (0..max_slots).map(|_| AtomicBool::new(false)).collect();
    let shared_fallbacks = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for worker in 0..12u64 {
            let (registry, in_use, shared_fallbacks) = (&registry, &in_use, &shared_fallbacks);
            scope.spawn(move || {
                for round in 0..500u64 {
                    let shard = registry.shard();
                    let index = registry.layout().shard_index(shard.shard());

                    if shard.is_shared() {
                        shared_fallbacks.fetch_add(1, Ordering::Relaxed);
                    } else {
                        assert!(
                            !in_use[index].swap(true, Ordering::AcqRel),
                            "shard {} handed out twice",
                            index
                        );
                    }

                    let value = worker * 1_000_000 + round;
                    let tag = shard.insert(value);
                    assert_eq!(shard.lookup(tag), Some(value));
                    assert_eq!(shard.remove(tag), Some(value));

                    if !shard.is_shared() {
                        in_use[index].store(false, Ordering::Release);
                    }
                }
            });
        }
    });

    let stats = registry.stats();
    assert_eq!(stats.shards_acquired, stats.shards_released);
    assert_eq!(
        stats.shards_acquired + stats.shard_pool_exhausted,
        12 * 500
    );
    assert_eq!(stats.shard_pool_exhausted, shared_fallbacks.load(Ordering::Relaxed) as u64);
    assert_eq!(stats.faults(), 0);
    Ok(())
}

#[test]
fn test_shared_shard_concurrent_access() -> Result<()> {
    // one private shard, so every worker after the first shares shard 0
    let registry: Registry<String> = Registry::new(RegistryConfig::new(64, 16, 2))?;
    let holder = registry.shard();
    assert!(!holder.is_shared());

    std::thread::scope(|scope| {
        for worker in 0..4 {
            let registry = &registry;
            scope.spawn(move || {
                let shard = registry.shard();
                assert!(shard.is_shared());
                for i in 0..50 {
                    let value = format!("{}:{}", worker, i);
                    let tag = shard.insert(value.clone());
                    assert_eq!(registry.shard_of(tag), Some(0));
                    assert_eq!(shard.lookup(tag), Some(value.clone()));
                    assert_eq!(shard.remove(tag), Some(value));
                }
            });
        }
    });

    assert_eq!(registry.shared_len(), 0);
    assert_eq!(registry.stats().shard_pool_exhausted, 4);
    Ok(())
}
