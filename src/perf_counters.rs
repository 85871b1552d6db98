use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Performance counters updated on every residency transition.
///
/// The façade is the only writer; everything here is monotone between two
/// `reset` calls.
pub struct PerfCounters {
    pub(crate) page_faults: AtomicU64,
    pub(crate) host_to_device_migrations: AtomicU64,
    pub(crate) device_to_host_migrations: AtomicU64,
    pub(crate) bytes_migrated: AtomicU64,
    pub(crate) migration_time_us: AtomicU64,
    pub(crate) tlb_hits: AtomicU64,
    pub(crate) tlb_misses: AtomicU64,
    pub(crate) evictions: AtomicU64,
    pub(crate) kernel_launches: AtomicU64,
    pub(crate) prefetches: AtomicU64,
}

impl PerfCounters {
    pub(crate) const fn new() -> Self {
        PerfCounters {
            page_faults: AtomicU64::new(0),
            host_to_device_migrations: AtomicU64::new(0),
            device_to_host_migrations: AtomicU64::new(0),
            bytes_migrated: AtomicU64::new(0),
            migration_time_us: AtomicU64::new(0),
            tlb_hits: AtomicU64::new(0),
            tlb_misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            kernel_launches: AtomicU64::new(0),
            prefetches: AtomicU64::new(0),
        }
    }

    pub fn reset(&self) {
        self.page_faults.store(0, Ordering::Relaxed);
        self.host_to_device_migrations.store(0, Ordering::Relaxed);
        self.device_to_host_migrations.store(0, Ordering::Relaxed);
        self.bytes_migrated.store(0, Ordering::Relaxed);
        self.migration_time_us.store(0, Ordering::Relaxed);
        self.tlb_hits.store(0, Ordering::Relaxed);
        self.tlb_misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.kernel_launches.store(0, Ordering::Relaxed);
        self.prefetches.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            page_faults: self.page_faults.load(Ordering::Relaxed),
            host_to_device_migrations: self.host_to_device_migrations.load(Ordering::Relaxed),
            device_to_host_migrations: self.device_to_host_migrations.load(Ordering::Relaxed),
            bytes_migrated: self.bytes_migrated.load(Ordering::Relaxed),
            migration_time_us: self.migration_time_us.load(Ordering::Relaxed),
            tlb_hits: self.tlb_hits.load(Ordering::Relaxed),
            tlb_misses: self.tlb_misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            kernel_launches: self.kernel_launches.load(Ordering::Relaxed),
            prefetches: self.prefetches.load(Ordering::Relaxed),
        }
    }
}

/// A consistent-enough copy of the counters, serializable so out-of-tree
/// harnesses can export it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub page_faults: u64,
    pub host_to_device_migrations: u64,
    pub device_to_host_migrations: u64,
    pub bytes_migrated: u64,
    pub migration_time_us: u64,
    pub tlb_hits: u64,
    pub tlb_misses: u64,
    pub evictions: u64,
    pub kernel_launches: u64,
    pub prefetches: u64,
}

impl CounterSnapshot {
    pub fn tlb_hit_rate(&self) -> f64 {
        let total = self.tlb_hits + self.tlb_misses;
        if total == 0 {
            return 0.0;
        }
        self.tlb_hits as f64 / total as f64
    }

    pub fn migration_bandwidth_gbps(&self) -> f64 {
        if self.migration_time_us == 0 {
            return 0.0;
        }
        let bytes_per_us = self.bytes_migrated as f64 / self.migration_time_us as f64;
        bytes_per_us * 1e6 / 1e9
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::Ordering;

    use super::PerfCounters;

    #[test]
    fn test_snapshot_and_reset() {
        let counters = PerfCounters::new();
        counters.page_faults.fetch_add(3, Ordering::Relaxed);
        counters.tlb_hits.fetch_add(9, Ordering::Relaxed);
        counters.tlb_misses.fetch_add(1, Ordering::Relaxed);

        let snap = counters.snapshot();
        assert_eq!(snap.page_faults, 3);
        assert_eq!(snap.tlb_hits, 9);
        assert!((snap.tlb_hit_rate() - 0.9).abs() < 1e-9);

        counters.reset();
        let snap = counters.snapshot();
        assert_eq!(snap.page_faults, 0);
        assert_eq!(snap.tlb_hit_rate(), 0.0);
    }

    #[test]
    fn test_bandwidth_derivation() {
        let counters = PerfCounters::new();
        counters.bytes_migrated.store(1_000_000, Ordering::Relaxed);
        counters.migration_time_us.store(1_000, Ordering::Relaxed);

        // 1 MB in 1 ms is 1 GB/s
        let snap = counters.snapshot();
        assert!((snap.migration_bandwidth_gbps() - 1.0).abs() < 1e-9);
    }
}
