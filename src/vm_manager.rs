use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::RwLock;

use crate::modules::migration::{MigrationManager, MigrationManagerConfig};
use crate::modules::page_allocator::{PageAllocator, PageAllocatorConfig};
use crate::modules::page_table::{PageTable, PageTableEntry};
use crate::modules::replacement::{self, ReplacementPolicyModule};
use crate::modules::tlb::{Tlb, TlbEntry};
use crate::perf_counters::{CounterSnapshot, PerfCounters};
use crate::util::{align_to_page, vaddr_to_vpn, vpn_to_vaddr};
use crate::{Address, ReplacementPolicyKind, UvmConfig, VirtualPageNumber};

/// Upper bound on pages the replacement policies keep ordered.
const POLICY_WORKING_SET_LIMIT: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Domain {
    Host,
    Device,
}

#[derive(Debug, Clone, Copy)]
struct AllocationRange {
    vpn_start: VirtualPageNumber,
    num_pages: u32,
}

struct VmState {
    config: UvmConfig,
    page_table: Arc<PageTable>,
    allocator: PageAllocator,
    tlb: Tlb,
    migration: MigrationManager,
    policy: Box<dyn ReplacementPolicyModule>,
    next_vpn: VirtualPageNumber,
    max_vpns: u64,
    /// Allocation base address -> issued VPN range, filled by `allocate`.
    allocations: HashMap<Address, AllocationRange>,
    /// Residency ledger: VPNs currently holding a device slot.
    device_resident: HashSet<VirtualPageNumber>,
}

/// The process-wide unified-virtual-memory façade.
///
/// Owns one instance of each subsystem between `initialize` and `shutdown`
/// and drives the fault-handling loop that keeps pages resident where they
/// are accessed.
pub struct VirtualMemoryManager {
    state: RwLock<Option<VmState>>,
    counters: PerfCounters,
}

impl VirtualMemoryManager {
    const fn new() -> Self {
        VirtualMemoryManager {
            state: RwLock::new(None),
            counters: PerfCounters::new(),
        }
    }

    pub fn instance() -> &'static VirtualMemoryManager {
        static INSTANCE: VirtualMemoryManager = VirtualMemoryManager::new();
        &INSTANCE
    }

    /// Brings the subsystem up. A second call warns and changes nothing;
    /// nonsensical sizes panic.
    pub fn initialize(&self, config: UvmConfig) {
        let mut state = self.state.write();

        if state.is_some() {
            warn!("virtual memory manager already initialized");
            return;
        }

        config.validate();
        log::set_max_level(config.log_level);

        info!("initializing virtual memory manager");
        info!("  page size: {} bytes", config.page_size);
        info!("  host memory: {} bytes", config.host_memory);
        info!("  device memory: {} bytes", config.device_memory);
        info!(
            "  tlb: {} entries, {}-way",
            config.tlb_size, config.tlb_associativity
        );
        info!(
            "  replacement policy: {}",
            match config.replacement_policy {
                ReplacementPolicyKind::Lru => "LRU",
                ReplacementPolicyKind::Clock => "CLOCK",
            }
        );
        info!(
            "  device simulator: {}",
            if config.use_device_simulator { "on" } else { "off" }
        );

        let page_table = Arc::new(PageTable::new(config.page_size, config.virtual_address_space));

        let allocator = PageAllocator::new(PageAllocatorConfig {
            page_size: config.page_size,
            host_pool_size: config.host_memory,
            device_pool_size: config.device_memory,
            use_pinned_host_memory: config.use_pinned_host_memory,
            use_device_simulator: config.use_device_simulator,
        })
        .expect("page pool allocation failed");

        let tlb = Tlb::new(config.tlb_size, config.tlb_associativity);

        let migration = MigrationManager::new(
            page_table.clone(),
            MigrationManagerConfig {
                async_migrations: config.async_migrations,
                max_concurrent_migrations: config.migration_workers,
            },
        );

        let policy = replacement::new_policy(config.replacement_policy, POLICY_WORKING_SET_LIMIT);

        let max_vpns = (config.virtual_address_space / config.page_size) as u64;

        self.counters.reset();
        *state = Some(VmState {
            config,
            page_table,
            allocator,
            tlb,
            migration,
            policy,
            next_vpn: 0,
            max_vpns,
            allocations: HashMap::new(),
            device_resident: HashSet::new(),
        });

        info!("virtual memory manager initialized");
    }

    /// Tears the subsystem down. Safe to call repeatedly.
    pub fn shutdown(&self) {
        let mut state = self.state.write();
        let Some(st) = state.take() else {
            return;
        };

        info!("shutting down virtual memory manager");
        // dropping the state joins the migration workers; their Arc keeps
        // the page table alive until they are gone
        drop(st);
        info!("virtual memory manager shutdown complete");
    }

    /// Reserves `bytes` (rounded up to whole pages) of virtual memory,
    /// backed by host slots. With `prefetch_to_device` every page is also
    /// pushed to the device domain up front.
    ///
    /// Returns the base virtual address, or `None` when the VPN space or
    /// host pool is exhausted.
    pub fn allocate(&self, bytes: usize, prefetch_to_device: bool) -> Option<Address> {
        let mut guard = self.state.write();
        let Some(st) = guard.as_mut() else {
            error!("virtual memory manager not initialized");
            return None;
        };

        if bytes == 0 {
            warn!("ignoring zero-sized allocation");
            return None;
        }

        let page_size = st.config.page_size;
        let aligned_size = align_to_page(bytes, page_size);
        let num_pages = (aligned_size / page_size) as u32;

        if st.next_vpn + num_pages as u64 > st.max_vpns {
            error!("virtual address space exhausted");
            return None;
        }

        let vpn_start = st.next_vpn;
        if !st.page_table.allocate_vpn_range(vpn_start, num_pages) {
            error!("could not allocate vpn range at {}", vpn_start);
            return None;
        }

        let mut host_pages: Vec<*mut u8> = Vec::with_capacity(num_pages as usize);
        for i in 0..num_pages {
            let page = st.allocator.allocate_host_page();
            if page.is_null() {
                error!("out of host pages, rolling back allocation");
                for (j, &p) in host_pages.iter().enumerate() {
                    st.allocator.deallocate_host_page(p);
                    st.policy.on_page_freed(vpn_start + j as u64);
                }
                st.page_table.deallocate_vpn_range(vpn_start, num_pages);
                return None;
            }

            let vpn = vpn_start + i as u64;
            st.page_table.set_host_resident(vpn, page);
            st.page_table.update_access(vpn);
            st.policy.on_page_allocated(vpn);
            host_pages.push(page);
        }

        if prefetch_to_device && st.config.enable_prefetch {
            for i in 0..num_pages {
                let vpn = vpn_start + i as u64;
                let device_addr = st.allocator.allocate_device_page();
                if device_addr == 0 {
                    warn!("no device slot for prefetch of vpn {}", vpn);
                    continue;
                }

                let elapsed = st.migration.migrate_host_to_device(
                    vpn,
                    host_pages[i as usize],
                    device_addr,
                    page_size,
                );
                self.count_migration(Domain::Device, page_size, elapsed);
                self.counters.prefetches.fetch_add(1, Ordering::Relaxed);
                st.device_resident.insert(vpn);
            }
        }

        let vaddr = vpn_to_vaddr(vpn_start, page_size);
        st.allocations.insert(vaddr, AllocationRange { vpn_start, num_pages });
        st.next_vpn += num_pages as u64;

        debug!(
            "allocated vaddr={:#x}, size={} bytes, pages={}",
            vaddr, bytes, num_pages
        );
        Some(vaddr)
    }

    /// Releases an allocation made by `allocate`. Unknown addresses warn
    /// and do nothing.
    pub fn free(&self, vaddr: Address) {
        let mut guard = self.state.write();
        let Some(st) = guard.as_mut() else {
            error!("virtual memory manager not initialized");
            return;
        };

        let Some(range) = st.allocations.remove(&vaddr) else {
            warn!("freeing unmapped virtual address {:#x}", vaddr);
            return;
        };

        for i in 0..range.num_pages {
            let vpn = range.vpn_start + i as u64;
            if let Some(entry) = st.page_table.lookup(vpn) {
                if !entry.host_address.is_null() {
                    st.allocator.deallocate_host_page(entry.host_address);
                }
                if entry.device_address != 0 {
                    st.allocator.deallocate_device_page(entry.device_address);
                }
            }
            st.device_resident.remove(&vpn);
            st.policy.on_page_freed(vpn);
            st.tlb.invalidate(vpn);
        }

        st.page_table.deallocate_vpn_range(range.vpn_start, range.num_pages);
        debug!("freed vaddr={:#x}, pages={}", vaddr, range.num_pages);
    }

    /// Simulates an access to the page holding `vaddr`, materializing host
    /// residency if needed. Writes set the dirty bit.
    pub fn touch_page(&self, vaddr: Address, is_write: bool) {
        let mut guard = self.state.write();
        let Some(st) = guard.as_mut() else {
            error!("virtual memory manager not initialized");
            return;
        };

        let vpn = vaddr_to_vpn(vaddr, st.config.page_size);
        self.probe_tlb(st, vpn);

        let mut entry = st.page_table.lookup(vpn);
        if entry.is_none() {
            self.counters.page_faults.fetch_add(1, Ordering::Relaxed);
            self.resolve_page_fault(st, vpn, Domain::Host);
            entry = st.page_table.lookup(vpn);
        }

        let Some(entry) = entry else {
            return;
        };
        if !entry.resident_host {
            self.resolve_page_fault(st, vpn, Domain::Host);
        }

        st.page_table.update_access(vpn);
        if is_write {
            st.page_table.mark_dirty(vpn);
        }
        st.policy.on_page_access(vpn);
        Self::refresh_tlb(st, vpn);
    }

    /// Forces host residency for the page holding `vaddr`.
    pub fn map_to_host(&self, vaddr: Address) {
        let mut guard = self.state.write();
        let Some(st) = guard.as_mut() else {
            return;
        };

        let vpn = vaddr_to_vpn(vaddr, st.config.page_size);
        self.probe_tlb(st, vpn);
        if st.page_table.lookup(vpn).is_none() {
            error!("map_to_host on unmapped address {:#x}", vaddr);
            return;
        }

        self.resolve_page_fault(st, vpn, Domain::Host);
        Self::refresh_tlb(st, vpn);
    }

    /// Forces device residency for the page holding `vaddr`, evicting a
    /// victim if the device pool is full.
    pub fn map_to_device(&self, vaddr: Address) {
        let mut guard = self.state.write();
        let Some(st) = guard.as_mut() else {
            return;
        };

        let vpn = vaddr_to_vpn(vaddr, st.config.page_size);
        self.probe_tlb(st, vpn);
        if st.page_table.lookup(vpn).is_none() {
            error!("map_to_device on unmapped address {:#x}", vaddr);
            return;
        }

        self.resolve_page_fault(st, vpn, Domain::Device);
        Self::refresh_tlb(st, vpn);
    }

    /// `map_to_device` plus prefetch accounting; gated by
    /// `enable_prefetch`.
    pub fn prefetch_to_device(&self, vaddr: Address) {
        {
            let guard = self.state.read();
            match guard.as_ref() {
                Some(st) if !st.config.enable_prefetch => {
                    debug!("prefetch disabled, ignoring hint for {:#x}", vaddr);
                    return;
                }
                Some(_) => {}
                None => return,
            }
        }

        self.map_to_device(vaddr);
        self.counters.prefetches.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies from the page holding `vaddr` into `buffer`, after ensuring
    /// host residency. The copy is bounded to the page: it starts at the
    /// in-page offset of `vaddr` and is clamped at the page end.
    pub fn read_from_vaddr(&self, vaddr: Address, buffer: &mut [u8]) {
        let mut guard = self.state.write();
        let Some(st) = guard.as_mut() else {
            error!("virtual memory manager not initialized");
            return;
        };
        if buffer.is_empty() {
            return;
        }

        let page_size = st.config.page_size;
        let vpn = vaddr_to_vpn(vaddr, page_size);
        self.probe_tlb(st, vpn);

        let Some(entry) = st.page_table.lookup(vpn) else {
            error!("read from invalid virtual address {:#x}", vaddr);
            return;
        };
        if !entry.resident_host {
            self.resolve_page_fault(st, vpn, Domain::Host);
        }

        let Some(entry) = st.page_table.lookup(vpn) else {
            return;
        };
        if entry.host_address.is_null() {
            error!("no host copy for vaddr {:#x}", vaddr);
            return;
        }

        let offset = (vaddr % page_size as u64) as usize;
        let n = buffer.len().min(page_size - offset);
        unsafe {
            core::ptr::copy_nonoverlapping(
                entry.host_address.add(offset),
                buffer.as_mut_ptr(),
                n,
            );
        }

        st.page_table.update_access(vpn);
        Self::refresh_tlb(st, vpn);
    }

    /// Copies `buffer` into the page holding `vaddr`, after ensuring host
    /// residency; marks the page dirty. Bounded like `read_from_vaddr`.
    pub fn write_to_vaddr(&self, vaddr: Address, buffer: &[u8]) {
        let mut guard = self.state.write();
        let Some(st) = guard.as_mut() else {
            error!("virtual memory manager not initialized");
            return;
        };
        if buffer.is_empty() {
            return;
        }

        let page_size = st.config.page_size;
        let vpn = vaddr_to_vpn(vaddr, page_size);
        self.probe_tlb(st, vpn);

        let Some(entry) = st.page_table.lookup(vpn) else {
            error!("write to invalid virtual address {:#x}", vaddr);
            return;
        };
        if !entry.resident_host {
            self.resolve_page_fault(st, vpn, Domain::Host);
        }

        let Some(entry) = st.page_table.lookup(vpn) else {
            return;
        };
        if entry.host_address.is_null() {
            error!("no host copy for vaddr {:#x}", vaddr);
            return;
        }

        let offset = (vaddr % page_size as u64) as usize;
        let n = buffer.len().min(page_size - offset);
        unsafe {
            core::ptr::copy_nonoverlapping(buffer.as_ptr(), entry.host_address.add(offset), n);
        }

        st.page_table.mark_dirty(vpn);
        st.page_table.update_access(vpn);
        Self::refresh_tlb(st, vpn);
    }

    /// Blocks until every queued asynchronous migration has been applied.
    pub fn sync_all_migrations(&self) {
        let guard = self.state.read();
        let Some(st) = guard.as_ref() else {
            return;
        };
        st.migration.wait_for_migrations();
        debug!("all migrations completed");
    }

    pub fn host_pages_used(&self) -> usize {
        let guard = self.state.read();
        match guard.as_ref() {
            Some(st) => st.allocator.total_host_pages() - st.allocator.available_host_pages(),
            None => 0,
        }
    }

    pub fn device_pages_used(&self) -> usize {
        let guard = self.state.read();
        match guard.as_ref() {
            Some(st) => st.device_resident.len(),
            None => 0,
        }
    }

    pub fn device_pages_available(&self) -> usize {
        let guard = self.state.read();
        match guard.as_ref() {
            Some(st) => st.allocator.available_device_pages(),
            None => 0,
        }
    }

    /// Configured page size, once initialized.
    pub fn page_size(&self) -> Option<usize> {
        self.state.read().as_ref().map(|st| st.config.page_size)
    }

    /// Snapshot of the page-table entry covering `vaddr`, if mapped.
    pub fn page_entry(&self, vaddr: Address) -> Option<PageTableEntry> {
        let guard = self.state.read();
        let st = guard.as_ref()?;
        st.page_table.lookup(vaddr_to_vpn(vaddr, st.config.page_size))
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    pub fn reset_counters(&self) {
        self.counters.reset();
    }

    /// Workload-owned counter: the core never launches kernels itself.
    pub fn record_kernel_launch(&self) {
        self.counters.kernel_launches.fetch_add(1, Ordering::Relaxed);
    }

    fn count_migration(&self, target: Domain, page_size: usize, elapsed_us: u64) {
        match target {
            Domain::Device => self
                .counters
                .host_to_device_migrations
                .fetch_add(1, Ordering::Relaxed),
            Domain::Host => self
                .counters
                .device_to_host_migrations
                .fetch_add(1, Ordering::Relaxed),
        };
        self.counters
            .bytes_migrated
            .fetch_add(page_size as u64, Ordering::Relaxed);
        self.counters
            .migration_time_us
            .fetch_add(elapsed_us, Ordering::Relaxed);
    }

    fn probe_tlb(&self, st: &VmState, vpn: VirtualPageNumber) {
        if st.tlb.lookup(vpn).is_some() {
            self.counters.tlb_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.tlb_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn refresh_tlb(st: &VmState, vpn: VirtualPageNumber) {
        if let Some(entry) = st.page_table.lookup(vpn) {
            st.tlb.insert(
                vpn,
                TlbEntry {
                    vpn,
                    host_address: entry.host_address,
                    device_address: entry.device_address,
                    last_use_us: 0,
                    valid: true,
                },
            );
        }
    }

    /// Materializes residency of `vpn` in `target`, migrating from the
    /// other domain when a copy exists there.
    ///
    /// Aborts, leaving the entry untouched, when no slot can be obtained
    /// in the target domain (for the device, after one eviction attempt).
    fn resolve_page_fault(&self, st: &mut VmState, vpn: VirtualPageNumber, target: Domain) {
        let Some(entry) = st.page_table.lookup(vpn) else {
            error!("page fault on invalid vpn {}", vpn);
            return;
        };
        let page_size = st.config.page_size;

        match target {
            Domain::Device => {
                if entry.resident_device {
                    return;
                }

                let mut device_addr = entry.device_address;
                if device_addr == 0 {
                    device_addr = st.allocator.allocate_device_page();
                    if device_addr == 0 {
                        self.evict_from_device(st);
                        device_addr = st.allocator.allocate_device_page();
                    }
                    if device_addr == 0 {
                        error!("device pool exhausted, fault on vpn {} aborted", vpn);
                        return;
                    }
                }

                if entry.resident_host {
                    let elapsed = st.migration.migrate_host_to_device(
                        vpn,
                        entry.host_address,
                        device_addr,
                        page_size,
                    );
                    self.count_migration(Domain::Device, page_size, elapsed);
                }

                st.page_table.set_device_resident(vpn, device_addr);
                st.device_resident.insert(vpn);
            }
            Domain::Host => {
                if entry.resident_host {
                    return;
                }

                let mut host_addr = entry.host_address;
                if host_addr.is_null() {
                    host_addr = st.allocator.allocate_host_page();
                    if host_addr.is_null() {
                        error!("host pool exhausted, fault on vpn {} aborted", vpn);
                        return;
                    }
                }

                if entry.resident_device {
                    let elapsed = st.migration.migrate_device_to_host(
                        vpn,
                        entry.device_address,
                        host_addr,
                        page_size,
                    );
                    self.count_migration(Domain::Host, page_size, elapsed);
                }

                st.page_table.set_host_resident(vpn, host_addr);
            }
        }
    }

    /// Evicts one page from the device domain: dirty pages with a host copy
    /// are written back first, then the slot is released and the page
    /// leaves the ledger and the TLB.
    fn evict_from_device(&self, st: &mut VmState) {
        if st.device_resident.is_empty() {
            return;
        }

        let evictable = |st: &VmState, vpn: VirtualPageNumber| {
            st.device_resident.contains(&vpn)
                && st
                    .page_table
                    .lookup(vpn)
                    .map(|e| !e.is_pinned)
                    .unwrap_or(false)
        };

        let mut victim = st.policy.select_victim();
        if victim == 0 || !evictable(st, victim) {
            // the policy tracks every allocated page, so its pick may be
            // host-only; fall back to the ledger
            match st
                .device_resident
                .iter()
                .copied()
                .find(|&vpn| evictable(st, vpn))
            {
                Some(vpn) => victim = vpn,
                None => return,
            }
        }

        let Some(entry) = st.page_table.lookup(victim) else {
            st.device_resident.remove(&victim);
            return;
        };

        if entry.is_dirty && entry.resident_host {
            let elapsed = st.migration.migrate_device_to_host(
                victim,
                entry.device_address,
                entry.host_address,
                st.config.page_size,
            );
            self.count_migration(Domain::Host, st.config.page_size, elapsed);
        }

        if entry.device_address != 0 {
            st.allocator.deallocate_device_page(entry.device_address);
        }
        st.page_table.with_entry_mut(victim, |e| {
            e.resident_device = false;
            e.device_address = 0;
        });
        st.device_resident.remove(&victim);
        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        st.tlb.invalidate(victim);

        debug!("evicted vpn {} from device", victim);
    }
}
