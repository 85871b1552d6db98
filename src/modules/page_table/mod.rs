use core::ptr::null_mut;
use std::collections::HashMap;

use log::{debug, warn};
use parking_lot::RwLock;

use crate::util::timestamp_us;
use crate::VirtualPageNumber;

/// Per-VPN residency descriptor.
///
/// `resident_host` and `host_address`, and `resident_device` and
/// `device_address`, move together: a page is resident in a domain exactly
/// when it holds a slot there.
#[derive(Debug, Clone, Copy)]
pub struct PageTableEntry {
    pub is_valid: bool,
    pub resident_host: bool,
    pub resident_device: bool,
    pub is_dirty: bool,
    pub is_pinned: bool,
    /// Reference bit mirrored for CLOCK-style inspection.
    pub clock_bit: bool,
    pub host_address: *mut u8,
    /// Synthetic device handle, 0 when no device slot is held.
    pub device_address: u64,
    pub last_access_us: u64,
    pub access_count: u32,
}

impl Default for PageTableEntry {
    fn default() -> Self {
        PageTableEntry {
            is_valid: false,
            resident_host: false,
            resident_device: false,
            is_dirty: false,
            is_pinned: false,
            clock_bit: false,
            host_address: null_mut(),
            device_address: 0,
            last_access_us: 0,
            access_count: 0,
        }
    }
}

pub struct PageTable {
    page_size: usize,
    capacity_pages: usize,
    entries: RwLock<HashMap<VirtualPageNumber, PageTableEntry>>,
}

// Host addresses stored in entries are simulator pool addresses; they are
// only dereferenced by the façade under its own lock. The map itself is
// guarded by `entries`.
unsafe impl Send for PageTable {}
unsafe impl Sync for PageTable {}

impl PageTable {
    pub fn new(page_size: usize, virtual_space_size: usize) -> Self {
        let capacity_pages = virtual_space_size / page_size;
        debug!(
            "page table initialized: {} pages (page_size={})",
            capacity_pages, page_size
        );
        PageTable {
            page_size,
            capacity_pages,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Registers `num_pages` fresh entries starting at `vpn_start`.
    ///
    /// Fails without touching the table if any VPN in the range is already
    /// live; entries are never silently overwritten.
    pub fn allocate_vpn_range(&self, vpn_start: VirtualPageNumber, num_pages: u32) -> bool {
        let mut entries = self.entries.write();

        for i in 0..num_pages as u64 {
            if entries.contains_key(&(vpn_start + i)) {
                warn!("vpn {} already allocated", vpn_start + i);
                return false;
            }
        }

        for i in 0..num_pages as u64 {
            let mut entry = PageTableEntry::default();
            entry.is_valid = true;
            entries.insert(vpn_start + i, entry);
        }

        debug!(
            "allocated vpn range [{}, {})",
            vpn_start,
            vpn_start + num_pages as u64
        );
        true
    }

    pub fn deallocate_vpn_range(&self, vpn_start: VirtualPageNumber, num_pages: u32) {
        let mut entries = self.entries.write();
        for i in 0..num_pages as u64 {
            entries.remove(&(vpn_start + i));
        }
        debug!(
            "deallocated vpn range [{}, {})",
            vpn_start,
            vpn_start + num_pages as u64
        );
    }

    /// Snapshot of the live entry for `vpn`, if any. Never creates entries.
    pub fn lookup(&self, vpn: VirtualPageNumber) -> Option<PageTableEntry> {
        self.entries.read().get(&vpn).copied()
    }

    /// Runs `f` on the live entry under the exclusive lock.
    pub fn with_entry_mut<R>(
        &self,
        vpn: VirtualPageNumber,
        f: impl FnOnce(&mut PageTableEntry) -> R,
    ) -> Option<R> {
        self.entries.write().get_mut(&vpn).map(f)
    }

    pub fn set_host_resident(&self, vpn: VirtualPageNumber, host_addr: *mut u8) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(&vpn) {
            entry.resident_host = true;
            entry.host_address = host_addr;
            entry.last_access_us = timestamp_us();
        }
    }

    pub fn set_device_resident(&self, vpn: VirtualPageNumber, device_addr: u64) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(&vpn) {
            entry.resident_device = true;
            entry.device_address = device_addr;
            entry.last_access_us = timestamp_us();
        }
    }

    pub fn mark_dirty(&self, vpn: VirtualPageNumber) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(&vpn) {
            entry.is_dirty = true;
        }
    }

    pub fn clear_dirty(&self, vpn: VirtualPageNumber) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(&vpn) {
            entry.is_dirty = false;
        }
    }

    pub fn update_access(&self, vpn: VirtualPageNumber) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(&vpn) {
            entry.last_access_us = timestamp_us();
            entry.access_count += 1;
            entry.clock_bit = true;
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Snapshot of all valid entries.
    pub fn entries(&self) -> Vec<(VirtualPageNumber, PageTableEntry)> {
        self.entries
            .read()
            .iter()
            .filter(|(_, e)| e.is_valid)
            .map(|(&vpn, &e)| (vpn, e))
            .collect()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn capacity_pages(&self) -> usize {
        self.capacity_pages
    }
}
