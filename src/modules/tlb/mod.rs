use core::ptr::null_mut;

use log::debug;
use parking_lot::Mutex;

use crate::util::{hash_vpn, timestamp_us};
use crate::VirtualPageNumber;

/// A cached translation from VPN to the page's per-domain addresses.
#[derive(Debug, Clone, Copy)]
pub struct TlbEntry {
    pub vpn: VirtualPageNumber,
    pub host_address: *mut u8,
    pub device_address: u64,
    pub last_use_us: u64,
    pub valid: bool,
}

impl Default for TlbEntry {
    fn default() -> Self {
        TlbEntry {
            vpn: 0,
            host_address: null_mut(),
            device_address: 0,
            last_use_us: 0,
            valid: false,
        }
    }
}

struct TlbState {
    sets: Vec<Vec<TlbEntry>>,
    hits: u64,
    misses: u64,
}

/// Set-associative translation cache with per-set LRU replacement.
pub struct Tlb {
    num_sets: usize,
    associativity: usize,
    inner: Mutex<TlbState>,
}

// Cached host addresses are simulator pool addresses, never dereferenced
// through the cache itself.
unsafe impl Send for Tlb {}
unsafe impl Sync for Tlb {}

impl Tlb {
    pub fn new(tlb_size: usize, associativity: usize) -> Self {
        assert!(associativity > 0, "associativity has to be nonzero");
        assert!(
            tlb_size >= associativity && tlb_size % associativity == 0,
            "tlb_size has to be a nonzero multiple of associativity"
        );

        let num_sets = tlb_size / associativity;
        debug!(
            "tlb initialized: {} sets, {}-way associative",
            num_sets, associativity
        );

        Tlb {
            num_sets,
            associativity,
            inner: Mutex::new(TlbState {
                sets: (0..num_sets)
                    .map(|_| Vec::with_capacity(associativity))
                    .collect(),
                hits: 0,
                misses: 0,
            }),
        }
    }

    fn set_index(&self, vpn: VirtualPageNumber) -> usize {
        hash_vpn(vpn) as usize % self.num_sets
    }

    /// On a hit the entry's `last_use_us` is refreshed and a copy returned.
    pub fn lookup(&self, vpn: VirtualPageNumber) -> Option<TlbEntry> {
        let set_idx = self.set_index(vpn);
        let mut guard = self.inner.lock();
        let state = &mut *guard;

        for entry in state.sets[set_idx].iter_mut() {
            if entry.valid && entry.vpn == vpn {
                entry.last_use_us = timestamp_us();
                let hit = *entry;
                state.hits += 1;
                return Some(hit);
            }
        }

        state.misses += 1;
        None
    }

    /// Installs a translation. An entry for the same VPN is overwritten in
    /// place; a full set evicts its least recently used entry (ties go to
    /// the earliest inserted).
    pub fn insert(&self, vpn: VirtualPageNumber, entry: TlbEntry) {
        let set_idx = self.set_index(vpn);
        let mut state = self.inner.lock();
        let set = &mut state.sets[set_idx];

        let mut new_entry = entry;
        new_entry.vpn = vpn;
        new_entry.last_use_us = timestamp_us();
        new_entry.valid = true;

        for e in set.iter_mut() {
            if e.vpn == vpn {
                *e = new_entry;
                return;
            }
        }

        if set.len() >= self.associativity {
            let mut min_idx = 0;
            for i in 1..set.len() {
                if set[i].last_use_us < set[min_idx].last_use_us {
                    min_idx = i;
                }
            }
            set.remove(min_idx);
        }
        set.push(new_entry);
    }

    pub fn invalidate(&self, vpn: VirtualPageNumber) {
        let set_idx = self.set_index(vpn);
        let mut state = self.inner.lock();
        let set = &mut state.sets[set_idx];

        if let Some(pos) = set.iter().position(|e| e.vpn == vpn) {
            set.remove(pos);
        }
    }

    pub fn flush(&self) {
        let mut state = self.inner.lock();
        for set in state.sets.iter_mut() {
            set.clear();
        }
    }

    pub fn hits(&self) -> u64 {
        self.inner.lock().hits
    }

    pub fn misses(&self) -> u64 {
        self.inner.lock().misses
    }

    pub fn hit_rate(&self) -> f64 {
        let state = self.inner.lock();
        let total = state.hits + state.misses;
        if total == 0 {
            return 0.0;
        }
        state.hits as f64 / total as f64
    }

    pub fn reset_stats(&self) {
        let mut state = self.inner.lock();
        state.hits = 0;
        state.misses = 0;
    }

    pub fn size(&self) -> usize {
        self.num_sets * self.associativity
    }

    pub fn associativity(&self) -> usize {
        self.associativity
    }
}
