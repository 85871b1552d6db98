use parking_lot::Mutex;

use super::ReplacementPolicyModule;
use crate::VirtualPageNumber;

struct ClockEntry {
    vpn: VirtualPageNumber,
    referenced: bool,
}

struct ClockState {
    ring: Vec<ClockEntry>,
    hand: usize,
}

/// Second-chance (CLOCK) ordering over the candidate pool.
///
/// Accesses set a per-entry reference bit; victim selection sweeps the ring
/// from the hand, clearing bits until it finds a cleared one, and takes the
/// entry the hand rests on.
pub struct ClockPolicyModule {
    max_pages: usize,
    inner: Mutex<ClockState>,
}

impl ClockPolicyModule {
    pub fn new(max_pages: usize) -> Self {
        ClockPolicyModule {
            max_pages,
            inner: Mutex::new(ClockState {
                ring: Vec::new(),
                hand: 0,
            }),
        }
    }
}

impl ReplacementPolicyModule for ClockPolicyModule {
    fn on_page_allocated(&self, vpn: VirtualPageNumber) {
        let mut guard = self.inner.lock();
        let state = &mut *guard;

        if state.ring.iter().any(|e| e.vpn == vpn) {
            return;
        }
        state.ring.push(ClockEntry {
            vpn,
            referenced: false,
        });

        // bound the working set by consuming entries at the hand
        while state.ring.len() > self.max_pages {
            if state.hand >= state.ring.len() {
                state.hand = 0;
            }
            state.ring.remove(state.hand);
        }
        if state.hand >= state.ring.len() {
            state.hand = 0;
        }
    }

    fn on_page_access(&self, vpn: VirtualPageNumber) {
        let mut state = self.inner.lock();
        if let Some(entry) = state.ring.iter_mut().find(|e| e.vpn == vpn) {
            entry.referenced = true;
        }
    }

    fn on_page_freed(&self, vpn: VirtualPageNumber) {
        let mut guard = self.inner.lock();
        let state = &mut *guard;

        if let Some(pos) = state.ring.iter().position(|e| e.vpn == vpn) {
            state.ring.remove(pos);
            if pos < state.hand {
                state.hand -= 1;
            }
            if state.hand >= state.ring.len() {
                state.hand = 0;
            }
        }
    }

    fn select_victim(&self) -> VirtualPageNumber {
        let mut guard = self.inner.lock();
        let state = &mut *guard;

        if state.ring.is_empty() {
            return 0;
        }

        let len = state.ring.len();
        if state.hand >= len {
            state.hand = 0;
        }

        // one full sweep of second chances at most; afterwards the entry at
        // the hand is taken unconditionally
        for _ in 0..len {
            if !state.ring[state.hand].referenced {
                break;
            }
            state.ring[state.hand].referenced = false;
            state.hand = (state.hand + 1) % len;
        }

        // removing at the hand leaves it pointing at the next entry
        let victim = state.ring.remove(state.hand).vpn;
        if state.hand >= state.ring.len() {
            state.hand = 0;
        }
        victim
    }

    fn reset(&self) {
        let mut state = self.inner.lock();
        state.ring.clear();
        state.hand = 0;
    }
}
