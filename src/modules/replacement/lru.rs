use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;

use super::ReplacementPolicyModule;
use crate::VirtualPageNumber;

struct LruState {
    queue: VecDeque<VirtualPageNumber>,
    members: HashSet<VirtualPageNumber>,
}

/// Least-recently-used ordering over the candidate pool.
///
/// The queue head is the coldest page; allocation appends to the tail and
/// an access moves the page back to the tail.
pub struct LruPolicyModule {
    max_pages: usize,
    inner: Mutex<LruState>,
}

impl LruPolicyModule {
    pub fn new(max_pages: usize) -> Self {
        LruPolicyModule {
            max_pages,
            inner: Mutex::new(LruState {
                queue: VecDeque::new(),
                members: HashSet::new(),
            }),
        }
    }
}

impl ReplacementPolicyModule for LruPolicyModule {
    fn on_page_allocated(&self, vpn: VirtualPageNumber) {
        let mut state = self.inner.lock();
        if state.members.insert(vpn) {
            state.queue.push_back(vpn);
        }

        // bound the working set, oldest entries fall off first
        while state.queue.len() > self.max_pages {
            if let Some(oldest) = state.queue.pop_front() {
                state.members.remove(&oldest);
            }
        }
    }

    fn on_page_access(&self, vpn: VirtualPageNumber) {
        let mut state = self.inner.lock();
        if !state.members.contains(&vpn) {
            return;
        }
        if let Some(pos) = state.queue.iter().position(|&v| v == vpn) {
            let _ = state.queue.remove(pos);
            state.queue.push_back(vpn);
        }
    }

    fn on_page_freed(&self, vpn: VirtualPageNumber) {
        let mut state = self.inner.lock();
        if state.members.remove(&vpn) {
            if let Some(pos) = state.queue.iter().position(|&v| v == vpn) {
                let _ = state.queue.remove(pos);
            }
        }
    }

    fn select_victim(&self) -> VirtualPageNumber {
        let mut state = self.inner.lock();
        match state.queue.pop_front() {
            Some(victim) => {
                state.members.remove(&victim);
                victim
            }
            None => 0,
        }
    }

    fn reset(&self) {
        let mut state = self.inner.lock();
        state.queue.clear();
        state.members.clear();
    }
}
