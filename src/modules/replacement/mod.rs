mod clock;
mod lru;

pub use clock::ClockPolicyModule;
pub use lru::LruPolicyModule;

use crate::{ReplacementPolicyKind, VirtualPageNumber};

/// Orders the working set of pages for eviction victim selection.
///
/// Implementations are internally serialized; the façade calls them from
/// under its own lock without further coordination.
pub trait ReplacementPolicyModule: Send + Sync {
    /// The page enters the candidate pool.
    fn on_page_allocated(&self, vpn: VirtualPageNumber);

    /// Signals recency for the page, if it is still a candidate.
    fn on_page_access(&self, vpn: VirtualPageNumber);

    /// Removes the page from the candidate pool.
    fn on_page_freed(&self, vpn: VirtualPageNumber);

    /// Picks and removes one candidate, or 0 when the pool is empty.
    fn select_victim(&self) -> VirtualPageNumber;

    fn reset(&self);
}

pub(crate) fn new_policy(
    kind: ReplacementPolicyKind,
    max_pages: usize,
) -> Box<dyn ReplacementPolicyModule> {
    match kind {
        ReplacementPolicyKind::Lru => Box::new(LruPolicyModule::new(max_pages)),
        ReplacementPolicyKind::Clock => Box::new(ClockPolicyModule::new(max_pages)),
    }
}
