pub(crate) mod bit_array;
pub(crate) mod mmap_buffer;

use std::sync::OnceLock;
use std::time::Instant;

use crate::{Address, VirtualPageNumber};

#[inline]
pub fn vaddr_to_vpn(vaddr: Address, page_size: usize) -> VirtualPageNumber {
    vaddr / page_size as u64
}

#[inline]
pub fn vpn_to_vaddr(vpn: VirtualPageNumber, page_size: usize) -> Address {
    vpn * page_size as u64
}

/// Rounds `size` up to the next multiple of `page_size`.
#[inline]
pub fn align_to_page(size: usize, page_size: usize) -> usize {
    ((size + page_size - 1) / page_size) * page_size
}

/// Microseconds since the first call in this process.
///
/// All access and translation timestamps share this clock, so only their
/// ordering matters, not their absolute value.
pub(crate) fn timestamp_us() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as u64
}

/// Byte-wise FNV-1a mix of the VPN, used for TLB set selection.
pub(crate) fn hash_vpn(vpn: VirtualPageNumber) -> u32 {
    let mut hash: u32 = 2166136261;
    for i in 0..8 {
        hash ^= ((vpn >> (i * 8)) & 0xff) as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}
