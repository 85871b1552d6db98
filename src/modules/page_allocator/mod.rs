/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use core::ptr::null_mut;

use log::{trace, warn};
use parking_lot::Mutex;
use static_assertions::const_assert;

use crate::util::{bit_array::BitArray, mmap_buffer::MmapBuffer};

/// Start of the synthetic device address range. Nonzero so 0 stays the
/// "not allocated" sentinel for device handles.
pub const DEVICE_POOL_BASE: u64 = 0x1_0000_0000;

const_assert!(DEVICE_POOL_BASE > 0);

pub struct PageAllocatorConfig {
    pub page_size: usize,
    pub host_pool_size: usize,
    pub device_pool_size: usize,
    /// Advisory: lock the host pool in RAM.
    pub use_pinned_host_memory: bool,
    /// Back the device range with a host mapping that models device RAM.
    pub use_device_simulator: bool,
}

impl Default for PageAllocatorConfig {
    fn default() -> Self {
        PageAllocatorConfig {
            page_size: crate::DEFAULT_PAGE_SIZE,
            host_pool_size: 1024 * 1024 * 1024,
            device_pool_size: crate::DEFAULT_DEVICE_MEMORY,
            use_pinned_host_memory: true,
            use_device_simulator: false,
        }
    }
}

struct PoolState {
    host_pool: MmapBuffer,
    host_bitmap: BitArray,
    host_allocated: usize,
    /// Models the accelerator's RAM in simulator mode; device handles stay
    /// synthetic either way.
    #[allow(dead_code)]
    device_backing: Option<MmapBuffer>,
    device_bitmap: BitArray,
    device_allocated: usize,
}

/// Hands out fixed-size page slots from two fixed-capacity pools: a host
/// pool of real bytes and a synthetic device address range.
pub struct PageAllocator {
    config: PageAllocatorConfig,
    inner: Mutex<PoolState>,
}

impl PageAllocator {
    pub fn new(config: PageAllocatorConfig) -> std::io::Result<Self> {
        let num_host_pages = config.host_pool_size / config.page_size;
        let num_device_pages = config.device_pool_size / config.page_size;

        let host_pool = MmapBuffer::new(config.host_pool_size, config.use_pinned_host_memory)?;
        let device_backing = if config.use_device_simulator {
            Some(MmapBuffer::new(config.device_pool_size, false)?)
        } else {
            None
        };

        trace!(
            "page allocator initialized: host={} pages, device={} pages",
            num_host_pages,
            num_device_pages
        );

        Ok(PageAllocator {
            config,
            inner: Mutex::new(PoolState {
                host_pool,
                host_bitmap: BitArray::new(num_host_pages),
                host_allocated: 0,
                device_backing,
                device_bitmap: BitArray::new(num_device_pages),
                device_allocated: 0,
            }),
        })
    }

    /// First free host slot, or null when the pool is exhausted.
    pub fn allocate_host_page(&self) -> *mut u8 {
        let mut state = self.inner.lock();

        for i in 0..state.host_bitmap.len() {
            if !state.host_bitmap.is_set(i) {
                state.host_bitmap.set(i);
                state.host_allocated += 1;
                let page_addr = unsafe { state.host_pool.base().add(i * self.config.page_size) };
                trace!("allocated host page {} at {:p}", i, page_addr);
                return page_addr;
            }
        }

        warn!("no free host pages available");
        null_mut()
    }

    /// Returns a host slot to the pool. Pointers outside the pool and
    /// already-free slots are logged and ignored.
    pub fn deallocate_host_page(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        let mut state = self.inner.lock();

        let Some(offset) = state.host_pool.offset_of(ptr) else {
            warn!("attempted to deallocate foreign host pointer {:p}", ptr);
            return;
        };

        let page_idx = offset / self.config.page_size;
        if page_idx < state.host_bitmap.len() && state.host_bitmap.is_set(page_idx) {
            state.host_bitmap.clear(page_idx);
            state.host_allocated -= 1;
            trace!("deallocated host page {}", page_idx);
        }
    }

    /// First free device slot as a synthetic address, or 0 on exhaustion.
    pub fn allocate_device_page(&self) -> u64 {
        let mut state = self.inner.lock();

        for i in 0..state.device_bitmap.len() {
            if !state.device_bitmap.is_set(i) {
                state.device_bitmap.set(i);
                state.device_allocated += 1;
                let device_addr = DEVICE_POOL_BASE + (i * self.config.page_size) as u64;
                trace!("allocated device page {} at {:#x}", i, device_addr);
                return device_addr;
            }
        }

        warn!("no free device pages available");
        0
    }

    pub fn deallocate_device_page(&self, device_addr: u64) {
        let mut state = self.inner.lock();

        if device_addr < DEVICE_POOL_BASE {
            warn!("invalid device address {:#x}", device_addr);
            return;
        }

        let page_idx = ((device_addr - DEVICE_POOL_BASE) / self.config.page_size as u64) as usize;
        if page_idx < state.device_bitmap.len() && state.device_bitmap.is_set(page_idx) {
            state.device_bitmap.clear(page_idx);
            state.device_allocated -= 1;
            trace!("deallocated device page {}", page_idx);
        }
    }

    pub fn available_host_pages(&self) -> usize {
        let state = self.inner.lock();
        state.host_bitmap.len() - state.host_allocated
    }

    pub fn available_device_pages(&self) -> usize {
        let state = self.inner.lock();
        state.device_bitmap.len() - state.device_allocated
    }

    pub fn total_host_pages(&self) -> usize {
        self.inner.lock().host_bitmap.len()
    }

    pub fn total_device_pages(&self) -> usize {
        self.inner.lock().device_bitmap.len()
    }

    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    pub fn is_simulator_mode(&self) -> bool {
        self.config.use_device_simulator
    }
}
