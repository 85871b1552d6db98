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

use libc::{
    c_void, mlock, mmap, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE,
};
use log::warn;

/// An anonymous private mapping that backs a page pool.
///
/// The mapping lives for as long as this guard and is unmapped on drop.
pub(crate) struct MmapBuffer {
    base: *mut u8,
    size: usize,
}

impl MmapBuffer {
    /// Maps `size` bytes. With `locked`, additionally tries to pin the
    /// mapping in RAM; pinning is advisory and failure only logs.
    pub(crate) fn new(size: usize, locked: bool) -> std::io::Result<Self> {
        let base_ptr = unsafe {
            mmap(
                null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if base_ptr == MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }

        if locked {
            let code = unsafe { mlock(base_ptr, size) };
            if code != 0 {
                warn!(
                    "could not lock {} bytes of pool memory: {}",
                    size,
                    std::io::Error::last_os_error()
                );
            }
        }

        Ok(MmapBuffer {
            base: base_ptr as *mut u8,
            size,
        })
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.base
    }

    pub(crate) fn len(&self) -> usize {
        self.size
    }

    /// Byte offset of `ptr` inside the mapping, or `None` if it points
    /// elsewhere.
    pub(crate) fn offset_of(&self, ptr: *mut u8) -> Option<usize> {
        let addr = ptr as usize;
        let base = self.base as usize;
        if addr < base || addr >= base + self.size {
            return None;
        }
        Some(addr - base)
    }
}

impl Drop for MmapBuffer {
    fn drop(&mut self) {
        let code = unsafe { munmap(self.base as *mut c_void, self.size) };
        if code != 0 {
            warn!("could not unmap pool memory at {:p}", self.base);
        }
    }
}

// The mapping is exclusively owned and only handed out through the
// allocator's lock.
unsafe impl Send for MmapBuffer {}
unsafe impl Sync for MmapBuffer {}
