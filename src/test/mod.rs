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

use std::sync::Mutex;

use rand::{Rng, SeedableRng};

use crate::{ReplacementPolicyKind, UvmConfig, UvmArray, VirtualMemoryManager};

/// The manager is process-wide, so scenario tests take turns.
static VM_TEST_LOCK: Mutex<()> = Mutex::new(());

const PAGE_SIZE: usize = 64 * 1024;
const MIB: usize = 1024 * 1024;

fn test_config() -> UvmConfig {
    UvmConfig {
        page_size: PAGE_SIZE,
        virtual_address_space: 16 * 1024 * MIB,
        host_memory: 64 * MIB,
        device_memory: 64 * MIB,
        tlb_size: 1024,
        tlb_associativity: 8,
        replacement_policy: ReplacementPolicyKind::Lru,
        use_pinned_host_memory: false,
        use_device_simulator: true,
        ..Default::default()
    }
}

fn with_test_vm<R>(config: UvmConfig, f: impl FnOnce(&'static VirtualMemoryManager) -> R) -> R {
    let _guard = VM_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let _ = env_logger::builder().is_test(true).try_init();

    let vm = VirtualMemoryManager::instance();
    // clean up after a test that died mid-scenario
    vm.shutdown();
    vm.initialize(config);

    let result = f(vm);

    vm.shutdown();
    result
}

#[test]
fn test_allocate_free_symmetry() {
    with_test_vm(test_config(), |vm| {
        let vaddr = vm.allocate(MIB, false).unwrap();
        assert_eq!(vm.host_pages_used(), 16);

        vm.free(vaddr);
        assert_eq!(vm.host_pages_used(), 0);
        assert_eq!(vm.device_pages_used(), 0);
        assert_eq!(vm.counters().page_faults, 0);
    });
}

#[test]
fn test_write_read_round_trip() {
    with_test_vm(test_config(), |vm| {
        let vaddr = vm.allocate(MIB, false).unwrap();

        let value = 0xDEADBEEFu32;
        vm.write_to_vaddr(vaddr, &value.to_le_bytes());

        let mut out = [0u8; 4];
        vm.read_from_vaddr(vaddr, &mut out);
        assert_eq!(u32::from_le_bytes(out), 0xDEADBEEF);

        let entry = vm.page_entry(vaddr).unwrap();
        assert!(entry.is_dirty);
        assert!(entry.resident_host);

        vm.free(vaddr);
    });
}

#[test]
fn test_round_trip_at_page_offsets() {
    with_test_vm(test_config(), |vm| {
        let vaddr = vm.allocate(MIB, false).unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);

        for offset in [0u64, 1, 4095, PAGE_SIZE as u64 - 64, 3 * PAGE_SIZE as u64 + 17] {
            let data: Vec<u8> = (0..64).map(|_| rng.gen()).collect();
            vm.write_to_vaddr(vaddr + offset, &data);

            let mut out = vec![0u8; 64];
            vm.read_from_vaddr(vaddr + offset, &mut out);
            assert_eq!(out, data, "offset {}", offset);
        }

        vm.free(vaddr);
    });
}

#[test]
fn test_touch_write_sets_dirty_and_host_residency() {
    with_test_vm(test_config(), |vm| {
        let vaddr = vm.allocate(4 * PAGE_SIZE, false).unwrap();

        vm.touch_page(vaddr + PAGE_SIZE as u64, true);

        let entry = vm.page_entry(vaddr + PAGE_SIZE as u64).unwrap();
        assert!(entry.is_dirty);
        assert!(entry.resident_host);
        assert!(entry.access_count > 0);

        // touching an untouched sibling page left it clean
        assert!(!vm.page_entry(vaddr).unwrap().is_dirty);

        vm.free(vaddr);
    });
}

#[test]
fn test_map_to_device_is_idempotent() {
    with_test_vm(test_config(), |vm| {
        let vaddr = vm.allocate(PAGE_SIZE, false).unwrap();

        vm.map_to_device(vaddr);
        vm.map_to_device(vaddr);

        let counters = vm.counters();
        assert_eq!(counters.host_to_device_migrations, 1);
        assert_eq!(counters.device_to_host_migrations, 0);
        assert_eq!(counters.bytes_migrated, PAGE_SIZE as u64);
        assert!(vm.page_entry(vaddr).unwrap().resident_device);

        vm.free(vaddr);
    });
}

#[test]
fn test_bytes_migrated_tracks_migration_counts() {
    with_test_vm(test_config(), |vm| {
        let vaddr = vm.allocate(8 * PAGE_SIZE, true).unwrap();
        for i in 0..8u64 {
            vm.map_to_device(vaddr + i * PAGE_SIZE as u64);
            vm.map_to_host(vaddr + i * PAGE_SIZE as u64);
        }

        let counters = vm.counters();
        assert_eq!(
            counters.bytes_migrated,
            PAGE_SIZE as u64
                * (counters.host_to_device_migrations + counters.device_to_host_migrations)
        );
        assert!(counters.prefetches >= 8);

        vm.free(vaddr);
    });
}

#[test]
fn test_invalid_accesses_are_harmless() {
    with_test_vm(test_config(), |vm| {
        let far = 1024 * MIB as u64;

        let faults_before = vm.counters().page_faults;
        vm.touch_page(far, true);
        assert_eq!(vm.counters().page_faults, faults_before + 1);

        let mut out = [0u8; 4];
        vm.read_from_vaddr(far, &mut out);
        assert_eq!(out, [0u8; 4]);
        vm.write_to_vaddr(far, &[1, 2, 3, 4]);
        vm.map_to_device(far);
        vm.map_to_host(far);

        // nothing materialized for the unmapped address
        assert!(vm.page_entry(far).is_none());
        assert_eq!(vm.host_pages_used(), 0);

        // freeing an unmapped address is a no-op
        vm.free(far);
        vm.free(0);
    });
}

#[test]
fn test_allocation_rolls_back_on_host_exhaustion() {
    let config = UvmConfig {
        host_memory: MIB, // 16 pages
        ..test_config()
    };
    with_test_vm(config, |vm| {
        assert!(vm.allocate(2 * MIB, false).is_none());
        assert_eq!(vm.host_pages_used(), 0);

        // a fitting allocation still works afterwards
        let vaddr = vm.allocate(MIB / 2, false).unwrap();
        assert_eq!(vm.host_pages_used(), 8);
        vm.free(vaddr);
    });
}

#[test]
fn test_exact_device_fit_plus_one_forces_one_eviction() {
    let config = UvmConfig {
        device_memory: 4 * PAGE_SIZE,
        ..test_config()
    };
    with_test_vm(config, |vm| {
        let vaddr = vm.allocate(5 * PAGE_SIZE, false).unwrap();

        for i in 0..4u64 {
            vm.map_to_device(vaddr + i * PAGE_SIZE as u64);
        }
        assert_eq!(vm.counters().evictions, 0);
        assert_eq!(vm.device_pages_used(), 4);

        vm.map_to_device(vaddr + 4 * PAGE_SIZE as u64);
        assert_eq!(vm.counters().evictions, 1);
        assert_eq!(vm.device_pages_used(), 4);

        vm.free(vaddr);
    });
}

#[test]
fn test_device_overflow_walk_keeps_tail_resident() {
    let num_pages = 64u64;
    let config = UvmConfig {
        device_memory: 32 * PAGE_SIZE,
        host_memory: 8 * MIB,
        ..test_config()
    };
    with_test_vm(config, |vm| {
        let vaddr = vm.allocate(num_pages as usize * PAGE_SIZE, true).unwrap();

        // the prefetch filled the device pool and stopped
        assert_eq!(vm.device_pages_used(), 32);

        for i in 0..num_pages {
            vm.map_to_device(vaddr + i * PAGE_SIZE as u64);
        }

        let counters = vm.counters();
        assert!(counters.evictions > 0);
        assert!(vm.device_pages_used() <= 32);

        // a monotonic walk leaves the last half of the pages resident
        for i in num_pages / 2..num_pages {
            let entry = vm.page_entry(vaddr + i * PAGE_SIZE as u64).unwrap();
            assert!(entry.resident_device, "page {} should be device resident", i);
        }
        for i in 0..num_pages / 2 {
            let entry = vm.page_entry(vaddr + i * PAGE_SIZE as u64).unwrap();
            assert!(!entry.resident_device, "page {} should have been evicted", i);
        }

        vm.free(vaddr);
        assert_eq!(vm.device_pages_used(), 0);
        assert_eq!(vm.host_pages_used(), 0);
    });
}

#[test]
fn test_dirty_eviction_counts_a_writeback() {
    let config = UvmConfig {
        device_memory: PAGE_SIZE,
        ..test_config()
    };
    with_test_vm(config, |vm| {
        let vaddr = vm.allocate(2 * PAGE_SIZE, false).unwrap();

        vm.map_to_device(vaddr);
        vm.touch_page(vaddr, true); // dirty the resident page

        // mapping the second page evicts the first, which needs a writeback
        vm.map_to_device(vaddr + PAGE_SIZE as u64);

        let counters = vm.counters();
        assert_eq!(counters.evictions, 1);
        assert_eq!(counters.device_to_host_migrations, 1);
        assert_eq!(counters.host_to_device_migrations, 2);

        vm.free(vaddr);
    });
}

#[test]
fn test_free_invalidates_translations() {
    with_test_vm(test_config(), |vm| {
        let vaddr = vm.allocate(4 * PAGE_SIZE, false).unwrap();
        for i in 0..4u64 {
            vm.touch_page(vaddr + i * PAGE_SIZE as u64, false);
        }
        vm.free(vaddr);

        vm.reset_counters();
        for i in 0..4u64 {
            vm.touch_page(vaddr + i * PAGE_SIZE as u64, false);
        }

        // every translation was dropped with the allocation
        let counters = vm.counters();
        assert_eq!(counters.tlb_hits, 0);
        assert_eq!(counters.tlb_misses, 4);
        assert_eq!(counters.page_faults, 4);
    });
}

#[test]
fn test_tlb_counters_cover_all_lookups() {
    with_test_vm(test_config(), |vm| {
        let vaddr = vm.allocate(2 * PAGE_SIZE, false).unwrap();

        vm.touch_page(vaddr, false); // miss
        vm.touch_page(vaddr, false); // hit
        vm.touch_page(vaddr + PAGE_SIZE as u64, false); // miss
        vm.map_to_host(vaddr); // hit

        let counters = vm.counters();
        assert_eq!(counters.tlb_hits + counters.tlb_misses, 4);
        assert_eq!(counters.tlb_hits, 2);

        vm.free(vaddr);
    });
}

#[test]
fn test_clock_policy_end_to_end() {
    let config = UvmConfig {
        replacement_policy: ReplacementPolicyKind::Clock,
        device_memory: 4 * PAGE_SIZE,
        ..test_config()
    };
    with_test_vm(config, |vm| {
        let vaddr = vm.allocate(8 * PAGE_SIZE, false).unwrap();
        for i in 0..8u64 {
            vm.map_to_device(vaddr + i * PAGE_SIZE as u64);
        }

        let counters = vm.counters();
        assert_eq!(counters.evictions, 4);
        assert_eq!(vm.device_pages_used(), 4);

        vm.free(vaddr);
    });
}

#[test]
fn test_double_initialize_keeps_first_config() {
    with_test_vm(test_config(), |vm| {
        // second call warns and leaves the 64 KiB geometry in place
        vm.initialize(UvmConfig {
            page_size: 4096,
            ..test_config()
        });

        let vaddr = vm.allocate(1, false).unwrap();
        assert_eq!(vm.page_size(), Some(PAGE_SIZE));
        assert_eq!(vm.host_pages_used(), 1);
        vm.free(vaddr);
    });
}

#[test]
fn test_reinitialize_after_shutdown() {
    let _guard = VM_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    let vm = VirtualMemoryManager::instance();
    vm.shutdown();

    vm.initialize(test_config());
    let vaddr = vm.allocate(PAGE_SIZE, false).unwrap();
    vm.free(vaddr);
    vm.shutdown();
    vm.shutdown(); // repeatable

    // operations without a live manager fail soft
    assert!(vm.allocate(PAGE_SIZE, false).is_none());
    assert_eq!(vm.host_pages_used(), 0);

    vm.initialize(test_config());
    assert!(vm.allocate(PAGE_SIZE, false).is_some());
    vm.shutdown();
}

#[test]
fn test_sync_all_migrations_is_safe() {
    with_test_vm(test_config(), |vm| {
        // nothing queued: returns immediately
        vm.sync_all_migrations();

        let vaddr = vm.allocate(4 * PAGE_SIZE, true).unwrap();
        vm.sync_all_migrations();
        vm.free(vaddr);
    });
}

#[test]
fn test_uvm_array_round_trip() {
    with_test_vm(test_config(), |vm| {
        let mut arr = UvmArray::<u64>::new(1000, false).unwrap();
        assert_eq!(arr.len(), 1000);

        for i in 0..1000 {
            assert!(arr.write(i, (i as u64) * 3));
        }
        for i in 0..1000 {
            assert_eq!(arr.read(i), Some((i as u64) * 3));
        }

        assert!(arr.read(1000).is_none());
        assert!(!arr.write(1000, 0));

        let pages_with_array = vm.host_pages_used();
        assert!(pages_with_array > 0);
        drop(arr);
        assert_eq!(vm.host_pages_used(), 0);
    });
}

#[test]
fn test_kernel_launch_counter_is_caller_owned() {
    with_test_vm(test_config(), |vm| {
        vm.record_kernel_launch();
        vm.record_kernel_launch();
        assert_eq!(vm.counters().kernel_launches, 2);

        vm.reset_counters();
        assert_eq!(vm.counters().kernel_launches, 0);
    });
}
