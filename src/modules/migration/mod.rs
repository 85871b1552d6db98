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

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::modules::page_table::PageTable;
use crate::util::timestamp_us;
use crate::VirtualPageNumber;

/// Delay model: bytes moved per microsecond, a 16 GB/s interconnect.
pub(crate) const SIM_BANDWIDTH_BYTES_PER_US: u64 = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationDirection {
    HostToDevice,
    DeviceToHost,
}

#[derive(Clone, Copy)]
struct MigrationJob {
    vpn: VirtualPageNumber,
    direction: MigrationDirection,
    host_addr: *mut u8,
    device_addr: u64,
    bytes: usize,
}

// The host pointer is a simulator pool address carried as data; jobs never
// dereference it.
unsafe impl Send for MigrationJob {}

pub struct MigrationManagerConfig {
    pub async_migrations: bool,
    pub max_concurrent_migrations: usize,
}

impl Default for MigrationManagerConfig {
    fn default() -> Self {
        MigrationManagerConfig {
            async_migrations: true,
            max_concurrent_migrations: crate::DEFAULT_MIGRATION_WORKERS,
        }
    }
}

struct QueueState {
    jobs: VecDeque<MigrationJob>,
    in_flight: usize,
    shutdown: bool,
}

struct JobQueue {
    state: Mutex<QueueState>,
    job_ready: Condvar,
    all_done: Condvar,
}

/// Executes page copies between the domains, synchronously or through a
/// FIFO queue drained by a worker pool.
///
/// Counters are the façade's concern: the manager only reports elapsed time
/// and mutates residency flags on completion.
pub struct MigrationManager {
    page_table: Arc<PageTable>,
    config: MigrationManagerConfig,
    queue: Arc<JobQueue>,
    workers: Vec<JoinHandle<()>>,
}

impl MigrationManager {
    pub fn new(page_table: Arc<PageTable>, config: MigrationManagerConfig) -> Self {
        let queue = Arc::new(JobQueue {
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                in_flight: 0,
                shutdown: false,
            }),
            job_ready: Condvar::new(),
            all_done: Condvar::new(),
        });

        let mut workers = Vec::new();
        if config.async_migrations {
            for i in 0..config.max_concurrent_migrations {
                let queue = queue.clone();
                let table = page_table.clone();
                let handle = thread::Builder::new()
                    .name(format!("uvm-migrate-{}", i))
                    .spawn(move || worker_loop(queue, table))
                    .expect("could not spawn migration worker");
                workers.push(handle);
            }
        }

        MigrationManager {
            page_table,
            config,
            queue,
            workers,
        }
    }

    /// Copies a page host → device. Returns the elapsed wall-clock
    /// microseconds, or 0 if the migration did not happen.
    pub fn migrate_host_to_device(
        &self,
        vpn: VirtualPageNumber,
        host_addr: *mut u8,
        device_addr: u64,
        bytes: usize,
    ) -> u64 {
        if host_addr.is_null() || device_addr == 0 {
            return 0;
        }
        execute(
            &self.page_table,
            MigrationJob {
                vpn,
                direction: MigrationDirection::HostToDevice,
                host_addr,
                device_addr,
                bytes,
            },
        )
    }

    /// Copies a page device → host. Returns the elapsed wall-clock
    /// microseconds, or 0 if the migration did not happen.
    pub fn migrate_device_to_host(
        &self,
        vpn: VirtualPageNumber,
        device_addr: u64,
        host_addr: *mut u8,
        bytes: usize,
    ) -> u64 {
        if host_addr.is_null() || device_addr == 0 {
            return 0;
        }
        execute(
            &self.page_table,
            MigrationJob {
                vpn,
                direction: MigrationDirection::DeviceToHost,
                host_addr,
                device_addr,
                bytes,
            },
        )
    }

    pub fn async_migrate_host_to_device(
        &self,
        vpn: VirtualPageNumber,
        host_addr: *mut u8,
        device_addr: u64,
        bytes: usize,
    ) {
        if host_addr.is_null() || device_addr == 0 {
            return;
        }
        self.submit(MigrationJob {
            vpn,
            direction: MigrationDirection::HostToDevice,
            host_addr,
            device_addr,
            bytes,
        });
    }

    pub fn async_migrate_device_to_host(
        &self,
        vpn: VirtualPageNumber,
        device_addr: u64,
        host_addr: *mut u8,
        bytes: usize,
    ) {
        if host_addr.is_null() || device_addr == 0 {
            return;
        }
        self.submit(MigrationJob {
            vpn,
            direction: MigrationDirection::DeviceToHost,
            host_addr,
            device_addr,
            bytes,
        });
    }

    fn submit(&self, job: MigrationJob) {
        if !self.config.async_migrations {
            // no workers exist, degrade to an inline migration
            execute(&self.page_table, job);
            return;
        }

        {
            let mut state = self.queue.state.lock();
            if state.shutdown {
                warn!("migration manager shutting down, dropping job for vpn {}", job.vpn);
                return;
            }
            state.jobs.push_back(job);
        }
        self.queue.job_ready.notify_one();
    }

    /// Blocks until the queue is empty and no dequeued job is still being
    /// applied.
    pub fn wait_for_migrations(&self) {
        let mut state = self.queue.state.lock();
        while !(state.jobs.is_empty() && state.in_flight == 0) {
            self.queue.all_done.wait(&mut state);
        }
    }

    /// Jobs queued but not yet picked up by a worker.
    pub fn pending_migrations(&self) -> usize {
        self.queue.state.lock().jobs.len()
    }
}

impl Drop for MigrationManager {
    fn drop(&mut self) {
        {
            let mut state = self.queue.state.lock();
            state.shutdown = true;
        }
        self.queue.job_ready.notify_all();

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Runs one migration: validates the VPN is still live, models the
/// transfer delay, then publishes destination residency.
fn execute(page_table: &PageTable, job: MigrationJob) -> u64 {
    let start_us = timestamp_us();

    if page_table.lookup(job.vpn).is_none() {
        // the page was freed between submission and execution
        return 0;
    }

    thread::sleep(Duration::from_micros(
        job.bytes as u64 / SIM_BANDWIDTH_BYTES_PER_US + 1,
    ));

    match job.direction {
        MigrationDirection::HostToDevice => {
            page_table.with_entry_mut(job.vpn, |entry| {
                entry.resident_device = true;
                entry.device_address = job.device_addr;
                entry.is_dirty = false;
            });
        }
        MigrationDirection::DeviceToHost => {
            page_table.with_entry_mut(job.vpn, |entry| {
                entry.resident_host = true;
                entry.host_address = job.host_addr;
            });
        }
    }

    let elapsed_us = timestamp_us() - start_us;
    debug!(
        "migrated vpn {} {:?} ({} bytes) in {} us",
        job.vpn, job.direction, job.bytes, elapsed_us
    );
    elapsed_us
}

fn worker_loop(queue: Arc<JobQueue>, page_table: Arc<PageTable>) {
    loop {
        let job = {
            let mut state = queue.state.lock();
            loop {
                if let Some(job) = state.jobs.pop_front() {
                    state.in_flight += 1;
                    break job;
                }
                // drain the queue before honoring shutdown
                if state.shutdown {
                    return;
                }
                queue.job_ready.wait(&mut state);
            }
        };

        execute(&page_table, job);

        let mut state = queue.state.lock();
        state.in_flight -= 1;
        if state.jobs.is_empty() && state.in_flight == 0 {
            queue.all_done.notify_all();
        }
    }
}
