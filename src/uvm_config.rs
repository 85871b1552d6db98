use log::LevelFilter;

pub const DEFAULT_PAGE_SIZE: usize = 64 * 1024;
pub const DEFAULT_VIRTUAL_ADDRESS_SPACE: usize = 256 * 1024 * 1024 * 1024;
pub const DEFAULT_HOST_MEMORY: usize = 8 * 1024 * 1024 * 1024;
pub const DEFAULT_DEVICE_MEMORY: usize = 4 * 1024 * 1024 * 1024;
pub const DEFAULT_TLB_SIZE: usize = 1024;
pub const DEFAULT_TLB_ASSOCIATIVITY: usize = 8;
pub const DEFAULT_MIGRATION_WORKERS: usize = 4;

/// Which replacement policy orders device pages for eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacementPolicyKind {
    Lru,
    Clock,
}

#[derive(Debug, Clone)]
pub struct UvmConfig {
    /// Page size in bytes, a power of two.
    pub page_size: usize,
    /// Advisory upper bound for VPN issuance.
    pub virtual_address_space: usize,
    /// Capacity of the host page pool in bytes.
    pub host_memory: usize,
    /// Capacity of the device page pool in bytes.
    pub device_memory: usize,
    /// Total TLB entries.
    pub tlb_size: usize,
    /// Entries per TLB set.
    pub tlb_associativity: usize,
    pub replacement_policy: ReplacementPolicyKind,
    /// Advisory: lock the host pool in RAM.
    pub use_pinned_host_memory: bool,
    /// Model device RAM with a host mapping.
    pub use_device_simulator: bool,
    /// Gate for allocate-time prefetch and `prefetch_to_device`.
    pub enable_prefetch: bool,
    /// Spawn migration workers and accept queued jobs.
    pub async_migrations: bool,
    pub migration_workers: usize,
    pub log_level: LevelFilter,
}

impl Default for UvmConfig {
    fn default() -> Self {
        UvmConfig {
            page_size: DEFAULT_PAGE_SIZE,
            virtual_address_space: DEFAULT_VIRTUAL_ADDRESS_SPACE,
            host_memory: DEFAULT_HOST_MEMORY,
            device_memory: DEFAULT_DEVICE_MEMORY,
            tlb_size: DEFAULT_TLB_SIZE,
            tlb_associativity: DEFAULT_TLB_ASSOCIATIVITY,
            replacement_policy: ReplacementPolicyKind::Lru,
            use_pinned_host_memory: true,
            use_device_simulator: false,
            enable_prefetch: true,
            async_migrations: true,
            migration_workers: DEFAULT_MIGRATION_WORKERS,
            log_level: LevelFilter::Info,
        }
    }
}

impl UvmConfig {
    /// Panics on configurations no simulation can run with.
    pub(crate) fn validate(&self) {
        assert!(
            self.page_size > 0 && self.page_size.is_power_of_two(),
            "page_size has to be a power of two"
        );
        assert!(
            self.host_memory >= self.page_size && self.host_memory % self.page_size == 0,
            "host_memory has to be a nonzero multiple of page_size"
        );
        assert!(
            self.device_memory >= self.page_size && self.device_memory % self.page_size == 0,
            "device_memory has to be a nonzero multiple of page_size"
        );
        assert!(
            self.virtual_address_space >= self.page_size,
            "virtual_address_space has to hold at least one page"
        );
        assert!(
            self.tlb_associativity > 0
                && self.tlb_size >= self.tlb_associativity
                && self.tlb_size % self.tlb_associativity == 0,
            "tlb_size has to be a nonzero multiple of tlb_associativity"
        );
        assert!(
            !self.async_migrations || self.migration_workers > 0,
            "async migrations need at least one worker"
        );
    }
}
