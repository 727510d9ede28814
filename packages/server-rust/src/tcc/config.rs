//! TCC coordinator and log-store configuration.

use std::path::PathBuf;

/// Name of the in-memory repository in the default catalog.
pub const MEMORY_REPOSITORY: &str = "memory";
/// Name of the embedded `redb` repository in the default catalog.
pub const REDB_REPOSITORY: &str = "redb";

/// Configuration for the coordinator, its recovery scan and the log store.
#[derive(Debug, Clone)]
pub struct TransactionConfig {
    /// Repository implementation looked up in the catalog at startup.
    pub repository: String,
    /// Database file for the `redb` repository.
    pub redb_path: PathBuf,
    /// Physically delete rows on cleanup instead of marking them `Deleted`.
    pub phy_deleted: bool,
    /// Minimum age of a `Tried` participant before recovery touches it.
    pub recover_delay_ms: u64,
    pub scan_interval_ms: u64,
    /// Maximum participants handled per recovery pass.
    pub scan_limit: usize,
    /// Recovery attempts after which a participant is reported as abandoned.
    pub max_recovery_attempts: u32,
    /// Upper bound on parallel confirm/cancel dispatches per transaction.
    pub dispatch_concurrency: usize,
    /// Timeout of one confirm or cancel call.
    pub phase_timeout_ms: u64,
    /// Clean up terminal transactions right away; otherwise leave them for `purge`.
    pub cleanup_immediately: bool,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            repository: MEMORY_REPOSITORY.to_string(),
            redb_path: PathBuf::from("meridian-tcc.redb"),
            phy_deleted: true,
            recover_delay_ms: 60_000,
            scan_interval_ms: 30_000,
            scan_limit: 100,
            max_recovery_attempts: 10,
            dispatch_concurrency: 8,
            phase_timeout_ms: 10_000,
            cleanup_immediately: true,
        }
    }
}
