//! Configuration structures for the index engine.

use crate::error::{GinError, Result};
use serde::{Deserialize, Serialize};

/// Smallest accepted pending-list cleanup threshold in kilobytes.
pub const MIN_PENDING_LIST_KB: usize = 64;

/// Per-index storage options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexOptions {
    /// Route inserts through the pending list.
    pub use_fast_update: bool,
    /// Pending-list size (kB) that triggers a cleanup. `None` inherits the
    /// engine-wide `pending_list_limit_kb`.
    pub pending_list_cleanup_size_kb: Option<usize>,
    /// Override for the maximum entry tuple size. `None` uses the value
    /// derived from the page size.
    pub max_item_size: Option<usize>,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            use_fast_update: true,
            pending_list_cleanup_size_kb: None,
            max_item_size: None,
        }
    }
}

impl IndexOptions {
    /// Effective cleanup threshold in bytes.
    pub fn pending_list_cleanup_bytes(&self, engine: &EngineConfig) -> usize {
        self.pending_list_cleanup_size_kb
            .unwrap_or(engine.pending_list_limit_kb)
            * 1024
    }

    /// Validates option values.
    pub fn validate(&self) -> Result<()> {
        if let Some(kb) = self.pending_list_cleanup_size_kb {
            if kb < MIN_PENDING_LIST_KB {
                return Err(GinError::InvalidParameter {
                    name: "pending_list_cleanup_size_kb".to_string(),
                    value: kb.to_string(),
                });
            }
        }
        if let Some(size) = self.max_item_size {
            if size < 64 {
                return Err(GinError::InvalidParameter {
                    name: "max_item_size".to_string(),
                    value: size.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Process-level settings shared by every index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default pending-list cleanup threshold in kilobytes.
    pub pending_list_limit_kb: usize,
    /// Soft cap on the number of TIDs a scan returns (0 = unlimited).
    pub fuzzy_search_limit: usize,
    /// Memory budget for build and pending-list cleanup accumulators.
    pub maintenance_work_mem_kb: usize,
    /// Memory budget for cleanups run from a regular insert.
    pub work_mem_kb: usize,
    /// Upper bound on parallel build workers.
    pub max_parallel_workers: usize,
    /// Bound on restarts of a single descent or entry initialization.
    pub max_restarts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pending_list_limit_kb: 4096,
            fuzzy_search_limit: 0,
            maintenance_work_mem_kb: 64 * 1024,
            work_mem_kb: 4096,
            max_parallel_workers: num_cpus(),
            max_restarts: 64,
        }
    }
}

impl EngineConfig {
    /// Maintenance budget in bytes.
    pub fn maintenance_work_mem_bytes(&self) -> usize {
        self.maintenance_work_mem_kb * 1024
    }

    /// Work budget in bytes.
    pub fn work_mem_bytes(&self) -> usize {
        self.work_mem_kb * 1024
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("pending_list_limit_kb", self.pending_list_limit_kb, MIN_PENDING_LIST_KB),
            ("maintenance_work_mem_kb", self.maintenance_work_mem_kb, 64),
            ("work_mem_kb", self.work_mem_kb, 64),
        ];
        for (name, value, min) in checks {
            if value < min {
                return Err(GinError::InvalidParameter {
                    name: name.to_string(),
                    value: value.to_string(),
                });
            }
        }
        if self.max_restarts == 0 {
            return Err(GinError::ConfigError(
                "max_restarts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Returns the number of available CPUs.
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}
