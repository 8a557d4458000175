//! Pool configuration
//!
//! Compile-time defaults with environment overrides, validated before a
//! pool spawns.
//!
//! # Environment Variables
//!
//! - `FIBRA_WORKERS` - worker thread count (0 = CPU core count)
//! - `FIBRA_STACK_SIZE` - default stack class size in bytes
//! - `FIBRA_MAX_TASKS` - default stack class budget (max live tasks)

use fibra_core::constants::{DEFAULT_STACK_SIZE, MAX_WORKERS};
use fibra_core::{env_get, PoolError, PoolResult};

/// Worker count used when a config leaves it at 0: one per CPU core
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(MAX_WORKERS)
}

/// One stack size class
///
/// `preallocated` mappings are made at pool init; `hot`/`cold` bound the
/// recycled lists (cold stacks are decommitted); `max_allocated` caps
/// concurrent mappings and thereby concurrent tasks of this class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackClassConfig {
    pub size: usize,
    pub preallocated: usize,
    pub cold: usize,
    pub hot: usize,
    pub max_allocated: usize,
}

impl StackClassConfig {
    pub fn with_size(size: usize) -> StackClassConfig {
        StackClassConfig {
            size,
            preallocated: 0,
            cold: 4,
            hot: 8,
            max_allocated: 512,
        }
    }
}

/// Pool configuration with builder methods
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Worker threads; 0 means one per CPU core
    pub worker_count: usize,
    /// Stack classes, declared largest first
    pub stacks: Vec<StackClassConfig>,
    /// Which class tasks use unless an entry overrides it
    pub default_stack_index: usize,
    /// Diagnostic label
    pub label: String,
    /// Whether the pool shows up in registry-wide queries
    pub is_public: bool,
}

impl PoolConfig {
    /// Library defaults: one stack class, one worker per core
    pub fn new() -> PoolConfig {
        PoolConfig {
            worker_count: 0,
            stacks: vec![StackClassConfig::with_size(DEFAULT_STACK_SIZE)],
            default_stack_index: 0,
            label: String::new(),
            is_public: true,
        }
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> PoolConfig {
        let mut config = PoolConfig::new();
        config.worker_count = env_get("FIBRA_WORKERS", config.worker_count);
        let size = env_get("FIBRA_STACK_SIZE", DEFAULT_STACK_SIZE);
        let max = env_get("FIBRA_MAX_TASKS", 512usize);
        config.stacks = vec![StackClassConfig {
            max_allocated: max.max(1),
            ..StackClassConfig::with_size(size)
        }];
        config
    }

    // Builder methods

    pub fn worker_count(mut self, n: usize) -> Self {
        self.worker_count = n;
        self
    }

    pub fn stacks(mut self, stacks: Vec<StackClassConfig>) -> Self {
        self.stacks = stacks;
        self
    }

    pub fn default_stack_index(mut self, index: usize) -> Self {
        self.default_stack_index = index;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn public(mut self, is_public: bool) -> Self {
        self.is_public = is_public;
        self
    }

    /// Check every constraint; spawn refuses an invalid config
    pub fn validate(&self) -> PoolResult<()> {
        if self.stacks.is_empty() {
            return Err(PoolError::InvalidConfig("at least one stack class required"));
        }
        if self.worker_count > MAX_WORKERS {
            return Err(PoolError::InvalidConfig("worker_count exceeds limit"));
        }
        if self.default_stack_index >= self.stacks.len() {
            return Err(PoolError::InvalidConfig("default_stack_index out of range"));
        }
        let mut last_size = usize::MAX;
        for class in &self.stacks {
            if class.size == 0 {
                return Err(PoolError::InvalidConfig("stack size must be nonzero"));
            }
            if class.size > last_size {
                return Err(PoolError::InvalidConfig(
                    "stack classes must be declared in decreasing size",
                ));
            }
            last_size = class.size;
            if class.max_allocated == 0 {
                return Err(PoolError::InvalidConfig("max_allocated must be nonzero"));
            }
            if class.preallocated > class.max_allocated {
                return Err(PoolError::InvalidConfig("preallocated exceeds max_allocated"));
            }
            if class.cold + class.hot > class.max_allocated {
                return Err(PoolError::InvalidConfig("cold + hot exceeds max_allocated"));
            }
            if class.preallocated > class.cold + class.hot {
                return Err(PoolError::InvalidConfig("preallocated exceeds cold + hot"));
            }
        }
        Ok(())
    }

    /// Classes sorted ascending with duplicate sizes merged, plus the
    /// remapped default index and the resolved worker count
    pub(crate) fn normalized(&self) -> (Vec<StackClassConfig>, usize, usize) {
        let default_size = self.stacks[self.default_stack_index].size;

        let mut classes: Vec<StackClassConfig> = Vec::with_capacity(self.stacks.len());
        // Input is validated non-increasing; walk backwards for ascending
        for class in self.stacks.iter().rev() {
            match classes.last_mut() {
                Some(last) if last.size == class.size => {
                    // Coalesce duplicates by pooling their budgets
                    last.preallocated += class.preallocated;
                    last.cold += class.cold;
                    last.hot += class.hot;
                    last.max_allocated += class.max_allocated;
                }
                _ => classes.push(class.clone()),
            }
        }

        let default_index = classes
            .iter()
            .position(|c| c.size == default_size)
            .unwrap_or(0);

        let workers = if self.worker_count == 0 {
            default_worker_count()
        } else {
            self.worker_count
        };

        (classes, default_index, workers)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(size: usize) -> StackClassConfig {
        StackClassConfig {
            size,
            preallocated: 1,
            cold: 1,
            hot: 1,
            max_allocated: 4,
        }
    }

    #[test]
    fn test_defaults_validate() {
        assert!(PoolConfig::new().validate().is_ok());
        assert!(PoolConfig::from_env().validate().is_ok());
    }

    #[test]
    fn test_rejects_empty_stacks() {
        let config = PoolConfig::new().stacks(vec![]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_increasing_sizes() {
        let config = PoolConfig::new().stacks(vec![class(64 * 1024), class(128 * 1024)]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_budgets() {
        let mut bad = class(64 * 1024);
        bad.preallocated = 5; // > max_allocated
        let config = PoolConfig::new().stacks(vec![bad]);
        assert!(config.validate().is_err());

        let mut bad = class(64 * 1024);
        bad.cold = 3;
        bad.hot = 2; // cold + hot > max_allocated
        let config = PoolConfig::new().stacks(vec![bad]);
        assert!(config.validate().is_err());

        let mut bad = class(64 * 1024);
        bad.preallocated = 3; // > cold + hot
        bad.max_allocated = 8;
        let config = PoolConfig::new().stacks(vec![bad]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_default_index() {
        let config = PoolConfig::new()
            .stacks(vec![class(64 * 1024)])
            .default_stack_index(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_normalized_sorts_and_coalesces() {
        let config = PoolConfig::new()
            .stacks(vec![class(256 * 1024), class(64 * 1024), class(64 * 1024)])
            .default_stack_index(0);
        config.validate().unwrap();
        let (classes, default_index, _) = config.normalized();
        assert_eq!(classes.len(), 2);
        assert_eq!(classes[0].size, 64 * 1024);
        assert_eq!(classes[0].max_allocated, 8); // merged budgets
        assert_eq!(classes[1].size, 256 * 1024);
        assert_eq!(default_index, 1);
    }

    #[test]
    fn test_worker_count_resolution() {
        let (_, _, workers) = PoolConfig::new().worker_count(3).normalized();
        assert_eq!(workers, 3);
        let (_, _, workers) = PoolConfig::new().normalized();
        assert!(workers >= 1);
    }
}
