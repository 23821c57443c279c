//! Reactor configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Example
//!
//! ```ignore
//! use netloop_runtime::config::ReactorConfig;
//!
//! // Defaults with env overrides
//! let config = ReactorConfig::from_env();
//!
//! // Or customize programmatically
//! let config = ReactorConfig::from_env()
//!     .executors(4)
//!     .io_ratio(80);
//! ```

use netloop_core::env::env_get;
use netloop_core::error::{NetError, NetResult};
use std::time::Duration;

/// Built-in defaults (see `ReactorConfig::from_env` for env overrides)
pub mod defaults {
    /// I/O time ratio: percentage of loop time reserved for I/O
    pub const IO_RATIO: u32 = 50;
    /// Connect timeout in milliseconds
    pub const CONNECT_TIMEOUT_MS: u64 = 30_000;
    /// Consecutive no-op wakeups before the multiplexer is rebuilt
    pub const REBUILD_THRESHOLD: u32 = 512;
    /// Task queue capacity; 0 means unbounded
    pub const TASK_QUEUE_CAP: usize = 0;
    /// Graceful-shutdown quiet period in milliseconds
    pub const QUIET_PERIOD_MS: u64 = 2_000;
    /// Graceful-shutdown hard timeout in milliseconds
    pub const SHUTDOWN_TIMEOUT_MS: u64 = 15_000;

    /// Default executor count: one per core
    pub fn executors() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

/// Reactor configuration with builder pattern.
///
/// Use `from_env()` to start from the built-in defaults with any
/// environment variable overrides applied.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Number of reactor executors in a group
    pub executors: usize,
    /// Percentage of each loop iteration reserved for I/O (1-100);
    /// 100 drains the task queue unconditionally after I/O
    pub io_ratio: u32,
    /// Deadline for connect operations
    pub connect_timeout: Duration,
    /// Consecutive empty wakeups tolerated before the multiplexer is
    /// rebuilt; 0 disables the mitigation
    pub rebuild_threshold: u32,
    /// Per-executor task queue capacity; 0 means unbounded
    pub task_queue_cap: usize,
    /// Default quiet period for graceful shutdown
    pub quiet_period: Duration,
    /// Default hard timeout for graceful shutdown
    pub shutdown_timeout: Duration,
    /// Thread/executor name prefix
    pub name_prefix: String,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ReactorConfig {
    /// Create config from built-in defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `NETLOOP_EXECUTORS` - executor count per group
    /// - `NETLOOP_IO_RATIO` - I/O time ratio (1-100)
    /// - `NETLOOP_CONNECT_TIMEOUT_MS` - connect timeout
    /// - `NETLOOP_REBUILD_THRESHOLD` - premature-wakeup rebuild threshold
    /// - `NETLOOP_TASK_QUEUE_CAP` - task queue capacity (0 = unbounded)
    /// - `NETLOOP_QUIET_PERIOD_MS` - graceful shutdown quiet period
    /// - `NETLOOP_SHUTDOWN_TIMEOUT_MS` - graceful shutdown timeout
    pub fn from_env() -> Self {
        Self {
            executors: env_get("NETLOOP_EXECUTORS", defaults::executors()),
            io_ratio: env_get("NETLOOP_IO_RATIO", defaults::IO_RATIO),
            connect_timeout: Duration::from_millis(env_get(
                "NETLOOP_CONNECT_TIMEOUT_MS",
                defaults::CONNECT_TIMEOUT_MS,
            )),
            rebuild_threshold: env_get("NETLOOP_REBUILD_THRESHOLD", defaults::REBUILD_THRESHOLD),
            task_queue_cap: env_get("NETLOOP_TASK_QUEUE_CAP", defaults::TASK_QUEUE_CAP),
            quiet_period: Duration::from_millis(env_get(
                "NETLOOP_QUIET_PERIOD_MS",
                defaults::QUIET_PERIOD_MS,
            )),
            shutdown_timeout: Duration::from_millis(env_get(
                "NETLOOP_SHUTDOWN_TIMEOUT_MS",
                defaults::SHUTDOWN_TIMEOUT_MS,
            )),
            name_prefix: "netloop".to_string(),
        }
    }

    /// Config with built-in defaults only (no env overrides).
    /// Useful for tests that must not depend on the environment.
    pub fn new() -> Self {
        Self {
            executors: defaults::executors(),
            io_ratio: defaults::IO_RATIO,
            connect_timeout: Duration::from_millis(defaults::CONNECT_TIMEOUT_MS),
            rebuild_threshold: defaults::REBUILD_THRESHOLD,
            task_queue_cap: defaults::TASK_QUEUE_CAP,
            quiet_period: Duration::from_millis(defaults::QUIET_PERIOD_MS),
            shutdown_timeout: Duration::from_millis(defaults::SHUTDOWN_TIMEOUT_MS),
            name_prefix: "netloop".to_string(),
        }
    }

    // Builder methods

    pub fn executors(mut self, n: usize) -> Self {
        self.executors = n;
        self
    }

    pub fn io_ratio(mut self, ratio: u32) -> Self {
        self.io_ratio = ratio;
        self
    }

    pub fn connect_timeout(mut self, d: Duration) -> Self {
        self.connect_timeout = d;
        self
    }

    pub fn rebuild_threshold(mut self, n: u32) -> Self {
        self.rebuild_threshold = n;
        self
    }

    pub fn task_queue_cap(mut self, cap: usize) -> Self {
        self.task_queue_cap = cap;
        self
    }

    pub fn quiet_period(mut self, d: Duration) -> Self {
        self.quiet_period = d;
        self
    }

    pub fn shutdown_timeout(mut self, d: Duration) -> Self {
        self.shutdown_timeout = d;
        self
    }

    pub fn name_prefix(mut self, prefix: &str) -> Self {
        self.name_prefix = prefix.to_string();
        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> NetResult<()> {
        if self.executors == 0 {
            return Err(NetError::InvalidConfig("executors must be > 0"));
        }
        if self.io_ratio == 0 || self.io_ratio > 100 {
            return Err(NetError::InvalidConfig("io_ratio must be in 1..=100"));
        }
        if self.connect_timeout.is_zero() {
            return Err(NetError::InvalidConfig("connect_timeout must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = ReactorConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.io_ratio, 50);
        assert!(config.executors >= 1);
    }

    #[test]
    fn test_builder() {
        let config = ReactorConfig::new()
            .executors(4)
            .io_ratio(80)
            .connect_timeout(Duration::from_millis(50));
        assert_eq!(config.executors, 4);
        assert_eq!(config.io_ratio, 80);
        assert_eq!(config.connect_timeout, Duration::from_millis(50));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(ReactorConfig::new().executors(0).validate().is_err());
        assert!(ReactorConfig::new().io_ratio(0).validate().is_err());
        assert!(ReactorConfig::new().io_ratio(101).validate().is_err());
    }
}
