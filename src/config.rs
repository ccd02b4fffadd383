//! Request options and coordinator configuration.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use quorum_kit::config::{CoordinatorConfig, Quorum};
//!
//! let config = CoordinatorConfig::builder()
//!     .n_val(5)
//!     .read_quorum(Quorum::Exactly(2))
//!     .read_timeout(Duration::from_millis(200))
//!     .write_quorum(Quorum::All)
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.read.r.resolve(config.n_val).unwrap(), 2);
//! assert_eq!(config.write.w.resolve(config.n_val).unwrap(), 5);
//! ```

use std::time::Duration;

use crate::error::ConfigError;

/// Default replication factor.
pub const DEFAULT_N_VAL: usize = 3;
/// Default primary deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default deadline for collecting stragglers after the client was answered.
pub const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_secs(1);

/// How many replica replies a request waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Quorum {
    /// A single replica.
    One,
    /// `n / 2 + 1` replicas.
    #[default]
    Majority,
    /// Every replica.
    All,
    /// An explicit count.
    Exactly(usize),
}

impl Quorum {
    /// Resolve against replication factor `n_val`.
    pub fn resolve(self, n_val: usize) -> Result<usize, ConfigError> {
        if n_val == 0 {
            return Err(ConfigError::ZeroReplication);
        }
        let quorum = match self {
            Self::One => 1,
            Self::Majority => n_val / 2 + 1,
            Self::All => n_val,
            Self::Exactly(q) => q,
        };
        if quorum == 0 || quorum > n_val {
            return Err(ConfigError::QuorumOutOfRange { quorum, n_val });
        }
        Ok(quorum)
    }
}

/// Options for a single read.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReadOptions {
    /// Read quorum R.
    pub r: Quorum,
    /// Deadline for reaching R.
    pub timeout: Duration,
    /// Deadline for collecting the remaining replies once R was reached.
    pub repair_timeout: Duration,
    /// Write the merged object back to stale replicas.
    pub read_repair: bool,
    /// Answer with the values; when `false` the client only learns that the
    /// quorum answered.
    pub return_value: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            r: Quorum::Majority,
            timeout: DEFAULT_TIMEOUT,
            repair_timeout: DEFAULT_COMPLETION_TIMEOUT,
            read_repair: true,
            return_value: true,
        }
    }
}

impl ReadOptions {
    /// Check the options against `n_val` and return the resolved R.
    pub fn validate(&self, n_val: usize) -> Result<usize, ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("read timeout"));
        }
        if self.repair_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("repair timeout"));
        }
        self.r.resolve(n_val)
    }
}

/// Options for a single write or delete.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WriteOptions {
    /// Write quorum W, counted in successful acknowledgements.
    pub w: Quorum,
    /// Deadline for reaching W.
    pub timeout: Duration,
    /// Deadline for collecting the remaining acknowledgements.
    pub completion_timeout: Duration,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            w: Quorum::Majority,
            timeout: DEFAULT_TIMEOUT,
            completion_timeout: DEFAULT_COMPLETION_TIMEOUT,
        }
    }
}

impl WriteOptions {
    /// Check the options against `n_val` and return the resolved W.
    pub fn validate(&self, n_val: usize) -> Result<usize, ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("write timeout"));
        }
        if self.completion_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("completion timeout"));
        }
        self.w.resolve(n_val)
    }
}

/// Defaults applied by a [`Coordinator`](crate::Coordinator).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CoordinatorConfig {
    /// Replication factor N. Directory results are truncated to this length.
    pub n_val: usize,
    /// Options used by `get` when none are given.
    pub read: ReadOptions,
    /// Options used by `put`/`delete` when none are given.
    pub write: WriteOptions,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            n_val: DEFAULT_N_VAL,
            read: ReadOptions::default(),
            write: WriteOptions::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Start from the defaults.
    pub fn builder() -> CoordinatorConfigBuilder {
        CoordinatorConfigBuilder {
            config: Self::default(),
        }
    }

    /// Check the default options against `n_val`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.read.validate(self.n_val)?;
        self.write.validate(self.n_val)?;
        Ok(())
    }
}

/// Builder for [`CoordinatorConfig`].
#[derive(Debug, Clone)]
pub struct CoordinatorConfigBuilder {
    config: CoordinatorConfig,
}

impl CoordinatorConfigBuilder {
    /// Set the replication factor.
    pub fn n_val(mut self, n_val: usize) -> Self {
        self.config.n_val = n_val;
        self
    }

    /// Set the default read quorum.
    pub fn read_quorum(mut self, r: Quorum) -> Self {
        self.config.read.r = r;
        self
    }

    /// Set the default read deadline.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read.timeout = timeout;
        self
    }

    /// Set the default repair collection deadline.
    pub fn repair_timeout(mut self, timeout: Duration) -> Self {
        self.config.read.repair_timeout = timeout;
        self
    }

    /// Enable or disable read repair by default.
    pub fn read_repair(mut self, enabled: bool) -> Self {
        self.config.read.read_repair = enabled;
        self
    }

    /// Set the default write quorum.
    pub fn write_quorum(mut self, w: Quorum) -> Self {
        self.config.write.w = w;
        self
    }

    /// Set the default write deadline.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write.timeout = timeout;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<CoordinatorConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn majority_rounds_up() {
        assert_eq!(Quorum::Majority.resolve(3), Ok(2));
        assert_eq!(Quorum::Majority.resolve(4), Ok(3));
        assert_eq!(Quorum::Majority.resolve(1), Ok(1));
    }

    #[test]
    fn quorum_must_fit_replication() {
        assert_eq!(
            Quorum::Exactly(4).resolve(3),
            Err(ConfigError::QuorumOutOfRange { quorum: 4, n_val: 3 })
        );
        assert_eq!(
            Quorum::Exactly(0).resolve(3),
            Err(ConfigError::QuorumOutOfRange { quorum: 0, n_val: 3 })
        );
        assert_eq!(Quorum::One.resolve(0), Err(ConfigError::ZeroReplication));
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let opts = ReadOptions {
            timeout: Duration::ZERO,
            ..ReadOptions::default()
        };
        assert_eq!(opts.validate(3), Err(ConfigError::ZeroTimeout("read timeout")));
    }

    #[test]
    fn builder_validates() {
        let err = CoordinatorConfig::builder()
            .n_val(2)
            .write_quorum(Quorum::Exactly(3))
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::QuorumOutOfRange { quorum: 3, n_val: 2 });

        let config = CoordinatorConfig::builder().read_repair(false).build().unwrap();
        assert!(!config.read.read_repair);
        assert_eq!(config.n_val, DEFAULT_N_VAL);
    }
}
