//! Engine configuration
//!
//! Defines:
//! - Pool sizing and session lifetime
//! - Interrupt escalation and session start retry bounds
//! - Snapshot cadence and retention
//!
//! Every field has a default, so a TOML file only needs the keys it changes.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What happens to queued cells when the running cell is interrupted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptPolicy {
    /// Remaining cells stay queued and run next
    #[default]
    KeepQueued,
    /// Remaining cells return to `Idle`
    CancelQueued,
}

/// Bounded, escalating interrupt retry
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterruptConfig {
    /// Interrupt signals sent before the session is declared unhealthy
    pub max_attempts: u32,
    /// Wait for acknowledgment after the first signal
    pub initial_wait_ms: u64,
    /// Multiplier applied to the wait after each unanswered signal
    pub backoff_factor: u32,
}

impl InterruptConfig {
    /// Wait after attempt `attempt` (1-based)
    #[must_use]
    pub fn wait_for(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.backoff_factor.max(1)).saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.initial_wait_ms.saturating_mul(factor))
    }
}

impl Default for InterruptConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_wait_ms: 1000,
            backoff_factor: 2,
        }
    }
}

/// Session start retry with exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionStartConfig {
    /// Start attempts before giving up
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles each time
    pub base_delay_ms: u64,
}

impl SessionStartConfig {
    /// Delay before retry number `retry` (1-based)
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

impl Default for SessionStartConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
        }
    }
}

/// Snapshot cadence and retention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Take a snapshot every N mutations
    pub every_mutations: Option<u64>,
    /// Take a snapshot when this much time passed since the last one
    pub interval_secs: Option<u64>,
    /// Snapshots kept per worksheet, oldest pruned first
    pub max_snapshots: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            every_mutations: None,
            interval_secs: None,
            max_snapshots: 30,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum concurrent backend sessions
    pub pool_capacity: usize,
    /// Backend flavor for new worksheets
    pub default_system: String,
    /// Sessions idle this long with no queued work are released
    pub idle_timeout_secs: u64,
    /// Per-cell wall-clock limit; 0 means unlimited
    pub cell_timeout_secs: u64,
    /// Give up waiting for a pool slot after this long (logged, then retried)
    pub acquire_timeout_ms: Option<u64>,
    /// Interrupt escalation
    pub interrupt: InterruptConfig,
    /// Session start retry
    pub session_start: SessionStartConfig,
    /// Snapshot cadence
    pub snapshots: SnapshotConfig,
    /// Queue behavior after an interrupt
    pub interrupt_policy: InterruptPolicy,
    /// Period of the maintenance task
    pub maintenance_interval_secs: u64,
}

impl EngineConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from TOML and validate
    ///
    /// # Errors
    /// `EngineError::Config` for malformed TOML or invalid values.
    pub fn from_toml_str(input: &str) -> Result<Self, EngineError> {
        let config: Self = toml::from_str(input).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    ///
    /// # Errors
    /// `EngineError::Config` naming the offending field.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.pool_capacity == 0 {
            return Err(EngineError::Config("pool_capacity must be at least 1".into()));
        }
        if self.interrupt.max_attempts == 0 {
            return Err(EngineError::Config(
                "interrupt.max_attempts must be at least 1".into(),
            ));
        }
        if self.session_start.max_attempts == 0 {
            return Err(EngineError::Config(
                "session_start.max_attempts must be at least 1".into(),
            ));
        }
        if self.snapshots.every_mutations == Some(0) {
            return Err(EngineError::Config(
                "snapshots.every_mutations must be at least 1".into(),
            ));
        }
        if self.default_system.trim().is_empty() {
            return Err(EngineError::Config("default_system must not be empty".into()));
        }
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_default_system(mut self, system: impl Into<String>) -> Self {
        self.default_system = system.into();
        self
    }

    #[inline]
    #[must_use]
    pub fn with_idle_timeout(mut self, secs: u64) -> Self {
        self.idle_timeout_secs = secs;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_cell_timeout(mut self, secs: u64) -> Self {
        self.cell_timeout_secs = secs;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_acquire_timeout_ms(mut self, ms: u64) -> Self {
        self.acquire_timeout_ms = Some(ms);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_interrupt(mut self, interrupt: InterruptConfig) -> Self {
        self.interrupt = interrupt;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_session_start(mut self, session_start: SessionStartConfig) -> Self {
        self.session_start = session_start;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_snapshots(mut self, snapshots: SnapshotConfig) -> Self {
        self.snapshots = snapshots;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_interrupt_policy(mut self, policy: InterruptPolicy) -> Self {
        self.interrupt_policy = policy;
        self
    }

    /// Per-cell timeout, `None` when unlimited
    #[inline]
    #[must_use]
    pub fn cell_timeout(&self) -> Option<Duration> {
        (self.cell_timeout_secs > 0).then(|| Duration::from_secs(self.cell_timeout_secs))
    }

    #[inline]
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    #[inline]
    #[must_use]
    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_capacity: 4,
            default_system: "sage".to_string(),
            idle_timeout_secs: 3600,
            cell_timeout_secs: 0,
            acquire_timeout_ms: None,
            interrupt: InterruptConfig::default(),
            session_start: SessionStartConfig::default(),
            snapshots: SnapshotConfig::default(),
            interrupt_policy: InterruptPolicy::default(),
            maintenance_interval_secs: 60,
        }
    }
}
