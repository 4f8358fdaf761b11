//! Lifecycle - Poll specifications and their configuration
//!
//! A [`PollSpec`] classifies the lifecycle states of one resource type and
//! bounds how long and how often the poller waits for it. Specs are built
//! per call site, either in code or from a JSON [`PollConfig`].

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::resource::LifecycleState;

/// Default delay between polls
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// Default overall timeout of a poll
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Default number of concurrent fan-out workers
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Configuration error for poll specs and fan-out settings
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("States {} are both {first} and {second}", .states.join(", "))]
    OverlappingStates {
        first: &'static str,
        second: &'static str,
        states: Vec<String>,
    },

    #[error("At least one target state is required")]
    NoTargetStates,

    #[error("Poll interval must be greater than zero")]
    ZeroInterval,

    #[error("Poll timeout must be greater than zero")]
    ZeroTimeout,

    #[error("Invalid backoff: {0}")]
    InvalidBackoff(String),

    #[error("Concurrency must be at least 1, got {0}")]
    InvalidConcurrency(usize),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

/// How the poller reacts to a failed fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorPolicy {
    /// The first fetch error ends the poll
    #[default]
    Fatal,
    /// Keep polling through up to `consecutive` fetch errors in a row
    Tolerate { consecutive: u32 },
}

impl FetchErrorPolicy {
    /// Whether the `nth` consecutive error (1-based) is tolerated
    pub fn tolerates(&self, nth: u32) -> bool {
        match self {
            FetchErrorPolicy::Fatal => false,
            FetchErrorPolicy::Tolerate { consecutive } => nth <= *consecutive,
        }
    }
}

/// Opt-in growth of the poll interval
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub multiplier: f64,
    pub max_interval: Duration,
}

impl Backoff {
    pub fn new(multiplier: f64, max_interval: Duration) -> Self {
        Self {
            multiplier,
            max_interval,
        }
    }

    /// Interval to use after a pending tick that waited `current`
    pub fn next_interval(&self, current: Duration) -> Duration {
        Duration::try_from_secs_f64(current.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max_interval)
            .min(self.max_interval)
    }
}

/// Classification of a fetched state against a [`PollSpec`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateClass {
    Pending,
    Target,
    Failure,
    /// Not in any configured set; polled as pending
    Unclassified,
}

/// Poll specification for one wait
#[derive(Debug, Clone, PartialEq)]
pub struct PollSpec {
    pub pending_states: BTreeSet<LifecycleState>,
    pub target_states: BTreeSet<LifecycleState>,
    pub failure_states: BTreeSet<LifecycleState>,
    pub interval: Duration,
    pub timeout: Duration,
    /// Wait before the first fetch
    pub delay: Duration,
    pub backoff: Option<Backoff>,
    pub fetch_errors: FetchErrorPolicy,
}

impl Default for PollSpec {
    fn default() -> Self {
        Self {
            pending_states: BTreeSet::new(),
            target_states: BTreeSet::new(),
            failure_states: BTreeSet::new(),
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            delay: Duration::ZERO,
            backoff: None,
            fetch_errors: FetchErrorPolicy::Fatal,
        }
    }
}

fn state_set<I, T>(states: I) -> BTreeSet<LifecycleState>
where
    I: IntoIterator<Item = T>,
    T: Into<LifecycleState>,
{
    states.into_iter().map(Into::into).collect()
}

impl PollSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending<I, T>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<LifecycleState>,
    {
        self.pending_states = state_set(states);
        self
    }

    pub fn target<I, T>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<LifecycleState>,
    {
        self.target_states = state_set(states);
        self
    }

    pub fn failure<I, T>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<LifecycleState>,
    {
        self.failure_states = state_set(states);
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn fetch_errors(mut self, policy: FetchErrorPolicy) -> Self {
        self.fetch_errors = policy;
        self
    }

    /// Check the spec's invariants
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_states.is_empty() {
            return Err(ConfigError::NoTargetStates);
        }
        check_disjoint(
            "target",
            &self.target_states,
            "pending",
            &self.pending_states,
        )?;
        check_disjoint(
            "target",
            &self.target_states,
            "failure",
            &self.failure_states,
        )?;
        check_disjoint(
            "pending",
            &self.pending_states,
            "failure",
            &self.failure_states,
        )?;

        if self.interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }

        if let Some(backoff) = &self.backoff {
            if !backoff.multiplier.is_finite() || backoff.multiplier < 1.0 {
                return Err(ConfigError::InvalidBackoff(format!(
                    "multiplier must be a finite number >= 1.0, got {}",
                    backoff.multiplier
                )));
            }
            if backoff.max_interval < self.interval {
                return Err(ConfigError::InvalidBackoff(format!(
                    "max interval {:?} is shorter than the poll interval {:?}",
                    backoff.max_interval, self.interval
                )));
            }
        }

        Ok(())
    }

    /// Classify a fetched state
    pub fn classify(&self, state: &LifecycleState) -> StateClass {
        if self.failure_states.contains(state) {
            StateClass::Failure
        } else if self.target_states.contains(state) {
            StateClass::Target
        } else if self.pending_states.contains(state) {
            StateClass::Pending
        } else {
            StateClass::Unclassified
        }
    }
}

fn check_disjoint(
    first: &'static str,
    a: &BTreeSet<LifecycleState>,
    second: &'static str,
    b: &BTreeSet<LifecycleState>,
) -> Result<(), ConfigError> {
    let overlap: Vec<String> = a.intersection(b).map(|s| s.to_string()).collect();
    if overlap.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::OverlappingStates {
            first,
            second,
            states: overlap,
        })
    }
}

// =============================================================================
// Serialized configuration
// =============================================================================

/// Backoff as written in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffConfig {
    pub multiplier: f64,
    pub max_interval_ms: u64,
}

/// Poll spec as written in configuration
///
/// ```json
/// {
///   "pending": ["pending", "updating"],
///   "target": ["stable"],
///   "failure": ["failed"],
///   "interval_ms": 10000,
///   "timeout_ms": 600000,
///   "fetch_errors": { "tolerate": { "consecutive": 3 } }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollConfig {
    pub pending: Vec<String>,
    pub target: Vec<String>,
    pub failure: Vec<String>,
    pub interval_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub delay_ms: Option<u64>,
    pub backoff: Option<BackoffConfig>,
    pub fetch_errors: FetchErrorPolicy,
}

impl PollConfig {
    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Parse and validate in one step
    pub fn load_spec(content: &str) -> Result<PollSpec, ConfigError> {
        PollSpec::try_from(Self::from_json_str(content)?)
    }
}

impl TryFrom<PollConfig> for PollSpec {
    type Error = ConfigError;

    fn try_from(config: PollConfig) -> Result<Self, Self::Error> {
        let mut spec = PollSpec::new()
            .pending(config.pending)
            .target(config.target)
            .failure(config.failure)
            .fetch_errors(config.fetch_errors);

        if let Some(ms) = config.interval_ms {
            spec = spec.interval(Duration::from_millis(ms));
        }
        if let Some(ms) = config.timeout_ms {
            spec = spec.timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = config.delay_ms {
            spec = spec.delay(Duration::from_millis(ms));
        }
        if let Some(backoff) = config.backoff {
            spec = spec.backoff(Backoff::new(
                backoff.multiplier,
                Duration::from_millis(backoff.max_interval_ms),
            ));
        }

        spec.validate()?;
        Ok(spec)
    }
}

/// Fan-out settings as written in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FanOutConfig {
    pub concurrency: usize,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl FanOutConfig {
    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency(self.concurrency));
        }
        Ok(())
    }
}
