//! Poller - Wait for a remote resource to reach a terminal lifecycle state
//!
//! The remote system provisions resources asynchronously; the poller turns
//! that into a single awaitable call. Each tick runs the caller's fetch,
//! classifies the returned state against a [`PollSpec`] and either stops or
//! sleeps for the next tick. The overall timeout is measured on the clock,
//! independent of how many ticks ran, and both the timeout and cancellation
//! race the in-flight fetch as well as the sleep.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep, sleep_until};

use crate::cancel::CancelToken;
use crate::lifecycle::{ConfigError, PollSpec, StateClass};
use crate::provider::FetchError;
use crate::resource::LifecycleState;

/// Result of a single fetch of the resource
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched<S> {
    /// The resource exists and reports `state`
    Found { state: LifecycleState, snapshot: S },
    /// The resource does not exist
    NotFound,
}

impl<S> Fetched<S> {
    pub fn found(state: impl Into<LifecycleState>, snapshot: S) -> Self {
        Fetched::Found {
            state: state.into(),
            snapshot,
        }
    }
}

/// How a poll ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalState {
    Target,
    Failed,
    TimedOut,
    /// Meaning is up to the caller: success when waiting for deletion,
    /// failure when waiting for creation
    NotFound,
    Cancelled,
    FetchFailed,
}

impl FinalState {
    /// Whether the poll itself completed without error
    pub fn is_success(&self) -> bool {
        matches!(self, FinalState::Target | FinalState::NotFound)
    }
}

impl fmt::Display for FinalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FinalState::Target => "target",
            FinalState::Failed => "failed",
            FinalState::TimedOut => "timed out",
            FinalState::NotFound => "not found",
            FinalState::Cancelled => "cancelled",
            FinalState::FetchFailed => "fetch failed",
        };
        f.write_str(s)
    }
}

/// Non-fatal observation made while polling
#[derive(Debug, Clone, PartialEq)]
pub enum PollWarning {
    /// A state outside every configured set, polled as pending
    UnclassifiedState { state: LifecycleState, fetch: u32 },
    /// A fetch error kept within the configured tolerance
    FetchErrorTolerated {
        message: String,
        fetch: u32,
        consecutive: u32,
    },
}

/// Bookkeeping of a finished poll
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollReport {
    /// Number of fetches started
    pub fetches: u32,
    pub elapsed: Duration,
    pub warnings: Vec<PollWarning>,
}

/// Successful end of a poll
#[derive(Debug, Clone)]
pub struct PollOutcome<S> {
    /// Either `Target` or `NotFound`
    pub final_state: FinalState,
    /// Last state fetched
    pub state: Option<LifecycleState>,
    /// Last snapshot fetched
    pub snapshot: Option<S>,
    pub report: PollReport,
}

/// Error type for polls
#[derive(Debug, thiserror::Error)]
pub enum PollError<S> {
    /// The spec is invalid; nothing was fetched
    #[error("Invalid poll spec: {0}")]
    Config(#[source] ConfigError),
    /// The resource reached a failure state
    #[error("Resource reached failure state '{state}' after {} fetches", .report.fetches)]
    Failed {
        state: LifecycleState,
        snapshot: S,
        report: PollReport,
    },
    /// The timeout elapsed before a terminal state
    #[error("Timed out after {timeout:?} waiting for resource{}", last_state_suffix(.state))]
    TimedOut {
        timeout: Duration,
        state: Option<LifecycleState>,
        snapshot: Option<S>,
        report: PollReport,
    },
    /// The caller cancelled the poll
    #[error("Poll cancelled after {} fetches", .report.fetches)]
    Cancelled {
        state: Option<LifecycleState>,
        snapshot: Option<S>,
        report: PollReport,
    },
    /// A fetch failed beyond the configured tolerance
    #[error("Failed to fetch resource: {source}")]
    Fetch {
        #[source]
        source: FetchError,
        snapshot: Option<S>,
        report: PollReport,
    },
}

fn last_state_suffix(state: &Option<LifecycleState>) -> String {
    match state {
        Some(state) => format!(" (last state '{}')", state),
        None => String::new(),
    }
}

impl<S> PollError<S> {
    pub fn final_state(&self) -> FinalState {
        match self {
            PollError::Config(_) | PollError::Fetch { .. } => FinalState::FetchFailed,
            PollError::Failed { .. } => FinalState::Failed,
            PollError::TimedOut { .. } => FinalState::TimedOut,
            PollError::Cancelled { .. } => FinalState::Cancelled,
        }
    }

    /// Last snapshot fetched before the poll ended
    pub fn snapshot(&self) -> Option<&S> {
        match self {
            PollError::Config(_) => None,
            PollError::Failed { snapshot, .. } => Some(snapshot),
            PollError::TimedOut { snapshot, .. }
            | PollError::Cancelled { snapshot, .. }
            | PollError::Fetch { snapshot, .. } => snapshot.as_ref(),
        }
    }

    pub fn into_snapshot(self) -> Option<S> {
        match self {
            PollError::Config(_) => None,
            PollError::Failed { snapshot, .. } => Some(snapshot),
            PollError::TimedOut { snapshot, .. }
            | PollError::Cancelled { snapshot, .. }
            | PollError::Fetch { snapshot, .. } => snapshot,
        }
    }

    pub fn report(&self) -> Option<&PollReport> {
        match self {
            PollError::Config(_) => None,
            PollError::Failed { report, .. }
            | PollError::TimedOut { report, .. }
            | PollError::Cancelled { report, .. }
            | PollError::Fetch { report, .. } => Some(report),
        }
    }
}

/// Why a wait between ticks ended
enum Wake {
    Elapsed,
    Deadline,
    Cancelled,
}

/// Resolves at `deadline`, or never when the timeout has no representable deadline
async fn deadline_reached(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn wait(cancel: &CancelToken, deadline: Option<Instant>, duration: Duration) -> Wake {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Wake::Cancelled,
        _ = deadline_reached(deadline) => Wake::Deadline,
        _ = sleep(duration) => Wake::Elapsed,
    }
}

/// State carried between ticks
struct Tracker<S> {
    started: Instant,
    timeout: Duration,
    state: Option<LifecycleState>,
    snapshot: Option<S>,
    report: PollReport,
}

impl<S> Tracker<S> {
    fn new(started: Instant, timeout: Duration) -> Self {
        Self {
            started,
            timeout,
            state: None,
            snapshot: None,
            report: PollReport::default(),
        }
    }

    fn finish_report(&mut self) -> PollReport {
        let mut report = std::mem::take(&mut self.report);
        report.elapsed = self.started.elapsed();
        report
    }

    fn outcome(mut self, final_state: FinalState) -> PollOutcome<S> {
        let report = self.finish_report();
        PollOutcome {
            final_state,
            state: self.state,
            snapshot: self.snapshot,
            report,
        }
    }

    fn failed(mut self, state: LifecycleState, snapshot: S) -> PollError<S> {
        let report = self.finish_report();
        PollError::Failed {
            state,
            snapshot,
            report,
        }
    }

    fn timed_out(mut self) -> PollError<S> {
        let report = self.finish_report();
        PollError::TimedOut {
            timeout: self.timeout,
            state: self.state,
            snapshot: self.snapshot,
            report,
        }
    }

    fn cancelled(mut self) -> PollError<S> {
        let report = self.finish_report();
        PollError::Cancelled {
            state: self.state,
            snapshot: self.snapshot,
            report,
        }
    }

    fn fetch_failed(mut self, source: FetchError) -> PollError<S> {
        let report = self.finish_report();
        PollError::Fetch {
            source,
            snapshot: self.snapshot,
            report,
        }
    }
}

/// Poll `fetch` until the resource reaches a terminal state
///
/// Returns `Ok` when a target state is reached or the resource is not found,
/// and a [`PollError`] carrying the last snapshot otherwise.
pub async fn poll<S, F, Fut>(
    spec: &PollSpec,
    cancel: &CancelToken,
    mut fetch: F,
) -> Result<PollOutcome<S>, PollError<S>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Fetched<S>, FetchError>>,
{
    spec.validate().map_err(PollError::Config)?;

    let started = Instant::now();
    // A timeout past the end of the clock never fires
    let deadline = started.checked_add(spec.timeout);
    let mut tracker = Tracker::new(started, spec.timeout);
    let mut interval = spec.interval;
    let mut consecutive_errors: u32 = 0;

    if !spec.delay.is_zero() {
        match wait(cancel, deadline, spec.delay).await {
            Wake::Elapsed => {}
            Wake::Deadline => return Err(tracker.timed_out()),
            Wake::Cancelled => return Err(tracker.cancelled()),
        }
    }

    loop {
        if cancel.is_cancelled() {
            return Err(tracker.cancelled());
        }

        tracker.report.fetches += 1;
        let fetch_number = tracker.report.fetches;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(tracker.cancelled()),
            _ = deadline_reached(deadline) => return Err(tracker.timed_out()),
            result = fetch() => result,
        };

        match result {
            Ok(Fetched::NotFound) => {
                log::debug!("Resource not found after {} fetches", fetch_number);
                return Ok(tracker.outcome(FinalState::NotFound));
            }
            Ok(Fetched::Found { state, snapshot }) => {
                consecutive_errors = 0;
                match spec.classify(&state) {
                    StateClass::Failure => {
                        log::debug!("Resource reached failure state '{}'", state);
                        return Err(tracker.failed(state, snapshot));
                    }
                    StateClass::Target => {
                        log::debug!(
                            "Resource reached target state '{}' after {} fetches",
                            state,
                            fetch_number
                        );
                        tracker.state = Some(state);
                        tracker.snapshot = Some(snapshot);
                        return Ok(tracker.outcome(FinalState::Target));
                    }
                    StateClass::Pending => {}
                    StateClass::Unclassified => {
                        log::warn!(
                            "Unclassified lifecycle state '{}' on fetch {}, treating as pending",
                            state,
                            fetch_number
                        );
                        tracker.report.warnings.push(PollWarning::UnclassifiedState {
                            state: state.clone(),
                            fetch: fetch_number,
                        });
                    }
                }
                tracker.state = Some(state);
                tracker.snapshot = Some(snapshot);
            }
            Err(e) => {
                consecutive_errors += 1;
                if !spec.fetch_errors.tolerates(consecutive_errors) {
                    return Err(tracker.fetch_failed(e));
                }
                log::debug!(
                    "Tolerating fetch error {} in a row: {}",
                    consecutive_errors,
                    e
                );
                tracker.report.warnings.push(PollWarning::FetchErrorTolerated {
                    message: e.to_string(),
                    fetch: fetch_number,
                    consecutive: consecutive_errors,
                });
            }
        }

        match wait(cancel, deadline, interval).await {
            Wake::Elapsed => {}
            Wake::Deadline => return Err(tracker.timed_out()),
            Wake::Cancelled => return Err(tracker.cancelled()),
        }

        if let Some(backoff) = &spec.backoff {
            interval = backoff.next_interval(interval);
        }
    }
}
