//! Wait-until-target-state polling.
//!
//! [`wait_for_state`] repeatedly refreshes a remote status and suspends on a
//! tokio timer between attempts until the status reaches the target, leaves
//! the allowed pending set, the refresh fails, the deadline passes, or the
//! run is cancelled. Cancellation is observed during the sleep as well as
//! before each refresh, so it is noticed without waiting for the next tick.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::{Instant, sleep_until, timeout_at};
use tracing::{debug, trace};

use bakery_types::{ResourceId, ResourceStatus};

use crate::{
    provider::{ProviderError, RemoteProvider},
    state::CancellationFlag,
};

/// Default delay between two refreshes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Default upper bound on the total wait.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// Consecutive "not visible yet" answers tolerated before giving up.
pub const DEFAULT_NOT_FOUND_CHECKS: u32 = 20;
/// Stand-in for "never" when a duration does not fit on the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Why waiting for a target state failed.
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("timed out after {0:?} waiting for the target state")]
    Timeout(Duration),

    #[error("unexpected state '{actual}', wanted target '{target}'")]
    UnexpectedState { actual: String, target: String },

    #[error("error refreshing state: {0}")]
    Refresh(#[source] ProviderError),

    #[error("interrupted")]
    Cancelled,

    #[error("resource not found after {checks} checks")]
    NotFound { checks: u32 },
}

/// Source of the current status of a remote resource.
///
/// `Ok(None)` means the provider does not report the resource yet, which is
/// common right after creation with eventually consistent APIs.
#[async_trait]
pub trait StateRefresh<S>: Send + Sync {
    async fn refresh(&self) -> Result<Option<S>, ProviderError>;
}

/// Describes the wait: which statuses are acceptable while waiting, which one
/// ends it, and how often and how long to poll.
#[derive(Debug, Clone)]
pub struct StateChangeConf<S> {
    pub pending: Vec<S>,
    pub target: S,
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub not_found_checks: u32,
}

impl<S> StateChangeConf<S> {
    pub fn new(pending: Vec<S>, target: S) -> Self {
        Self {
            pending,
            target,
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_WAIT_TIMEOUT,
            not_found_checks: DEFAULT_NOT_FOUND_CHECKS,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_not_found_checks(mut self, not_found_checks: u32) -> Self {
        self.not_found_checks = not_found_checks;
        self
    }
}

/// Blocks the calling task until `refresher` reports `conf.target`.
///
/// Returns the target status on success. The result is binary: either the
/// resource reached the target, or a single [`WaitError`] says why not.
pub async fn wait_for_state<S, R>(conf: &StateChangeConf<S>, refresher: &R, cancellation: &CancellationFlag) -> Result<S, WaitError>
where
    S: PartialEq + Clone + fmt::Display + Send + Sync,
    R: StateRefresh<S> + ?Sized,
{
    let deadline = instant_after(conf.timeout);
    let mut attempts = 0u32;
    let mut not_found = 0u32;

    debug!(target_state = %conf.target, interval = ?conf.poll_interval, timeout = ?conf.timeout, "waiting for state");

    loop {
        if cancellation.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        if Instant::now() >= deadline {
            return Err(WaitError::Timeout(conf.timeout));
        }

        attempts += 1;
        let observed = tokio::select! {
            _ = cancellation.cancelled() => return Err(WaitError::Cancelled),
            refreshed = timeout_at(deadline, refresher.refresh()) => match refreshed {
                Ok(result) => result.map_err(WaitError::Refresh)?,
                Err(_) => return Err(WaitError::Timeout(conf.timeout)),
            },
        };

        match observed {
            Some(state) if state == conf.target => {
                debug!(state = %state, attempts, "target state reached");
                return Ok(state);
            }
            Some(state) if conf.pending.contains(&state) => {
                not_found = 0;
                trace!(state = %state, attempts, "still pending");
            }
            Some(state) => {
                return Err(WaitError::UnexpectedState {
                    actual: state.to_string(),
                    target: conf.target.to_string(),
                });
            }
            None => {
                not_found += 1;
                if not_found > conf.not_found_checks {
                    return Err(WaitError::NotFound { checks: not_found });
                }
                trace!(attempts, not_found, "resource not visible yet");
            }
        }

        let wake_at = instant_after(conf.poll_interval).min(deadline);
        tokio::select! {
            _ = cancellation.cancelled() => return Err(WaitError::Cancelled),
            _ = sleep_until(wake_at) => {}
        }
    }
}

fn instant_after(duration: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(duration).unwrap_or(now + FAR_FUTURE)
}

/// Refreshes an image's status through [`RemoteProvider::describe_resource`].
pub struct ResourceStateRefresher {
    provider: Arc<dyn RemoteProvider>,
    id: ResourceId,
}

impl ResourceStateRefresher {
    pub fn new(provider: Arc<dyn RemoteProvider>, id: ResourceId) -> Self {
        Self { provider, id }
    }
}

#[async_trait]
impl StateRefresh<ResourceStatus> for ResourceStateRefresher {
    async fn refresh(&self) -> Result<Option<ResourceStatus>, ProviderError> {
        self.provider.describe_resource(&self.id).await
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            Mutex,
            atomic::{AtomicU32, Ordering},
        },
    };

    use super::*;

    /// Replays a fixed sequence of answers, repeating the last one forever.
    struct ScriptedRefresh {
        answers: Mutex<VecDeque<Result<Option<ResourceStatus>, ProviderError>>>,
        last: Mutex<Option<ResourceStatus>>,
        calls: AtomicU32,
    }

    impl ScriptedRefresh {
        fn statuses(statuses: &[&str]) -> Self {
            Self::answers(statuses.iter().map(|status| Ok(Some(ResourceStatus::from(*status)))).collect())
        }

        fn answers(answers: Vec<Result<Option<ResourceStatus>, ProviderError>>) -> Self {
            Self {
                answers: Mutex::new(answers.into()),
                last: Mutex::new(None),
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StateRefresh<ResourceStatus> for ScriptedRefresh {
        async fn refresh(&self) -> Result<Option<ResourceStatus>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.answers.lock().unwrap().pop_front();
            match next {
                Some(answer) => {
                    if let Ok(status) = &answer {
                        *self.last.lock().unwrap() = status.clone();
                    }
                    answer
                }
                None => Ok(self.last.lock().unwrap().clone()),
            }
        }
    }

    fn image_conf() -> StateChangeConf<ResourceStatus> {
        StateChangeConf::new(vec![ResourceStatus::Pending], ResourceStatus::Available).with_poll_interval(Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn reaches_target_after_pending_polls() {
        let refresher = ScriptedRefresh::statuses(&["pending", "pending", "available"]);
        let state = wait_for_state(&image_conf(), &refresher, &CancellationFlag::new())
            .await
            .expect("target reached");

        assert_eq!(state, ResourceStatus::Available);
        assert_eq!(refresher.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn disallowed_state_fails_immediately() {
        let refresher = ScriptedRefresh::statuses(&["pending", "failed"]);
        let error = wait_for_state(&image_conf(), &refresher, &CancellationFlag::new())
            .await
            .unwrap_err();

        assert!(matches!(error, WaitError::UnexpectedState { ref actual, ref target } if actual == "failed" && target == "available"));
        assert_eq!(refresher.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_error_is_propagated() {
        let refresher = ScriptedRefresh::answers(vec![
            Ok(Some(ResourceStatus::Pending)),
            Err(ProviderError::Request("connection reset".into())),
        ]);
        let error = wait_for_state(&image_conf(), &refresher, &CancellationFlag::new())
            .await
            .unwrap_err();

        assert!(matches!(error, WaitError::Refresh(ProviderError::Request(ref message)) if message == "connection reset"));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_target_is_never_reached() {
        let refresher = ScriptedRefresh::statuses(&["pending"]);
        let conf = image_conf().with_timeout(Duration::from_secs(10));
        let started = Instant::now();

        let error = wait_for_state(&conf, &refresher, &CancellationFlag::new()).await.unwrap_err();

        assert!(matches!(error, WaitError::Timeout(timeout) if timeout == Duration::from_secs(10)));
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert_eq!(refresher.calls(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_timeout_does_not_overflow_the_clock() {
        let refresher = ScriptedRefresh::statuses(&["pending", "available"]);
        let conf = image_conf().with_timeout(Duration::MAX);

        let state = wait_for_state(&conf, &refresher, &CancellationFlag::new()).await.unwrap();

        assert_eq!(state, ResourceStatus::Available);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_interval_sleeps_until_the_deadline() {
        let refresher = ScriptedRefresh::statuses(&["pending"]);
        let conf = image_conf()
            .with_poll_interval(Duration::from_secs(u64::MAX))
            .with_timeout(Duration::from_secs(10));
        let started = Instant::now();

        let error = wait_for_state(&conf, &refresher, &CancellationFlag::new()).await.unwrap_err();

        assert!(matches!(error, WaitError::Timeout(_)));
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert_eq!(refresher.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn target_reached_at_the_deadline_does_not_count() {
        let refresher = ScriptedRefresh::statuses(&["pending", "pending", "available"]);
        let conf = image_conf().with_timeout(Duration::from_secs(2));

        let error = wait_for_state(&conf, &refresher, &CancellationFlag::new()).await.unwrap_err();

        assert!(matches!(error, WaitError::Timeout(_)));
        assert_eq!(refresher.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_sleep() {
        let refresher = ScriptedRefresh::statuses(&["pending"]);
        let conf = image_conf().with_poll_interval(Duration::from_secs(60));
        let cancellation = CancellationFlag::new();
        let started = Instant::now();

        let canceller = {
            let cancellation = cancellation.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                cancellation.cancel();
            })
        };

        let error = wait_for_state(&conf, &refresher, &cancellation).await.unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(error, WaitError::Cancelled));
        assert!(started.elapsed() < conf.poll_interval);
        assert_eq!(refresher.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn already_cancelled_flag_skips_refresh() {
        let refresher = ScriptedRefresh::statuses(&["available"]);
        let cancellation = CancellationFlag::new();
        cancellation.cancel();

        let error = wait_for_state(&image_conf(), &refresher, &cancellation).await.unwrap_err();

        assert!(matches!(error, WaitError::Cancelled));
        assert_eq!(refresher.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn tolerates_a_bounded_number_of_not_found_answers() {
        let refresher = ScriptedRefresh::answers(vec![Ok(None), Ok(None), Ok(Some(ResourceStatus::Available))]);
        let conf = image_conf().with_not_found_checks(2);
        assert!(wait_for_state(&conf, &refresher, &CancellationFlag::new()).await.is_ok());

        let refresher = ScriptedRefresh::answers(vec![Ok(None), Ok(None), Ok(None)]);
        let error = wait_for_state(&conf, &refresher, &CancellationFlag::new()).await.unwrap_err();
        assert!(matches!(error, WaitError::NotFound { checks: 3 }));
    }
}
