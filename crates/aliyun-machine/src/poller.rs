//! Bounded polling for asynchronous instance state transitions.
//!
//! The control plane reports state changes only through `describe`, so every
//! "wait until X" in the driver goes through [`poll_until`]. Query errors are
//! treated as "not yet" because describing an instance can legitimately fail
//! while it is being provisioned or torn down.

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::types::MachineState;
use crate::{Error, Result};

/// Fixed-interval polling with optional bounds.
///
/// With neither `timeout` nor `max_attempts` set the wait is unbounded and
/// only cancellation can stop it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub timeout: Option<Duration>,
    pub max_attempts: Option<u32>,
}

impl PollConfig {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            timeout: None,
            max_attempts: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }
}

/// Query until `done` accepts a value, returning that value.
///
/// # Errors
/// * `Error::Timeout` once `config.timeout` has elapsed or `config.max_attempts`
///   queries have been made without success.
/// * `Error::Cancelled` as soon as `cancel` fires, mid-sleep or mid-query.
pub async fn poll_until<T, F, Fut, P>(
    waiting_for: &str,
    config: &PollConfig,
    cancel: &CancellationToken,
    mut query: F,
    done: P,
) -> Result<T>
where
    T: Debug,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&T) -> bool,
{
    let start = Instant::now();
    let mut attempts = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled {
                waiting_for: waiting_for.to_string(),
            });
        }

        attempts += 1;
        // A hung query must not outlive the bound or ignore cancellation.
        let remaining = config.timeout.map(|t| t.saturating_sub(start.elapsed()));
        let outcome = tokio::select! {
            outcome = bounded(query(), remaining) => outcome,
            () = cancel.cancelled() => {
                return Err(Error::Cancelled {
                    waiting_for: waiting_for.to_string(),
                });
            }
        };
        match outcome {
            Some(Ok(value)) if done(&value) => {
                debug!(waiting_for, attempts, "wait satisfied");
                return Ok(value);
            }
            Some(Ok(value)) => {
                debug!(waiting_for, attempts, current = ?value, "not there yet");
            }
            Some(Err(e)) => {
                warn!(waiting_for, attempts, error = %e, "state query failed, will retry");
            }
            None => {
                warn!(waiting_for, attempts, "state query did not answer in time");
            }
        }

        let exhausted = config.max_attempts.is_some_and(|max| attempts >= max)
            || config.timeout.is_some_and(|t| start.elapsed() >= t);
        if exhausted {
            return Err(Error::Timeout {
                waiting_for: waiting_for.to_string(),
                attempts,
                elapsed: start.elapsed(),
            });
        }

        tokio::select! {
            () = tokio::time::sleep(config.interval) => {}
            () = cancel.cancelled() => {
                return Err(Error::Cancelled {
                    waiting_for: waiting_for.to_string(),
                });
            }
        }
    }
}

/// `None` if `limit` passes before `fut` completes.
async fn bounded<F: Future>(fut: F, limit: Option<Duration>) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// Wait for an instance to reach `target`.
pub async fn wait_for_state<F, Fut>(
    instance_id: &str,
    target: MachineState,
    config: &PollConfig,
    cancel: &CancellationToken,
    query: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<MachineState>>,
{
    let waiting_for = format!("instance {instance_id} to become {target}");
    poll_until(&waiting_for, config, cancel, query, |state| *state == target).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::{Action, ErrorKind, ProviderError};

    fn scripted(
        states: &[Result<MachineState>],
    ) -> (
        Arc<Mutex<VecDeque<Result<MachineState>>>>,
        Arc<Mutex<u32>>,
    ) {
        let queue = states
            .iter()
            .map(|r| match r {
                Ok(s) => Ok(*s),
                Err(_) => Err(Error::remote(
                    Action::DescribeInstance,
                    ProviderError::new("describe failed"),
                )),
            })
            .collect();
        (Arc::new(Mutex::new(queue)), Arc::new(Mutex::new(0)))
    }

    fn query(
        queue: &Arc<Mutex<VecDeque<Result<MachineState>>>>,
        calls: &Arc<Mutex<u32>>,
    ) -> impl FnMut() -> std::future::Ready<Result<MachineState>> {
        let queue = Arc::clone(queue);
        let calls = Arc::clone(calls);
        move || {
            *calls.lock().unwrap() += 1;
            let mut q = queue.lock().unwrap();
            let next = if q.len() > 1 {
                q.pop_front().unwrap()
            } else {
                match q.front().unwrap() {
                    Ok(s) => Ok(*s),
                    Err(_) => Err(Error::NotFound("scripted".into())),
                }
            };
            std::future::ready(next)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn returns_once_target_is_reached() {
        let (queue, calls) = scripted(&[
            Ok(MachineState::Stopped),
            Ok(MachineState::Starting),
            Ok(MachineState::Running),
        ]);
        let config = PollConfig::every(Duration::from_secs(10));
        let cancel = CancellationToken::new();
        let start = Instant::now();

        wait_for_state("i-1", MachineState::Running, &config, &cancel, query(&queue, &calls))
            .await
            .unwrap();

        assert_eq!(*calls.lock().unwrap(), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn query_errors_are_not_fatal() {
        let (queue, calls) = scripted(&[
            Err(Error::NotFound(String::new())),
            Err(Error::NotFound(String::new())),
            Ok(MachineState::Stopped),
        ]);
        let config = PollConfig::every(Duration::from_secs(3));

        wait_for_state(
            "i-1",
            MachineState::Stopped,
            &config,
            &CancellationToken::new(),
            query(&queue, &calls),
        )
        .await
        .unwrap();

        assert_eq!(*calls.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_after_bound() {
        let (queue, calls) = scripted(&[Ok(MachineState::Starting)]);
        let config = PollConfig::every(Duration::from_secs(10)).with_timeout(Duration::from_secs(30));

        let err = wait_for_state(
            "i-1",
            MachineState::Running,
            &config,
            &CancellationToken::new(),
            query(&queue, &calls),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(*calls.lock().unwrap(), 4);
        assert!(err.to_string().contains("instance i-1 to become Running"));
    }

    #[tokio::test(start_paused = true)]
    async fn max_attempts_bounds_the_wait() {
        let (queue, calls) = scripted(&[Ok(MachineState::Stopping)]);
        let config = PollConfig::every(Duration::from_secs(1)).with_max_attempts(5);

        let err = wait_for_state(
            "i-1",
            MachineState::Stopped,
            &config,
            &CancellationToken::new(),
            query(&queue, &calls),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Timeout { attempts: 5, .. }));
        assert_eq!(*calls.lock().unwrap(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_sleep() {
        let (queue, calls) = scripted(&[Ok(MachineState::Starting)]);
        let config = PollConfig::every(Duration::from_secs(10));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(15)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let err = wait_for_state("i-1", MachineState::Running, &config, &cancel, query(&queue, &calls))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(!err.is_retryable());
        assert_eq!(*calls.lock().unwrap(), 2);
        assert_eq!(start.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_query_is_cut_off_by_the_timeout() {
        let config = PollConfig::every(Duration::from_secs(10)).with_timeout(Duration::from_secs(30));
        let start = Instant::now();

        let err = wait_for_state(
            "i-1",
            MachineState::Running,
            &config,
            &CancellationToken::new(),
            std::future::pending::<Result<MachineState>>,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Timeout { attempts: 1, .. }));
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_a_hung_query() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            trigger.cancel();
        });
        let start = Instant::now();

        let err = wait_for_state(
            "i-1",
            MachineState::Running,
            &PollConfig::every(Duration::from_secs(10)),
            &cancel,
            std::future::pending::<Result<MachineState>>,
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(start.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn already_cancelled_token_skips_the_query() {
        let (queue, calls) = scripted(&[Ok(MachineState::Running)]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = wait_for_state(
            "i-1",
            MachineState::Running,
            &PollConfig::every(Duration::from_secs(1)),
            &cancel,
            query(&queue, &calls),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(*calls.lock().unwrap(), 0);
    }
}
