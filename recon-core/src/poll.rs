//! Long-running-operation polling with an injected clock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Error, Operation, RemoteError, Result};
use crate::id::ResourceId;
use crate::remote::{PollStatus, RemoteClient, Submitted};

/// Source of time for deadlines and poll intervals.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    async fn sleep(&self, duration: Duration);
}

/// Wall-clock time through tokio.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual time that only moves when [`advance`](Self::advance) is called.
///
/// `sleep` parks until enough time has been advanced, so a test steps every
/// waiter explicitly. [`sleepers`](Self::sleepers) tells when a task has
/// parked.
#[derive(Debug)]
pub struct ManualClock {
    start: Instant,
    elapsed: watch::Sender<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        let (elapsed, _) = watch::channel(Duration::ZERO);
        Self {
            start: Instant::now(),
            elapsed,
        }
    }

    pub fn advance(&self, by: Duration) {
        self.elapsed.send_modify(|elapsed| *elapsed += by);
    }

    pub fn elapsed(&self) -> Duration {
        *self.elapsed.borrow()
    }

    /// Number of tasks parked in `sleep`.
    pub fn sleepers(&self) -> usize {
        self.elapsed.receiver_count()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start + self.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        let target = self.elapsed() + duration;
        let mut elapsed = self.elapsed.subscribe();
        // The sender lives as long as `self`, so the wait cannot fail.
        let _ = elapsed.wait_for(|now| *now >= target).await;
    }
}

/// Point in time after which an operation gives up.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    at: Instant,
}

impl Deadline {
    pub fn after(clock: &dyn Clock, budget: Duration) -> Self {
        let started = clock.now();
        Self {
            started,
            at: started + budget,
        }
    }

    pub fn remaining(&self, clock: &dyn Clock) -> Duration {
        self.at.saturating_duration_since(clock.now())
    }

    pub fn is_expired(&self, clock: &dyn Clock) -> bool {
        clock.now() >= self.at
    }

    /// Time spent since the deadline was set.
    pub fn waited(&self, clock: &dyn Clock) -> Duration {
        clock.now().saturating_duration_since(self.started)
    }
}

/// Poll interval configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Delay before the first status query.
    #[serde(with = "crate::config::millis")]
    pub initial_interval: Duration,
    /// Upper bound for the computed delay.
    #[serde(with = "crate::config::millis")]
    pub max_interval: Duration,
    /// Growth factor between consecutive polls.
    pub multiplier: f64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl PollConfig {
    fn next_interval(&self, current: Duration) -> Duration {
        let next = Duration::from_secs_f64(current.as_secs_f64() * self.multiplier.max(1.0));
        next.min(self.max_interval)
    }
}

/// Drives a [`Submitted`] mutation to a terminal state.
#[derive(Clone)]
pub struct Poller {
    remote: Arc<dyn RemoteClient>,
    clock: Arc<dyn Clock>,
    config: PollConfig,
}

impl Poller {
    pub fn new(remote: Arc<dyn RemoteClient>, clock: Arc<dyn Clock>, config: PollConfig) -> Self {
        Self {
            remote,
            clock,
            config,
        }
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    fn timeout(&self, deadline: &Deadline, operation: Operation, id: &ResourceId, attempt: u32) -> Error {
        let clock = self.clock.as_ref();
        warn!(
            operation = %operation,
            id = %id,
            attempt = attempt,
            "Long-running operation exceeded its deadline"
        );
        Error::Timeout {
            operation,
            id: id.to_string(),
            waited: deadline.waited(clock),
        }
    }

    /// Wait until `submitted` completes, fails, or `deadline` passes.
    ///
    /// `operation` and `id` are only used for error context.
    pub async fn wait(
        &self,
        submitted: Submitted,
        deadline: &Deadline,
        operation: Operation,
        id: &ResourceId,
    ) -> Result<()> {
        let handle = match submitted {
            Submitted::Completed => return Ok(()),
            Submitted::Pending(handle) => handle,
        };

        let clock = self.clock.as_ref();
        let mut interval = self.config.initial_interval;
        let mut attempt = 0u32;

        loop {
            if deadline.is_expired(clock) {
                return Err(self.timeout(deadline, operation, id, attempt));
            }

            clock.sleep(interval.min(deadline.remaining(clock))).await;
            attempt += 1;

            match self.remote.poll(&handle).await {
                Ok(PollStatus::Succeeded) => {
                    debug!(operation = %operation, id = %id, attempt = attempt, "Operation succeeded");
                    return Ok(());
                }
                Ok(PollStatus::InProgress { retry_after }) => {
                    interval = match retry_after {
                        // A zero or tiny Retry-After would spin against the server.
                        Some(server) => server.max(self.config.initial_interval),
                        None => self.config.next_interval(interval),
                    };
                    debug!(
                        operation = %operation,
                        id = %id,
                        attempt = attempt,
                        next_ms = interval.as_millis() as u64,
                        "Operation still in progress"
                    );
                }
                Ok(PollStatus::Failed { message }) => {
                    return Err(Error::remote(
                        operation,
                        id,
                        RemoteError::OperationFailed {
                            state: "Failed".into(),
                            message,
                        },
                    ));
                }
                Ok(PollStatus::Canceled) => {
                    return Err(Error::remote(
                        operation,
                        id,
                        RemoteError::OperationFailed {
                            state: "Canceled".into(),
                            message: "operation was canceled".into(),
                        },
                    ));
                }
                Err(e) => return Err(Error::remote(Operation::Poll, id, e)),
            }
        }
    }

    /// Re-read `id` until the state reported by `state_of` leaves `pending`.
    ///
    /// Reaching `target` succeeds. Any other state, a missing object or a
    /// missing state field is an error.
    pub async fn wait_for_state<F>(
        &self,
        id: &ResourceId,
        deadline: &Deadline,
        operation: Operation,
        pending: &[&str],
        target: &str,
        state_of: F,
    ) -> Result<()>
    where
        F: Fn(&Value) -> Option<&str> + Send + Sync,
    {
        let clock = self.clock.as_ref();
        let mut interval = self.config.initial_interval;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let body = self
                .remote
                .get(id)
                .await
                .map_err(|e| Error::remote(Operation::Get, id, e))?
                .ok_or_else(|| {
                    Error::remote(
                        Operation::Get,
                        id,
                        RemoteError::Status {
                            status: 404,
                            code: Some("ResourceNotFound".into()),
                            message: "object disappeared while waiting for it to settle".into(),
                        },
                    )
                })?;
            let state = state_of(&body).ok_or_else(|| {
                Error::remote(
                    Operation::Get,
                    id,
                    RemoteError::Decode("provisioning state is missing".into()),
                )
            })?;

            if state.eq_ignore_ascii_case(target) {
                debug!(operation = %operation, id = %id, attempt = attempt, "Object settled");
                return Ok(());
            }
            if !pending.iter().any(|p| p.eq_ignore_ascii_case(state)) {
                return Err(Error::remote(
                    operation,
                    id,
                    RemoteError::OperationFailed {
                        state: state.to_string(),
                        message: format!("expected {} but the object is {}", target, state),
                    },
                ));
            }
            if deadline.is_expired(clock) {
                return Err(self.timeout(deadline, operation, id, attempt));
            }

            debug!(
                operation = %operation,
                id = %id,
                attempt = attempt,
                state = state,
                "Waiting for object to settle"
            );
            clock.sleep(interval.min(deadline.remaining(clock))).await;
            interval = self.config.next_interval(interval);
        }
    }
}
