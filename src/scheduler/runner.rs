use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Shortest cadence the runner accepts.
pub const MIN_PERIOD: Duration = Duration::from_secs(1);

/// A unit of work the runner invokes once per tick.
#[async_trait]
pub trait Job: Send {
    fn name(&self) -> &str;

    async fn run(&mut self) -> Result<()>;
}

/// Lifecycle of a [`JobRunner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Running,
    Stopped,
}

/// Runs a job on a fixed wall-clock cadence.
///
/// The first iteration starts immediately. Later ones are aligned to
/// multiples of `period` from the start; triggers that fall inside a still
/// running iteration are dropped, so iterations never overlap or burst.
pub struct JobRunner {
    period: Duration,
    state: RunnerState,
    iterations: u64,
}

impl JobRunner {
    /// # Arguments
    /// * `period`: Spacing of the trigger grid. Values below [`MIN_PERIOD`]
    ///   are raised to it.
    pub fn new(period: Duration) -> Self {
        if period < MIN_PERIOD {
            warn!(
                "Runner period {:?} is below the minimum, using {:?}",
                period, MIN_PERIOD
            );
        }
        Self {
            period: period.max(MIN_PERIOD),
            state: RunnerState::Idle,
            iterations: 0,
        }
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    /// Iterations started so far, including failed ones.
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Drives `job` until `cancel` fires. The token is checked before each
    /// iteration; an iteration already in flight runs to completion.
    pub async fn run<J>(&mut self, job: &mut J, cancel: CancellationToken)
    where
        J: Job + ?Sized,
    {
        info!(
            "Adding job [{}] to run every {} seconds...",
            job.name(),
            self.period.as_secs()
        );

        let mut next = Instant::now();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sleep_until(next) => {}
            }

            self.state = RunnerState::Running;
            self.iterations += 1;
            if let Err(e) = job.run().await {
                error!("Job [{}] iteration {} failed: {:#}", job.name(), self.iterations, e);
            }
            self.state = RunnerState::Idle;

            next = next_trigger(next, self.period, Instant::now());
        }

        self.state = RunnerState::Stopped;
        info!("Stopped job [{}] after {} iteration(s)", job.name(), self.iterations);
    }
}

/// First trigger after `last` on the `period` grid that is not in the past.
fn next_trigger(last: Instant, period: Duration, now: Instant) -> Instant {
    let mut next = last + period;
    while next < now {
        next += period;
    }
    next
}
