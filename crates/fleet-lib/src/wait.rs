//! Bounded polling
//!
//! Every readiness check in the fleet goes through [`wait_until`]: evaluate a
//! predicate, sleep, repeat, and give up with `OperationTimeout` once the
//! budget is spent. Transient connection and authentication errors count as
//! "not yet"; any other error ends the wait immediately.

use crate::error::{FleetError, Result};
use crate::observability::FleetMetrics;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Default interval between predicate evaluations
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default wait budget
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Budget for an elastic instance to boot and pass its system checks
pub const INSTANCE_READY_TIMEOUT: Duration = Duration::from_secs(600);

/// Interval between elastic instance status checks
pub const INSTANCE_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_WAIT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl WaitOptions {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }

    pub fn instance_ready() -> Self {
        Self::new(INSTANCE_READY_TIMEOUT, INSTANCE_POLL_INTERVAL)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Outcome of a successful wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitStats {
    /// Number of predicate evaluations, including the successful one
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Poll `predicate` until it yields `true` or the timeout elapses.
///
/// `description` and `scope` name what was awaited and where, and end up in
/// the `OperationTimeout` error. The last transient error observed is kept
/// as the cause of the timeout.
pub async fn wait_until<F, Fut>(
    description: &str,
    scope: &str,
    options: WaitOptions,
    mut predicate: F,
) -> Result<WaitStats>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let started = Instant::now();
    let mut attempts: u32 = 0;
    let mut last_error: Option<String> = None;

    debug!(
        description = %description,
        scope = %scope,
        timeout_secs = options.timeout.as_secs(),
        "Waiting"
    );

    loop {
        attempts += 1;
        match predicate().await {
            Ok(true) => {
                let elapsed = started.elapsed();
                debug!(
                    description = %description,
                    scope = %scope,
                    attempts = attempts,
                    elapsed_secs = elapsed.as_secs(),
                    "Wait condition met"
                );
                return Ok(WaitStats { attempts, elapsed });
            }
            Ok(false) => {}
            Err(e) if e.is_transient() => {
                debug!(description = %description, error = %e, "Transient failure while waiting");
                last_error = Some(e.to_string());
            }
            Err(e) => return Err(e),
        }

        let elapsed = started.elapsed();
        if elapsed >= options.timeout {
            warn!(
                description = %description,
                scope = %scope,
                attempts = attempts,
                elapsed_secs = elapsed.as_secs(),
                last_error = ?last_error,
                "Wait timed out"
            );
            FleetMetrics::new().inc_wait_timeouts(scope);
            return Err(FleetError::OperationTimeout {
                description: description.to_string(),
                scope: scope.to_string(),
                elapsed,
                last_error,
            });
        }

        sleep(options.poll_interval).await;
    }
}
