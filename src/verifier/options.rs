//! Per-run configuration.

use std::time::Duration;

use crate::clock::VirtualClock;
use crate::protocol::UNBOUNDED;

/// Configuration for one [`StepVerifier`](super::StepVerifier).
///
/// ```rust
/// use std::time::Duration;
/// use stepverify::verifier::StepVerifierOptions;
///
/// let options = StepVerifierOptions::new()
///     .initial_request(1)
///     .default_timeout(Duration::from_secs(5))
///     .scenario_name("one by one");
///
/// assert_eq!(options.initial_request, 1);
/// ```
#[derive(Debug, Clone)]
pub struct StepVerifierOptions {
    /// Demand requested right after subscription. `0` requests nothing.
    pub initial_request: u64,
    /// Clock advanced by `then_await` steps.
    pub virtual_clock: Option<VirtualClock>,
    /// Timeout applied by `verify()` and `try_verify()`.
    pub default_timeout: Option<Duration>,
    /// Name prefixed to failure messages.
    pub scenario_name: Option<String>,
}

impl Default for StepVerifierOptions {
    fn default() -> Self {
        Self {
            initial_request: UNBOUNDED,
            virtual_clock: None,
            default_timeout: None,
            scenario_name: None,
        }
    }
}

impl StepVerifierOptions {
    /// Create a new default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the demand requested right after subscription.
    #[must_use]
    pub fn initial_request(mut self, n: u64) -> Self {
        self.initial_request = n;
        self
    }

    /// Bind a virtual clock for `then_await`.
    #[must_use]
    pub fn virtual_clock(mut self, clock: VirtualClock) -> Self {
        self.virtual_clock = Some(clock);
        self
    }

    /// Set the timeout used when none is given at verification time.
    #[must_use]
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Name the scenario in failure messages and logs.
    #[must_use]
    pub fn scenario_name(mut self, name: impl Into<String>) -> Self {
        self.scenario_name = Some(name.into());
        self
    }
}
