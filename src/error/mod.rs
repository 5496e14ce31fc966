//! Error definitions
//!
//! Every way a verification run can fail maps to one [`Error`] variant. The
//! variants are deliberately coarse: protocol violations, expectation
//! mismatches and timeouts are distinguishable, while failures raised by user
//! closures keep their original message untouched.

use std::time::Duration;

use thiserror::Error;

/// Main error type for stepverify
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A signal arrived that cannot legally follow the previous ones
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// An observed signal did not satisfy the declared step
    #[error("expectation \"{step}\" failed (expected: {expected}; actual: {actual})")]
    ExpectationMismatch {
        /// Description of the failing step, e.g. `expect_next("baz")`
        step: String,
        /// What the step expected
        expected: String,
        /// What was observed instead
        actual: String,
    },

    /// The overall deadline elapsed before a terminal signal
    #[error("verification timed out after {0:?}")]
    Timeout(Duration),

    /// A user-supplied closure failed; the message is kept verbatim
    #[error("{0}")]
    Action(String),

    /// The verifier was used in a way it does not support
    #[error("usage error: {0}")]
    Usage(String),
}

impl Error {
    /// Create a protocol violation error.
    #[must_use]
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::ProtocolViolation(message.into())
    }

    /// Create an expectation mismatch error.
    #[must_use]
    pub fn mismatch(
        step: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::ExpectationMismatch {
            step: step.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a usage error.
    #[must_use]
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage(message.into())
    }

    /// Returns `true` if this is a [`Error::Timeout`].
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Returns `true` if this is a [`Error::ExpectationMismatch`].
    #[must_use]
    pub fn is_mismatch(&self) -> bool {
        matches!(self, Self::ExpectationMismatch { .. })
    }

    /// Returns `true` if this is a [`Error::ProtocolViolation`].
    #[must_use]
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::ProtocolViolation(_))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
