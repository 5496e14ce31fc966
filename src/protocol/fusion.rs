//! Fusion mode bitmask.

use std::fmt;
use std::ops::{BitAnd, BitOr};

/// A bitmask of pull-based delivery modes a queue subscription may offer.
///
/// A consumer asks for a set of modes with
/// [`QueueSubscription::request_fusion`](super::QueueSubscription::request_fusion)
/// and the producer answers with the single mode it agrees to, or
/// [`FusionMode::NONE`] to stay on push delivery.
///
/// # Example
///
/// ```rust
/// use stepverify::protocol::FusionMode;
///
/// let requested = FusionMode::SYNC | FusionMode::ASYNC;
/// assert_eq!(requested, FusionMode::ANY);
/// assert!(requested.contains(FusionMode::SYNC));
/// assert_eq!(requested.to_string(), "SYNC|ASYNC");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FusionMode(u8);

impl FusionMode {
    /// No fusion: values are pushed through `on_next`.
    pub const NONE: Self = Self(0);
    /// Values are pulled until the queue reports empty, which means completion.
    pub const SYNC: Self = Self(0b001);
    /// Values are pulled after the producer signals availability.
    pub const ASYNC: Self = Self(0b010);
    /// Either synchronous or asynchronous fusion.
    pub const ANY: Self = Self(0b011);
    /// Marker: the consumer polls from a different thread than the producer.
    pub const THREAD_BARRIER: Self = Self(0b100);

    /// Returns the raw bits.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Builds a mode from raw bits, dropping unknown ones.
    #[must_use]
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & 0b111)
    }

    /// Returns `true` if no mode bit is set.
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if `self` and `other` share at least one bit.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Removes the thread-barrier marker, keeping only delivery modes.
    #[must_use]
    pub const fn without_barrier(self) -> Self {
        Self(self.0 & Self::ANY.0)
    }
}

impl BitOr for FusionMode {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for FusionMode {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Display for FusionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return f.write_str("NONE");
        }
        let names = [
            (Self::SYNC, "SYNC"),
            (Self::ASYNC, "ASYNC"),
            (Self::THREAD_BARRIER, "THREAD_BARRIER"),
        ];
        let mut first = true;
        for (mode, name) in names {
            if self.contains(mode) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(FusionMode::NONE.to_string(), "NONE");
        assert_eq!(FusionMode::SYNC.to_string(), "SYNC");
        assert_eq!(
            (FusionMode::ASYNC | FusionMode::THREAD_BARRIER).to_string(),
            "ASYNC|THREAD_BARRIER"
        );
    }

    #[test]
    fn test_masks() {
        let requested = FusionMode::ANY | FusionMode::THREAD_BARRIER;
        assert!(requested.intersects(FusionMode::ASYNC));
        assert_eq!(requested.without_barrier(), FusionMode::ANY);
        assert!(!FusionMode::SYNC.intersects(FusionMode::ASYNC));
        assert_eq!(FusionMode::from_bits_truncate(0xff), requested);
    }
}
