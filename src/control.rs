//! Global tracking mode and its single-character control surface
//!
//! The engine accepts the same control protocol the delay statistics file
//! uses: writing `0` disables tracking entirely, `1` enables tracking for a
//! task's own domain only, and `2` additionally propagates every transition
//! up the ancestor chain. Anything else is rejected without a state change.

use crate::error::DelayError;
use serde::Serialize;

/// How much delay accounting is performed for newly observed tasks
///
/// Tasks latch the mode in effect when they first leave the base state and
/// keep it until they return there, so flipping the mode never affects a
/// task mid-delay (see `tracker`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum TrackingMode {
    /// No counters or totals are touched.
    Disabled = 0,
    /// Transitions update the task's own domain only.
    Local = 1,
    /// Transitions update the task's domain and every ancestor.
    Hierarchical = 2,
}

impl TrackingMode {
    /// Parse a control directive as written to a control file
    ///
    /// Accepts exactly the characters `0`, `1` and `2`, with surrounding
    /// whitespace tolerated (an `echo 1 > ...` style write carries a trailing
    /// newline). Any other input is an error and must leave the previous
    /// mode in place.
    ///
    /// # Example
    ///
    /// ```
    /// use demora::control::TrackingMode;
    ///
    /// assert_eq!(TrackingMode::parse("2\n").unwrap(), TrackingMode::Hierarchical);
    /// assert!(TrackingMode::parse("3").is_err());
    /// ```
    pub fn parse(input: &str) -> Result<Self, DelayError> {
        match input.trim() {
            "0" => Ok(TrackingMode::Disabled),
            "1" => Ok(TrackingMode::Local),
            "2" => Ok(TrackingMode::Hierarchical),
            _ => Err(DelayError::InvalidControl(input.to_string())),
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TrackingMode::Disabled,
            1 => TrackingMode::Local,
            _ => TrackingMode::Hierarchical,
        }
    }

    /// Whether any accounting happens at all under this mode
    pub fn is_enabled(self) -> bool {
        self != TrackingMode::Disabled
    }

    /// Whether ancestor domains are updated under this mode
    pub fn is_hierarchical(self) -> bool {
        self == TrackingMode::Hierarchical
    }
}
