//! # Dispatch Mode
//!
//! One-way, first-use-wins selection between pull and push consumption.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::errors::{FeedError, FeedResult};

/// Consumption discipline of a feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// No consumer has touched the feed yet
    Unset,
    /// Records are requested explicitly with `pull()`
    Pull,
    /// Records are delivered to listeners or a `for_each` visitor
    Push,
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchMode::Unset => write!(f, "unset"),
            DispatchMode::Pull => write!(f, "pull"),
            DispatchMode::Push => write!(f, "push"),
        }
    }
}

/// Mode tag held by a feed.
///
/// Checked synchronously before any suspension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeController {
    mode: DispatchMode,
}

impl Default for ModeController {
    fn default() -> Self {
        Self::new()
    }
}

impl ModeController {
    /// Create an unset controller
    pub fn new() -> Self {
        Self {
            mode: DispatchMode::Unset,
        }
    }

    /// Current mode
    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Lock the controller into `requested` on behalf of `operation`, or
    /// fail if the other mode won.
    ///
    /// Returns true when this call performed the transition out of `Unset`.
    pub fn claim(&mut self, requested: DispatchMode, operation: &str) -> FeedResult<bool> {
        debug_assert_ne!(requested, DispatchMode::Unset);
        match self.mode {
            DispatchMode::Unset => {
                self.mode = requested;
                Ok(true)
            }
            current if current == requested => Ok(false),
            current => Err(FeedError::mode_conflict(current, operation)),
        }
    }
}
