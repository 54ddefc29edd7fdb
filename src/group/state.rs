//! Connection state machine and reconnect policy for a subscription group.

use std::time::Duration;

/// What the group last made of its connection.
///
/// This is the *intended* state: the physical channel can drop without the
/// group's involvement, which is exactly the case the disconnect handler
/// repairs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Open,
}

/// Connection state plus the flags that gate the reconnect decision.
///
/// Only ever touched with the group lock held.
#[derive(Clone, Copy, Debug)]
pub(crate) struct LinkState {
    pub connection: ConnectionState,
    /// The current (or most recent) close was requested by the group itself.
    pub close_is_controlled: bool,
    /// The group was disposed and its connection released.
    pub retired: bool,
}

impl LinkState {
    pub fn new() -> Self {
        Self {
            connection: ConnectionState::Closed,
            close_is_controlled: false,
            retired: false,
        }
    }

    /// Whether a disconnect observed now should be repaired by reopening.
    ///
    /// `physically_open` is what the connection itself reports; a channel
    /// that is already back up (a racing Add reopened it) needs nothing.
    pub fn should_reopen(&self, has_members: bool, physically_open: bool) -> bool {
        !self.close_is_controlled
            && !self.retired
            && self.connection == ConnectionState::Open
            && has_members
            && !physically_open
    }
}

/// How the group reacts to an unexpected disconnect.
///
/// The default makes one immediate reopen attempt per disconnect. Bounded
/// retries with exponential backoff can be configured instead; the group lock
/// is not held while waiting between attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Attempts per disconnect, at least one.
    pub max_attempts: u32,
    /// Wait before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound for the doubling backoff.
    pub max_backoff: Duration,
}

impl ReconnectPolicy {
    /// One reopen attempt, no waiting.
    pub fn immediate() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Up to `max_attempts` attempts, doubling the wait from `initial` up to `max`.
    pub fn with_backoff(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff: initial,
            max_backoff: max.max(initial),
        }
    }

    /// Whether another attempt may follow `attempts_made` failed ones.
    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts.max(1)
    }

    /// Wait that follows `current`.
    pub fn next_backoff(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_backoff)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::immediate()
    }
}
