// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Time datatypes for the sans-I/O core.
//!
//! The embedder supplies every entry point with a [`Timestamp`]: an opaque
//! monotonic instant measured from an arbitrary epoch. Timestamps are only
//! comparable when sourced from the same clock.

use core::{fmt, ops::Add, time::Duration};

/// An absolute point in time.
///
/// Similar to `std::time::Instant`, but constructible from a plain
/// [`Duration`] so that tests and simulations can fabricate clocks.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(Duration);

impl Timestamp {
    pub const fn from_duration(duration: Duration) -> Self {
        Self(duration)
    }

    pub const fn as_duration(self) -> Duration {
        self.0
    }

    /// Returns the duration elapsed since `earlier`, or zero if `earlier`
    /// is in the future.
    #[inline]
    pub fn saturating_duration_since(self, earlier: Self) -> Duration {
        self.0.saturating_sub(earlier.0)
    }

    #[inline]
    pub fn checked_sub(self, duration: Duration) -> Option<Self> {
        self.0.checked_sub(duration).map(Self)
    }

    #[inline]
    pub fn has_elapsed(self, now: Self) -> bool {
        self <= now
    }
}

impl Add<Duration> for Timestamp {
    type Output = Self;

    #[inline]
    fn add(self, duration: Duration) -> Self {
        Self(self.0 + duration)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Timestamp({:?})", self.0)
    }
}

/// A cancellable deadline.
///
/// Mirrors the armed/expired lifecycle the recovery and idle logic need:
/// a timer is armed with a target timestamp, polled against `now`, and
/// cancelled either explicitly or by expiring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Timer {
    deadline: Option<Timestamp>,
}

impl Timer {
    #[inline]
    pub fn set(&mut self, deadline: Timestamp) {
        self.deadline = Some(deadline);
    }

    #[inline]
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    #[inline]
    pub fn deadline(&self) -> Option<Timestamp> {
        self.deadline
    }

    #[inline]
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    #[inline]
    pub fn is_expired(&self, now: Timestamp) -> bool {
        matches!(self.deadline, Some(deadline) if deadline.has_elapsed(now))
    }

    /// Cancels and reports expiry in one step.
    #[inline]
    pub fn poll_expiration(&mut self, now: Timestamp) -> bool {
        if self.is_expired(now) {
            self.deadline = None;
            true
        } else {
            false
        }
    }
}
