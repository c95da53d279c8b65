// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Failure injection for the in-memory store.
//!
//! A [`FaultInjector`] holds a countdown per [`Failpoint`]. While a countdown
//! is above zero, every pass through that point fails with
//! [`ReservationError::StorageFailure`] and the countdown drops by one.
//!
//! ```text
//! create_pending ─► get_availability ─► commit: [ BeforeCommit ─► write ─► AfterDecrement ─► write ... ]
//!       ↑                  ↑                          ↑                         ↑
//!  CreatePending     GetAvailability             BeforeCommit             AfterDecrement
//! ```

use crate::error::ReservationError;
use dashmap::DashMap;

/// Points in the store where a storage fault can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Failpoint {
    /// Fail before the pending booking is recorded.
    CreatePending,
    /// Fail the availability read.
    GetAvailability,
    /// Fail a transaction before any of its writes are applied.
    BeforeCommit,
    /// Fail a transaction after its seat decrement was staged but before the
    /// writes that follow it.
    AfterDecrement,
}

/// Countdown of injected faults per failpoint. Disarmed by default.
#[derive(Debug, Default)]
pub struct FaultInjector {
    remaining: DashMap<Failpoint, u32>,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self {
            remaining: DashMap::new(),
        }
    }

    /// Makes the next `times` passes through `point` fail.
    pub fn arm(&self, point: Failpoint, times: u32) {
        self.remaining.insert(point, times);
    }

    /// Makes every pass through `point` fail until disarmed.
    pub fn arm_always(&self, point: Failpoint) {
        self.arm(point, u32::MAX);
    }

    pub fn disarm(&self, point: Failpoint) {
        self.remaining.remove(&point);
    }

    pub fn disarm_all(&self) {
        self.remaining.clear();
    }

    /// Faults still pending at `point`.
    pub fn remaining(&self, point: Failpoint) -> u32 {
        self.remaining.get(&point).map_or(0, |entry| *entry.value())
    }

    /// Passes through `point`, failing if it is armed.
    pub fn check(&self, point: Failpoint) -> Result<(), ReservationError> {
        let Some(mut remaining) = self.remaining.get_mut(&point) else {
            return Ok(());
        };
        match *remaining {
            0 => Ok(()),
            u32::MAX => Err(Self::fault(point)),
            _ => {
                *remaining -= 1;
                Err(Self::fault(point))
            }
        }
    }

    fn fault(point: Failpoint) -> ReservationError {
        ReservationError::StorageFailure(format!("injected fault at {point:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disarmed_points_pass() {
        let faults = FaultInjector::new();
        assert_eq!(faults.check(Failpoint::BeforeCommit), Ok(()));
    }

    #[test]
    fn armed_point_fails_the_configured_number_of_times() {
        let faults = FaultInjector::new();
        faults.arm(Failpoint::AfterDecrement, 2);

        assert!(faults.check(Failpoint::AfterDecrement).is_err());
        assert_eq!(faults.remaining(Failpoint::AfterDecrement), 1);
        assert!(faults.check(Failpoint::AfterDecrement).is_err());
        assert_eq!(faults.check(Failpoint::AfterDecrement), Ok(()));
        // Other points are unaffected.
        assert_eq!(faults.check(Failpoint::BeforeCommit), Ok(()));
    }

    #[test]
    fn always_armed_point_keeps_failing_until_disarmed() {
        let faults = FaultInjector::new();
        faults.arm_always(Failpoint::CreatePending);
        for _ in 0..10 {
            assert!(faults.check(Failpoint::CreatePending).is_err());
        }

        faults.disarm(Failpoint::CreatePending);
        assert_eq!(faults.check(Failpoint::CreatePending), Ok(()));
    }

    #[test]
    fn injected_faults_are_storage_failures() {
        let faults = FaultInjector::new();
        faults.arm(Failpoint::GetAvailability, 1);

        let error = faults.check(Failpoint::GetAvailability).unwrap_err();
        assert!(matches!(error, ReservationError::StorageFailure(_)));
        assert!(error.is_retryable());
    }
}
