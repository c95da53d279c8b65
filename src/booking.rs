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

//! Booking records.
//!
//! Bookings follow a state machine:
//! - [`Pending`] → [`Confirmed`] (seat taken) or [`Failed`] (no seat taken)
//! - [`Confirmed`] → [`Cancelled`] (seat released)
//!
//! [`Pending`]: BookingStatus::Pending
//! [`Confirmed`]: BookingStatus::Confirmed
//! [`Failed`]: BookingStatus::Failed
//! [`Cancelled`]: BookingStatus::Cancelled

use crate::base::{BookingId, FlightId, RequestToken, RequesterId};
use crate::error::ReservationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Failed,
}

impl BookingStatus {
    /// Active bookings hold their request token; failed ones give it back.
    pub fn is_active(self) -> bool {
        self != Self::Failed
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a booking ended up [`BookingStatus::Failed`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The flight was sold out.
    NoSeatsAvailable,
    /// Lost the race for a seat too many times.
    Contention,
    /// The store kept failing during settlement.
    StorageFailure,
    /// Left pending past the timeout and resolved by reconciliation.
    Abandoned,
}

impl FailureReason {
    /// The error reported to a caller whose booking failed for this reason.
    pub fn to_error(self) -> ReservationError {
        match self {
            Self::NoSeatsAvailable => ReservationError::SeatsExhausted,
            Self::Contention => ReservationError::Contention,
            Self::StorageFailure => {
                ReservationError::StorageFailure("booking settlement failed".into())
            }
            Self::Abandoned => ReservationError::StorageFailure("pending booking abandoned".into()),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoSeatsAvailable => "no_seats_available",
            Self::Contention => "contention",
            Self::StorageFailure => "storage_failure",
            Self::Abandoned => "abandoned",
        };
        f.write_str(name)
    }
}

/// A durable record of one seat claim by one requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    /// Position in the ledger, in creation order.
    pub seq: u64,
    pub flight_id: FlightId,
    pub requester_id: RequesterId,
    pub request_token: RequestToken,
    pub status: BookingStatus,
    pub failure_reason: Option<FailureReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub(crate) fn pending(
        seq: u64,
        flight_id: FlightId,
        requester_id: RequesterId,
        request_token: RequestToken,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: BookingId::generate(),
            seq,
            flight_id,
            requester_id,
            request_token,
            status: BookingStatus::Pending,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    // Strict transitions. On rejection the current status is returned so the
    // caller can tell a concurrent settlement from a bad request.

    pub(crate) fn confirm(&mut self, now: DateTime<Utc>) -> Result<(), BookingStatus> {
        self.transition(BookingStatus::Pending, BookingStatus::Confirmed, now)
    }

    pub(crate) fn fail(
        &mut self,
        reason: FailureReason,
        now: DateTime<Utc>,
    ) -> Result<(), BookingStatus> {
        self.transition(BookingStatus::Pending, BookingStatus::Failed, now)?;
        self.failure_reason = Some(reason);
        Ok(())
    }

    pub(crate) fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), BookingStatus> {
        self.transition(BookingStatus::Confirmed, BookingStatus::Cancelled, now)
    }

    fn transition(
        &mut self,
        from: BookingStatus,
        to: BookingStatus,
        now: DateTime<Utc>,
    ) -> Result<(), BookingStatus> {
        if self.status != from {
            return Err(self.status);
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }
}
