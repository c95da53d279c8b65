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

//! Error types for seat reservation.

use thiserror::Error;

/// Reservation errors.
///
/// `NotFound`, `SeatsExhausted` and `DuplicateRequest` are definitive outcomes.
/// `Contention` and `StorageFailure` are transient: the caller should retry with
/// the same request token.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReservationError {
    /// Flight does not exist
    #[error("flight not found")]
    NotFound,

    /// No seat left on the flight
    #[error("no seats available")]
    SeatsExhausted,

    /// Request token already used for a different booking
    #[error("request token already used for another booking")]
    DuplicateRequest,

    /// Retry budget exhausted while racing other bookings
    #[error("too much contention, retry later")]
    Contention,

    /// The underlying store failed
    #[error("storage failure: {0}")]
    StorageFailure(String),

    /// Referenced booking ID does not exist
    #[error("booking not found")]
    BookingNotFound,

    /// Booking is not in a state that can be cancelled
    #[error("booking cannot be cancelled")]
    NotCancellable,
}

impl ReservationError {
    /// Whether a caller may retry the same request (with the same token).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Contention | Self::StorageFailure(_))
    }
}

#[cfg(test)]
mod tests {
    use super::ReservationError;

    #[test]
    fn error_display_messages() {
        assert_eq!(ReservationError::NotFound.to_string(), "flight not found");
        assert_eq!(ReservationError::SeatsExhausted.to_string(), "no seats available");
        assert_eq!(
            ReservationError::DuplicateRequest.to_string(),
            "request token already used for another booking"
        );
        assert_eq!(
            ReservationError::Contention.to_string(),
            "too much contention, retry later"
        );
        assert_eq!(
            ReservationError::StorageFailure("disk gone".into()).to_string(),
            "storage failure: disk gone"
        );
        assert_eq!(ReservationError::BookingNotFound.to_string(), "booking not found");
        assert_eq!(
            ReservationError::NotCancellable.to_string(),
            "booking cannot be cancelled"
        );
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(ReservationError::Contention.is_retryable());
        assert!(ReservationError::StorageFailure("timeout".into()).is_retryable());

        assert!(!ReservationError::NotFound.is_retryable());
        assert!(!ReservationError::SeatsExhausted.is_retryable());
        assert!(!ReservationError::DuplicateRequest.is_retryable());
        assert!(!ReservationError::BookingNotFound.is_retryable());
        assert!(!ReservationError::NotCancellable.is_retryable());
    }
}
