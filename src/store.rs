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

//! Transactional storage boundary.
//!
//! The [`ReservationEngine`](crate::ReservationEngine) talks to storage only
//! through [`ReservationStore`]. Seat counters and booking status change
//! together through [`ReservationStore::commit`], which applies a
//! [`Transaction`] all-or-nothing: either every write lands or none does.
//!
//! A write whose precondition does not hold (stale version, sold out, booking
//! already settled) is a [`Conflict`], not an error: the transaction is
//! dropped and the caller decides whether to retry.
//!
//! [`MemoryStore`] is the in-process implementation used by the binary and
//! the tests.

use crate::base::{BookingId, FlightId, RequestToken, RequesterId};
use crate::booking::{Booking, BookingStatus, FailureReason};
use crate::error::ReservationError;
use crate::faults::{FaultInjector, Failpoint};
use crate::inventory::{Availability, FlightInventory, InventoryStore};
use crate::ledger::BookingLedger;
use chrono::{DateTime, Utc};

/// A single write inside a [`Transaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    /// Take one seat if the flight is still at `expected_version`.
    TryDecrement {
        flight_id: FlightId,
        expected_version: u64,
    },
    /// Give one seat back, if one is claimed.
    Increment { flight_id: FlightId },
    /// Pending → Confirmed.
    MarkConfirmed { booking_id: BookingId },
    /// Pending → Failed.
    MarkFailed {
        booking_id: BookingId,
        reason: FailureReason,
    },
    /// Confirmed → Cancelled.
    MarkCancelled { booking_id: BookingId },
}

impl Write {
    fn flight_id(&self) -> Option<FlightId> {
        match self {
            Self::TryDecrement { flight_id, .. } | Self::Increment { flight_id } => Some(*flight_id),
            _ => None,
        }
    }

    fn booking_id(&self) -> Option<BookingId> {
        match self {
            Self::MarkConfirmed { booking_id }
            | Self::MarkFailed { booking_id, .. }
            | Self::MarkCancelled { booking_id } => Some(*booking_id),
            _ => None,
        }
    }
}

/// Ordered batch of writes committed as one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    writes: Vec<Write>,
}

impl Transaction {
    pub fn new() -> Self {
        Self { writes: Vec::new() }
    }

    pub fn try_decrement(mut self, flight_id: FlightId, expected_version: u64) -> Self {
        self.writes.push(Write::TryDecrement {
            flight_id,
            expected_version,
        });
        self
    }

    pub fn increment(mut self, flight_id: FlightId) -> Self {
        self.writes.push(Write::Increment { flight_id });
        self
    }

    pub fn mark_confirmed(mut self, booking_id: BookingId) -> Self {
        self.writes.push(Write::MarkConfirmed { booking_id });
        self
    }

    pub fn mark_failed(mut self, booking_id: BookingId, reason: FailureReason) -> Self {
        self.writes.push(Write::MarkFailed { booking_id, reason });
        self
    }

    pub fn mark_cancelled(mut self, booking_id: BookingId) -> Self {
        self.writes.push(Write::MarkCancelled { booking_id });
        self
    }

    pub fn writes(&self) -> &[Write] {
        &self.writes
    }
}

/// Why a transaction was not applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
    /// Someone changed the flight after it was read.
    VersionMismatch {
        flight_id: FlightId,
        expected: u64,
        actual: u64,
    },
    /// No seat left.
    SoldOut { flight_id: FlightId },
    /// The booking was settled by someone else.
    NotPending {
        booking_id: BookingId,
        status: BookingStatus,
    },
    /// Every seat on the flight is already available.
    Full { flight_id: FlightId },
    /// Only confirmed bookings can be cancelled.
    NotConfirmed {
        booking_id: BookingId,
        status: BookingStatus,
    },
}

/// State of everything a committed transaction touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub flights: Vec<FlightInventory>,
    pub bookings: Vec<Booking>,
}

impl Receipt {
    pub fn booking(&self, booking_id: BookingId) -> Option<&Booking> {
        self.bookings.iter().find(|booking| booking.id == booking_id)
    }
}

/// Outcome of [`ReservationStore::commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Commit {
    Applied(Receipt),
    Conflict(Conflict),
}

/// Storage the reservation engine runs against.
///
/// Implementations must make `create_pending` an atomic unique insert on
/// `(requester, token)` and `commit` an atomic all-or-nothing update. The
/// engine relies on nothing else for correctness; in particular it holds no
/// locks of its own, so several engines may share one store.
pub trait ReservationStore: Send + Sync {
    /// # Errors
    ///
    /// [`ReservationError::NotFound`] if the flight is unknown.
    fn get_availability(&self, flight_id: FlightId) -> Result<Availability, ReservationError>;

    /// # Errors
    ///
    /// [`ReservationError::NotFound`] if the flight is unknown,
    /// [`ReservationError::DuplicateRequest`] if an active booking holds the token.
    fn create_pending(
        &self,
        flight_id: FlightId,
        requester_id: RequesterId,
        token: RequestToken,
    ) -> Result<Booking, ReservationError>;

    fn booking(&self, booking_id: BookingId) -> Result<Option<Booking>, ReservationError>;

    fn find_by_token(
        &self,
        requester_id: RequesterId,
        token: &RequestToken,
    ) -> Result<Option<Booking>, ReservationError>;

    /// Pending bookings last updated before `cutoff`.
    fn stale_pending(&self, cutoff: DateTime<Utc>) -> Result<Vec<Booking>, ReservationError>;

    fn commit(&self, transaction: Transaction) -> Result<Commit, ReservationError>;
}

/// In-memory [`ReservationStore`] with failure injection.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inventory: InventoryStore,
    ledger: BookingLedger,
    faults: FaultInjector,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inventory: InventoryStore::new(),
            ledger: BookingLedger::new(),
            faults: FaultInjector::new(),
        }
    }

    /// Adds a flight; returns `false` if the ID is taken.
    pub fn register_flight(&self, flight_id: FlightId, total_seats: u32) -> bool {
        self.inventory.register(flight_id, total_seats)
    }

    pub fn inventory(&self) -> &InventoryStore {
        &self.inventory
    }

    pub fn ledger(&self) -> &BookingLedger {
        &self.ledger
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }
}

impl ReservationStore for MemoryStore {
    fn get_availability(&self, flight_id: FlightId) -> Result<Availability, ReservationError> {
        self.faults.check(Failpoint::GetAvailability)?;
        self.inventory.get_availability(flight_id)
    }

    fn create_pending(
        &self,
        flight_id: FlightId,
        requester_id: RequesterId,
        token: RequestToken,
    ) -> Result<Booking, ReservationError> {
        self.faults.check(Failpoint::CreatePending)?;
        self.inventory.handle(flight_id)?;
        self.ledger.create_pending(flight_id, requester_id, token)
    }

    fn booking(&self, booking_id: BookingId) -> Result<Option<Booking>, ReservationError> {
        Ok(self.ledger.get(booking_id))
    }

    fn find_by_token(
        &self,
        requester_id: RequesterId,
        token: &RequestToken,
    ) -> Result<Option<Booking>, ReservationError> {
        Ok(self.ledger.find_by_token(requester_id, token))
    }

    fn stale_pending(&self, cutoff: DateTime<Utc>) -> Result<Vec<Booking>, ReservationError> {
        Ok(self.ledger.stale_pending(cutoff))
    }

    /// Locks every flight, then every booking, each in ascending ID order,
    /// stages the writes on copies and only then writes the copies back.
    fn commit(&self, transaction: Transaction) -> Result<Commit, ReservationError> {
        self.faults.check(Failpoint::BeforeCommit)?;

        let mut flight_ids: Vec<_> = transaction.writes().iter().filter_map(Write::flight_id).collect();
        flight_ids.sort_unstable();
        flight_ids.dedup();
        let mut booking_ids: Vec<_> = transaction
            .writes()
            .iter()
            .filter_map(Write::booking_id)
            .collect();
        booking_ids.sort_unstable();
        booking_ids.dedup();

        let flight_handles = flight_ids
            .iter()
            .map(|flight_id| self.inventory.handle(*flight_id))
            .collect::<Result<Vec<_>, _>>()?;
        let booking_handles = booking_ids
            .iter()
            .map(|booking_id| self.ledger.handle(*booking_id))
            .collect::<Result<Vec<_>, _>>()?;

        let mut flight_guards: Vec<_> = flight_handles.iter().map(|handle| handle.lock()).collect();
        let mut booking_guards: Vec<_> = booking_handles.iter().map(|handle| handle.lock()).collect();

        let mut flights: Vec<FlightInventory> =
            flight_guards.iter().map(|guard| (**guard).clone()).collect();
        let mut bookings: Vec<Booking> =
            booking_guards.iter().map(|guard| (**guard).clone()).collect();
        let now = Utc::now();

        for write in transaction.writes() {
            let staged = match *write {
                Write::TryDecrement {
                    flight_id,
                    expected_version,
                } => {
                    let flight = staged_flight(&mut flights, flight_id)?;
                    let result = flight.try_decrement(expected_version).map(|_| ());
                    if result.is_ok() {
                        // Returning here drops the staged copies: nothing was written.
                        self.faults.check(Failpoint::AfterDecrement)?;
                    }
                    result
                }
                Write::Increment { flight_id } => {
                    staged_flight(&mut flights, flight_id)?.increment().map(|_| ())
                }
                Write::MarkConfirmed { booking_id } => staged_booking(&mut bookings, booking_id)?
                    .confirm(now)
                    .map_err(|status| Conflict::NotPending { booking_id, status }),
                Write::MarkFailed { booking_id, reason } => {
                    staged_booking(&mut bookings, booking_id)?
                        .fail(reason, now)
                        .map_err(|status| Conflict::NotPending { booking_id, status })
                }
                Write::MarkCancelled { booking_id } => staged_booking(&mut bookings, booking_id)?
                    .cancel(now)
                    .map_err(|status| Conflict::NotConfirmed { booking_id, status }),
            };
            if let Err(conflict) = staged {
                return Ok(Commit::Conflict(conflict));
            }
        }

        for (guard, flight) in flight_guards.iter_mut().zip(&flights) {
            **guard = flight.clone();
        }
        for (guard, booking) in booking_guards.iter_mut().zip(&bookings) {
            if booking.status == BookingStatus::Failed && guard.status != BookingStatus::Failed {
                self.ledger.release_token(booking);
            }
            **guard = booking.clone();
        }

        Ok(Commit::Applied(Receipt { flights, bookings }))
    }
}

fn staged_flight(
    flights: &mut [FlightInventory],
    flight_id: FlightId,
) -> Result<&mut FlightInventory, ReservationError> {
    flights
        .iter_mut()
        .find(|flight| flight.flight_id() == flight_id)
        .ok_or(ReservationError::NotFound)
}

fn staged_booking(
    bookings: &mut [Booking],
    booking_id: BookingId,
) -> Result<&mut Booking, ReservationError> {
    bookings
        .iter_mut()
        .find(|booking| booking.id == booking_id)
        .ok_or(ReservationError::BookingNotFound)
}
