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

//! Seat reservation engine.
//!
//! The [`ReservationEngine`] claims seats and records bookings against a
//! [`ReservationStore`]. It keeps no state of its own: every guarantee comes
//! from the store's unique token index and its all-or-nothing commits, so any
//! number of engines on any number of threads may share one store.
//!
//! # Booking
//!
//! ```text
//! Start ──record──► Pending ──claim seat──► Confirmed
//!                      │
//!                      └──sold out / retries spent──► Failed
//! ```
//!
//! - **Replay**: a token whose booking is Confirmed returns that booking unchanged.
//! - **Resume**: a token whose booking is still Pending settles that booking
//!   instead of recording a second one.
//! - **Claim**: the seat decrement (compare-and-swap on the flight version) and
//!   the Pending → Confirmed flip are one transaction.
//! - **Retry**: a lost compare-and-swap or a storage fault is retried with
//!   backoff, up to [`RetryPolicy::max_attempts`](crate::RetryPolicy).
//!
//! # Cancellation
//!
//! Confirmed → Cancelled and the seat release are one transaction. Cancelling
//! twice is a no-op.
//!
//! # Reconciliation
//!
//! A booking left Pending by a crash or a storage fault holds its token until
//! [`ReservationEngine::reconcile`] fails it after the pending timeout. No seat
//! is released, since a Pending booking never took one.

use crate::base::{BookingId, FlightId, RequestToken, RequesterId};
use crate::booking::{Booking, BookingStatus, FailureReason};
use crate::error::ReservationError;
use crate::inventory::Availability;
use crate::settings::EngineConfig;
use crate::store::{Commit, Conflict, MemoryStore, ReservationStore, Transaction};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

/// Rounds of lookup-then-insert before giving up on a token that keeps
/// changing hands.
const OPEN_ROUNDS: usize = 3;

/// Books and cancels seats against a [`ReservationStore`].
///
/// # Invariants
///
/// - A seat decrement is never applied without its booking turning Confirmed.
/// - A seat increment is never applied without its booking turning Cancelled.
/// - At most one non-Failed booking exists per `(requester, token)`.
/// - Every booking this engine records is settled before `book` returns,
///   unless the store failed while settling it.
pub struct ReservationEngine<S = MemoryStore> {
    store: S,
    config: EngineConfig,
}

impl ReservationEngine<MemoryStore> {
    /// Creates an engine over an empty in-memory store with default settings.
    pub fn new() -> Self {
        Self::with_store(MemoryStore::new(), EngineConfig::default())
    }

    /// Adds a flight with `total_seats` available seats.
    ///
    /// Returns `false` if the flight already exists.
    pub fn register_flight(&self, flight_id: FlightId, total_seats: u32) -> bool {
        self.store.register_flight(flight_id, total_seats)
    }
}

impl Default for ReservationEngine<MemoryStore> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ReservationStore> ReservationEngine<S> {
    pub fn with_store(store: S, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Claims one seat on `flight_id` for `requester_id`.
    ///
    /// Calling again with the same token returns the same booking and takes no
    /// further seat. Without a token one is generated, and a retried call will
    /// book a second seat.
    ///
    /// # Errors
    ///
    /// - [`ReservationError::NotFound`] - Unknown flight, nothing recorded.
    /// - [`ReservationError::SeatsExhausted`] - Sold out, booking recorded as Failed.
    /// - [`ReservationError::DuplicateRequest`] - Token already used for another
    ///   flight or for a booking since cancelled.
    /// - [`ReservationError::Contention`] - Retry budget spent racing other bookings.
    /// - [`ReservationError::StorageFailure`] - The store kept failing. The booking
    ///   is Failed, or still Pending and left for [`reconcile`](Self::reconcile).
    #[instrument(skip_all, fields(flight = %flight_id, requester = %requester_id))]
    pub fn book(
        &self,
        flight_id: FlightId,
        requester_id: RequesterId,
        token: Option<RequestToken>,
    ) -> Result<Booking, ReservationError> {
        let token = token.unwrap_or_else(|| {
            let token = RequestToken::generate();
            warn!(%token, "no request token supplied, retries of this request will not be deduplicated");
            token
        });

        let booking = self.open_booking(flight_id, requester_id, token)?;
        if booking.status == BookingStatus::Confirmed {
            debug!(booking = %booking.id, "replaying confirmed booking");
            return Ok(booking);
        }
        self.settle(booking)
    }

    /// Releases the seat held by a confirmed booking.
    ///
    /// # Errors
    ///
    /// - [`ReservationError::BookingNotFound`] - Unknown booking.
    /// - [`ReservationError::NotCancellable`] - Booking is Pending or Failed.
    /// - [`ReservationError::StorageFailure`] - Nothing changed, safe to retry.
    #[instrument(skip(self))]
    pub fn cancel(&self, booking_id: BookingId) -> Result<Booking, ReservationError> {
        let booking = self
            .store
            .booking(booking_id)?
            .ok_or(ReservationError::BookingNotFound)?;
        match booking.status {
            BookingStatus::Cancelled => {
                debug!("booking already cancelled");
                return Ok(booking);
            }
            BookingStatus::Pending | BookingStatus::Failed => {
                return Err(ReservationError::NotCancellable);
            }
            BookingStatus::Confirmed => {}
        }

        let release = Transaction::new()
            .mark_cancelled(booking_id)
            .increment(booking.flight_id);
        match self.store.commit(release)? {
            Commit::Applied(receipt) => {
                info!(flight = %booking.flight_id, "booking cancelled, seat released");
                receipt
                    .booking(booking_id)
                    .cloned()
                    .ok_or(ReservationError::BookingNotFound)
            }
            // Someone else cancelled it in the meantime.
            Commit::Conflict(Conflict::NotConfirmed {
                status: BookingStatus::Cancelled,
                ..
            }) => self
                .store
                .booking(booking_id)?
                .ok_or(ReservationError::BookingNotFound),
            Commit::Conflict(_) => Err(ReservationError::NotCancellable),
        }
    }

    /// Cancels the booking a requester made under `token`.
    ///
    /// # Errors
    ///
    /// [`ReservationError::BookingNotFound`] if no active booking holds the token,
    /// otherwise as [`cancel`](Self::cancel).
    pub fn cancel_by_token(
        &self,
        requester_id: RequesterId,
        token: &RequestToken,
    ) -> Result<Booking, ReservationError> {
        let booking = self
            .store
            .find_by_token(requester_id, token)?
            .ok_or(ReservationError::BookingNotFound)?;
        self.cancel(booking.id)
    }

    /// Fails every booking left Pending longer than the configured timeout.
    ///
    /// Returns how many bookings were resolved.
    ///
    /// # Errors
    ///
    /// A storage fault on one booking does not stop the pass; the first fault
    /// is returned once every stale booking has been tried.
    pub fn reconcile(&self) -> Result<usize, ReservationError> {
        self.reconcile_at(Utc::now())
    }

    /// [`reconcile`](Self::reconcile) as if the current time were `now`.
    pub fn reconcile_at(&self, now: DateTime<Utc>) -> Result<usize, ReservationError> {
        let cutoff = now - self.config.pending_timeout();
        let mut resolved = 0;
        let mut first_fault = None;
        for booking in self.store.stale_pending(cutoff)? {
            let abandon = Transaction::new().mark_failed(booking.id, FailureReason::Abandoned);
            match self.store.commit(abandon) {
                Ok(Commit::Applied(_)) => {
                    resolved += 1;
                    info!(booking = %booking.id, flight = %booking.flight_id, "abandoned pending booking failed");
                }
                Ok(Commit::Conflict(_)) => {
                    debug!(booking = %booking.id, "booking settled before reconciliation");
                }
                Err(error) => {
                    warn!(booking = %booking.id, %error, "could not fail abandoned booking");
                    first_fault.get_or_insert(error);
                }
            }
        }
        match first_fault {
            Some(error) => Err(error),
            None => Ok(resolved),
        }
    }

    pub fn availability(&self, flight_id: FlightId) -> Result<Availability, ReservationError> {
        self.store.get_availability(flight_id)
    }

    pub fn booking(&self, booking_id: BookingId) -> Result<Option<Booking>, ReservationError> {
        self.store.booking(booking_id)
    }

    pub fn find_booking(
        &self,
        requester_id: RequesterId,
        token: &RequestToken,
    ) -> Result<Option<Booking>, ReservationError> {
        self.store.find_by_token(requester_id, token)
    }

    /// Returns the booking to settle for this token: the existing one if the
    /// token is in use, otherwise a freshly recorded Pending booking.
    fn open_booking(
        &self,
        flight_id: FlightId,
        requester_id: RequesterId,
        token: RequestToken,
    ) -> Result<Booking, ReservationError> {
        for _ in 0..OPEN_ROUNDS {
            if let Some(existing) = self.store.find_by_token(requester_id, &token)? {
                if existing.flight_id != flight_id {
                    return Err(ReservationError::DuplicateRequest);
                }
                match existing.status {
                    BookingStatus::Confirmed => return Ok(existing),
                    BookingStatus::Pending => {
                        debug!(booking = %existing.id, "resuming pending booking");
                        return Ok(existing);
                    }
                    BookingStatus::Cancelled => return Err(ReservationError::DuplicateRequest),
                    // Failed just now; its token is free again.
                    BookingStatus::Failed => {}
                }
            }

            match self
                .store
                .create_pending(flight_id, requester_id, token.clone())
            {
                Ok(booking) => {
                    debug!(booking = %booking.id, "pending booking recorded");
                    return Ok(booking);
                }
                // A concurrent request with the same token got there first.
                Err(ReservationError::DuplicateRequest) => continue,
                Err(error) => return Err(error),
            }
        }
        Err(ReservationError::Contention)
    }

    /// Drives a Pending booking to Confirmed or Failed.
    fn settle(&self, booking: Booking) -> Result<Booking, ReservationError> {
        let policy = &self.config.retry;
        let attempts = policy.max_attempts.max(1);
        let mut last_was_fault = false;

        for attempt in 0..attempts {
            if attempt > 0 {
                policy.wait(attempt - 1);
            }

            let availability = match self.store.get_availability(booking.flight_id) {
                Ok(availability) => availability,
                Err(ReservationError::StorageFailure(cause)) => {
                    warn!(attempt, %cause, "availability read failed");
                    last_was_fault = true;
                    continue;
                }
                Err(error) => return Err(error),
            };
            if availability.available_seats == 0 {
                return self.fail(&booking, FailureReason::NoSeatsAvailable);
            }

            let claim = Transaction::new()
                .try_decrement(booking.flight_id, availability.version)
                .mark_confirmed(booking.id);
            match self.store.commit(claim) {
                Ok(Commit::Applied(receipt)) => {
                    info!(booking = %booking.id, attempt, "booking confirmed");
                    return receipt
                        .booking(booking.id)
                        .cloned()
                        .ok_or(ReservationError::BookingNotFound);
                }
                Ok(Commit::Conflict(Conflict::NotPending { .. })) => {
                    return self.settled_elsewhere(booking.id);
                }
                Ok(Commit::Conflict(conflict)) => {
                    debug!(attempt, ?conflict, "lost the race for a seat");
                    last_was_fault = false;
                }
                Err(ReservationError::StorageFailure(cause)) => {
                    warn!(attempt, %cause, "seat claim failed");
                    last_was_fault = true;
                }
                Err(error) => return Err(error),
            }
        }

        warn!(booking = %booking.id, attempts, "retry budget exhausted");
        let reason = if last_was_fault {
            FailureReason::StorageFailure
        } else {
            FailureReason::Contention
        };
        self.fail(&booking, reason)
    }

    /// Records the booking as Failed and returns the caller-facing error.
    ///
    /// If the store fails here the booking stays Pending and the storage error
    /// is returned; reconciliation picks it up later.
    fn fail(&self, booking: &Booking, reason: FailureReason) -> Result<Booking, ReservationError> {
        let outcome = self
            .store
            .commit(Transaction::new().mark_failed(booking.id, reason))
            .inspect_err(|error| {
                warn!(booking = %booking.id, %error, "could not record failure, booking left pending");
            })?;
        match outcome {
            Commit::Applied(_) => {
                info!(booking = %booking.id, %reason, "booking failed");
                Err(reason.to_error())
            }
            Commit::Conflict(_) => self.settled_elsewhere(booking.id),
        }
    }

    /// Outcome of a booking that another caller settled first.
    fn settled_elsewhere(&self, booking_id: BookingId) -> Result<Booking, ReservationError> {
        let booking = self
            .store
            .booking(booking_id)?
            .ok_or(ReservationError::BookingNotFound)?;
        match booking.status {
            BookingStatus::Confirmed => Ok(booking),
            BookingStatus::Failed => Err(booking
                .failure_reason
                .map_or(ReservationError::Contention, FailureReason::to_error)),
            BookingStatus::Cancelled => Err(ReservationError::DuplicateRequest),
            BookingStatus::Pending => Err(ReservationError::Contention),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::faults::Failpoint;
    use crate::retry::RetryPolicy;
    use crate::store::MemoryStore;

    fn engine_with_flight(seats: u32) -> ReservationEngine {
        let config = EngineConfig {
            retry: RetryPolicy::immediate(5),
            ..EngineConfig::default()
        };
        let engine = ReservationEngine::with_store(MemoryStore::new(), config);
        engine.register_flight(FlightId(42), seats);
        engine
    }

    fn token(value: &str) -> Option<RequestToken> {
        Some(RequestToken::from(value))
    }

    #[test]
    fn book_confirms_and_takes_one_seat() {
        let engine = engine_with_flight(3);
        let booking = engine.book(FlightId(42), RequesterId(7), token("abc")).unwrap();

        assert_eq!(booking.status, BookingStatus::Confirmed);
        assert_eq!(booking.flight_id, FlightId(42));
        assert_eq!(booking.requester_id, RequesterId(7));
        assert_eq!(engine.availability(FlightId(42)).unwrap().available_seats, 2);
    }

    #[test]
    fn storage_fault_on_claim_is_retried() {
        let engine = engine_with_flight(3);
        // The first claim sees a fault, the retry succeeds.
        engine.store().faults().arm(Failpoint::BeforeCommit, 1);

        let booking = engine.book(FlightId(42), RequesterId(7), token("abc")).unwrap();
        assert_eq!(booking.status, BookingStatus::Confirmed);
        assert_eq!(engine.availability(FlightId(42)).unwrap().available_seats, 2);
    }

    #[test]
    fn failure_then_success_under_same_token() {
        let engine = engine_with_flight(1);
        engine.book(FlightId(42), RequesterId(1), token("first")).unwrap();

        let result = engine.book(FlightId(42), RequesterId(7), token("abc"));
        assert_eq!(result, Err(ReservationError::SeatsExhausted));

        // A seat frees up; the same token books a fresh booking.
        let first = engine
            .find_booking(RequesterId(1), &"first".into())
            .unwrap()
            .unwrap();
        engine.cancel(first.id).unwrap();
        let booking = engine.book(FlightId(42), RequesterId(7), token("abc")).unwrap();
        assert_eq!(booking.status, BookingStatus::Confirmed);
    }

    #[test]
    fn resumes_pending_booking_instead_of_recording_another() {
        let engine = engine_with_flight(2);
        let pending = engine
            .store()
            .create_pending(FlightId(42), RequesterId(7), "abc".into())
            .unwrap();

        let booking = engine.book(FlightId(42), RequesterId(7), token("abc")).unwrap();
        assert_eq!(booking.id, pending.id);
        assert_eq!(booking.status, BookingStatus::Confirmed);
        assert_eq!(engine.store().ledger().len(), 1);
    }

    #[test]
    fn token_reused_for_other_flight_is_duplicate() {
        let engine = engine_with_flight(2);
        engine.register_flight(FlightId(43), 2);
        engine.book(FlightId(42), RequesterId(7), token("abc")).unwrap();

        let result = engine.book(FlightId(43), RequesterId(7), token("abc"));
        assert_eq!(result, Err(ReservationError::DuplicateRequest));
        assert_eq!(engine.availability(FlightId(43)).unwrap().available_seats, 2);
    }

    #[test]
    fn token_of_cancelled_booking_is_duplicate() {
        let engine = engine_with_flight(2);
        let booking = engine.book(FlightId(42), RequesterId(7), token("abc")).unwrap();
        engine.cancel(booking.id).unwrap();

        let result = engine.book(FlightId(42), RequesterId(7), token("abc"));
        assert_eq!(result, Err(ReservationError::DuplicateRequest));
        assert_eq!(engine.availability(FlightId(42)).unwrap().available_seats, 2);
    }

    #[test]
    fn missing_token_is_generated() {
        let engine = engine_with_flight(2);
        let first = engine.book(FlightId(42), RequesterId(7), None).unwrap();
        let second = engine.book(FlightId(42), RequesterId(7), None).unwrap();

        assert_ne!(first.request_token, second.request_token);
        assert_eq!(engine.availability(FlightId(42)).unwrap().available_seats, 0);
    }

    #[test]
    fn cancel_pending_is_rejected() {
        let engine = engine_with_flight(2);
        let pending = engine
            .store()
            .create_pending(FlightId(42), RequesterId(7), "abc".into())
            .unwrap();
        assert_eq!(engine.cancel(pending.id), Err(ReservationError::NotCancellable));
    }

    #[test]
    fn cancel_unknown_booking() {
        let engine = engine_with_flight(2);
        assert_eq!(
            engine.cancel(BookingId::generate()),
            Err(ReservationError::BookingNotFound)
        );
        assert_eq!(
            engine.cancel_by_token(RequesterId(7), &"nope".into()),
            Err(ReservationError::BookingNotFound)
        );
    }

    #[test]
    fn reconcile_ignores_fresh_pending_bookings() {
        let engine = engine_with_flight(2);
        engine
            .store()
            .create_pending(FlightId(42), RequesterId(7), "abc".into())
            .unwrap();
        assert_eq!(engine.reconcile().unwrap(), 0);
    }

    #[test]
    fn reconcile_fails_stale_pending_bookings() {
        let engine = engine_with_flight(2);
        let pending = engine
            .store()
            .create_pending(FlightId(42), RequesterId(7), "abc".into())
            .unwrap();

        let later = Utc::now() + engine.config().pending_timeout() + chrono::Duration::seconds(1);
        assert_eq!(engine.reconcile_at(later).unwrap(), 1);

        let failed = engine.booking(pending.id).unwrap().unwrap();
        assert_eq!(failed.status, BookingStatus::Failed);
        assert_eq!(failed.failure_reason, Some(FailureReason::Abandoned));
        assert_eq!(engine.availability(FlightId(42)).unwrap().available_seats, 2);
        // A second pass has nothing left to do.
        assert_eq!(engine.reconcile_at(later).unwrap(), 0);
    }

    #[test]
    fn reconcile_keeps_going_after_a_storage_fault() {
        let engine = engine_with_flight(2);
        let first = engine
            .store()
            .create_pending(FlightId(42), RequesterId(7), "abc".into())
            .unwrap();
        let second = engine
            .store()
            .create_pending(FlightId(42), RequesterId(8), "def".into())
            .unwrap();
        engine.store().faults().arm(Failpoint::BeforeCommit, 1);

        let later = Utc::now() + engine.config().pending_timeout() + chrono::Duration::seconds(1);
        assert!(matches!(
            engine.reconcile_at(later),
            Err(ReservationError::StorageFailure(_))
        ));

        // Stale bookings are visited in creation order, so only the first hit the fault.
        assert_eq!(engine.booking(first.id).unwrap().unwrap().status, BookingStatus::Pending);
        let failed = engine.booking(second.id).unwrap().unwrap();
        assert_eq!(failed.status, BookingStatus::Failed);
        assert_eq!(failed.failure_reason, Some(FailureReason::Abandoned));

        assert_eq!(engine.reconcile_at(later).unwrap(), 1);
        assert_eq!(engine.booking(first.id).unwrap().unwrap().status, BookingStatus::Failed);
    }
}
