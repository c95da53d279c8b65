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

//! Append-only booking ledger.
//!
//! Records are never removed; they only move forward through the
//! [`BookingStatus`] state machine. The ledger owns the [`IdempotencyGuard`]
//! and keeps it in step with booking status: a token is held while its booking
//! is active and released when the booking fails.

use crate::base::{BookingId, FlightId, RequestToken, RequesterId};
use crate::booking::{Booking, BookingStatus, FailureReason};
use crate::error::ReservationError;
use crate::idempotency::IdempotencyGuard;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct BookingLedger {
    bookings: DashMap<BookingId, Arc<Mutex<Booking>>>,
    tokens: IdempotencyGuard,
    next_seq: AtomicU64,
}

impl BookingLedger {
    pub fn new() -> Self {
        Self {
            bookings: DashMap::new(),
            tokens: IdempotencyGuard::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Records a new pending booking and binds its request token.
    ///
    /// # Errors
    ///
    /// [`ReservationError::DuplicateRequest`] if an active booking already
    /// holds the token. Nothing is recorded in that case.
    pub fn create_pending(
        &self,
        flight_id: FlightId,
        requester_id: RequesterId,
        token: RequestToken,
    ) -> Result<Booking, ReservationError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let booking = Booking::pending(seq, flight_id, requester_id, token, Utc::now());

        // The record lands before the token becomes visible, and only for the winner.
        let record = Arc::new(Mutex::new(booking.clone()));
        self.tokens
            .claim_with(requester_id, &booking.request_token, booking.id, || {
                self.bookings.insert(booking.id, record);
            })
            .map_err(|_| ReservationError::DuplicateRequest)?;

        Ok(booking)
    }

    pub fn get(&self, booking_id: BookingId) -> Option<Booking> {
        let handle = self.handle(booking_id).ok()?;
        let booking = handle.lock().clone();
        Some(booking)
    }

    /// Looks up the active booking holding `token`, if any.
    pub fn find_by_token(&self, requester_id: RequesterId, token: &RequestToken) -> Option<Booking> {
        self.tokens
            .lookup(requester_id, token)
            .and_then(|booking_id| self.get(booking_id))
    }

    /// Settles a pending booking as confirmed.
    ///
    /// Does not touch inventory. A booking that is already settled is
    /// returned unchanged.
    pub fn mark_confirmed(&self, booking_id: BookingId) -> Result<Booking, ReservationError> {
        let handle = self.handle(booking_id)?;
        let mut booking = handle.lock();
        let _ = booking.confirm(Utc::now());
        Ok(booking.clone())
    }

    /// Settles a pending booking as failed and frees its token.
    ///
    /// A booking that is already settled is returned unchanged.
    pub fn mark_failed(
        &self,
        booking_id: BookingId,
        reason: FailureReason,
    ) -> Result<Booking, ReservationError> {
        let handle = self.handle(booking_id)?;
        let mut booking = handle.lock();
        if booking.fail(reason, Utc::now()).is_ok() {
            self.release_token(&booking);
        }
        Ok(booking.clone())
    }

    /// Flips a confirmed booking to cancelled. Does not release the seat.
    ///
    /// # Errors
    ///
    /// [`ReservationError::NotCancellable`] for pending or failed bookings.
    pub fn mark_cancelled(&self, booking_id: BookingId) -> Result<Booking, ReservationError> {
        let handle = self.handle(booking_id)?;
        let mut booking = handle.lock();
        match booking.cancel(Utc::now()) {
            Ok(()) | Err(BookingStatus::Cancelled) => Ok(booking.clone()),
            Err(_) => Err(ReservationError::NotCancellable),
        }
    }

    /// Pending bookings that have not moved since before `cutoff`.
    pub fn stale_pending(&self, cutoff: DateTime<Utc>) -> Vec<Booking> {
        let mut stale: Vec<_> = self
            .handles()
            .iter()
            .map(|handle| handle.lock().clone())
            .filter(|booking| booking.status == BookingStatus::Pending && booking.updated_at < cutoff)
            .collect();
        stale.sort_by_key(|booking| booking.seq);
        stale
    }

    /// Every booking, in creation order.
    pub fn bookings(&self) -> Vec<Booking> {
        let mut bookings: Vec<_> = self
            .handles()
            .iter()
            .map(|handle| handle.lock().clone())
            .collect();
        bookings.sort_by_key(|booking| booking.seq);
        bookings
    }

    pub fn len(&self) -> usize {
        self.bookings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bookings.is_empty()
    }

    pub(crate) fn handle(
        &self,
        booking_id: BookingId,
    ) -> Result<Arc<Mutex<Booking>>, ReservationError> {
        self.bookings
            .get(&booking_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(ReservationError::BookingNotFound)
    }

    pub(crate) fn release_token(&self, booking: &Booking) {
        self.tokens
            .release(booking.requester_id, &booking.request_token, booking.id);
    }

    // Collect handles first so no map shard is held while a booking is locked.
    fn handles(&self) -> Vec<Arc<Mutex<Booking>>> {
        self.bookings
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn create(ledger: &BookingLedger, token: &str) -> Booking {
        ledger
            .create_pending(FlightId(42), RequesterId(7), token.into())
            .unwrap()
    }

    #[test]
    fn create_pending_records_booking() {
        let ledger = BookingLedger::new();
        let booking = create(&ledger, "abc");

        assert_eq!(booking.status, BookingStatus::Pending);
        assert_eq!(ledger.get(booking.id), Some(booking.clone()));
        assert_eq!(
            ledger.find_by_token(RequesterId(7), &"abc".into()),
            Some(booking)
        );
    }

    #[test]
    fn duplicate_token_is_rejected_without_recording() {
        let ledger = BookingLedger::new();
        create(&ledger, "abc");

        let result = ledger.create_pending(FlightId(42), RequesterId(7), "abc".into());
        assert_eq!(result, Err(ReservationError::DuplicateRequest));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn racing_duplicates_never_show_up_in_the_ledger() {
        use std::sync::atomic::AtomicBool;
        use std::thread;

        let ledger = Arc::new(BookingLedger::new());
        let done = Arc::new(AtomicBool::new(false));

        let watcher = {
            let ledger = Arc::clone(&ledger);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut most = 0;
                while !done.load(Ordering::SeqCst) {
                    most = most.max(ledger.len()).max(ledger.bookings().len());
                }
                most
            })
        };

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    ledger.create_pending(FlightId(42), RequesterId(7), "abc".into())
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(Result::is_ok)
            .count();
        done.store(true, Ordering::SeqCst);

        assert_eq!(winners, 1);
        assert!(watcher.join().unwrap() <= 1);
        assert_eq!(ledger.len(), 1);
        assert!(ledger.find_by_token(RequesterId(7), &"abc".into()).is_some());
    }

    #[test]
    fn failed_booking_frees_its_token() {
        let ledger = BookingLedger::new();
        let first = create(&ledger, "abc");
        ledger
            .mark_failed(first.id, FailureReason::NoSeatsAvailable)
            .unwrap();

        assert_eq!(ledger.find_by_token(RequesterId(7), &"abc".into()), None);
        let second = create(&ledger, "abc");
        assert_ne!(first.id, second.id);
        // The failed record stays in the ledger.
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn settling_twice_returns_settled_state() {
        let ledger = BookingLedger::new();
        let booking = create(&ledger, "abc");

        let confirmed = ledger.mark_confirmed(booking.id).unwrap();
        assert_eq!(confirmed.status, BookingStatus::Confirmed);

        assert_eq!(ledger.mark_confirmed(booking.id).unwrap(), confirmed);
        let after_fail = ledger
            .mark_failed(booking.id, FailureReason::Contention)
            .unwrap();
        assert_eq!(after_fail, confirmed);
        // Still bound to the confirmed booking.
        assert!(ledger.find_by_token(RequesterId(7), &"abc".into()).is_some());
    }

    #[test]
    fn cancel_is_idempotent() {
        let ledger = BookingLedger::new();
        let booking = create(&ledger, "abc");
        ledger.mark_confirmed(booking.id).unwrap();

        let cancelled = ledger.mark_cancelled(booking.id).unwrap();
        assert_eq!(cancelled.status, BookingStatus::Cancelled);
        assert_eq!(ledger.mark_cancelled(booking.id).unwrap(), cancelled);
    }

    #[test]
    fn pending_booking_is_not_cancellable() {
        let ledger = BookingLedger::new();
        let booking = create(&ledger, "abc");
        assert_eq!(
            ledger.mark_cancelled(booking.id),
            Err(ReservationError::NotCancellable)
        );
    }

    #[test]
    fn unknown_booking_is_reported() {
        let ledger = BookingLedger::new();
        let missing = BookingId::generate();
        assert_eq!(
            ledger.mark_confirmed(missing),
            Err(ReservationError::BookingNotFound)
        );
        assert_eq!(ledger.get(missing), None);
    }

    #[test]
    fn stale_pending_filters_by_status_and_age() {
        let ledger = BookingLedger::new();
        let pending = create(&ledger, "a");
        let confirmed = create(&ledger, "b");
        ledger.mark_confirmed(confirmed.id).unwrap();

        let future = Utc::now() + Duration::seconds(60);
        let stale = ledger.stale_pending(future);
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, pending.id);

        assert!(ledger.stale_pending(pending.created_at).is_empty());
    }

    #[test]
    fn bookings_are_listed_in_creation_order() {
        let ledger = BookingLedger::new();
        let tokens = ["c", "a", "b"];
        for token in tokens {
            create(&ledger, token);
        }

        let listed: Vec<_> = ledger
            .bookings()
            .into_iter()
            .map(|booking| booking.request_token.0)
            .collect();
        assert_eq!(listed, vec!["c", "a", "b"]);
    }
}
