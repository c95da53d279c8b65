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

//! Thread-safe idempotency index.
//!
//! Maps `(requester, token)` to the one active booking holding that token,
//! so a retried request finds its earlier booking without a ledger scan.

use crate::base::{BookingId, RequestToken, RequesterId};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// Unique index from request token to booking.
///
/// Claims go through the [`DashMap`] entry API, so check and insert are a
/// single atomic step and two racing requests with the same token cannot both
/// win.
#[derive(Debug, Default)]
pub struct IdempotencyGuard {
    tokens: DashMap<(RequesterId, RequestToken), BookingId>,
}

impl IdempotencyGuard {
    pub fn new() -> Self {
        Self {
            tokens: DashMap::new(),
        }
    }

    /// Binds the token to `booking_id`.
    ///
    /// # Errors
    ///
    /// Returns the booking already holding the token.
    pub fn claim(
        &self,
        requester_id: RequesterId,
        token: &RequestToken,
        booking_id: BookingId,
    ) -> Result<(), BookingId> {
        self.claim_with(requester_id, token, booking_id, || ())
    }

    /// Binds the token to `booking_id`, running `record` first.
    ///
    /// `record` runs only for the winning claim and finishes before any
    /// lookup can see the binding.
    ///
    /// # Errors
    ///
    /// Returns the booking already holding the token; `record` is not run.
    pub fn claim_with<F>(
        &self,
        requester_id: RequesterId,
        token: &RequestToken,
        booking_id: BookingId,
        record: F,
    ) -> Result<(), BookingId>
    where
        F: FnOnce(),
    {
        match self.tokens.entry((requester_id, token.clone())) {
            Entry::Occupied(entry) => Err(*entry.get()),
            Entry::Vacant(entry) => {
                record();
                entry.insert(booking_id);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, requester_id: RequesterId, token: &RequestToken) -> Option<BookingId> {
        self.tokens
            .get(&(requester_id, token.clone()))
            .map(|entry| *entry.value())
    }

    /// Frees the token, but only while it still points at `booking_id`.
    pub fn release(&self, requester_id: RequesterId, token: &RequestToken, booking_id: BookingId) {
        self.tokens
            .remove_if(&(requester_id, token.clone()), |_, held| *held == booking_id);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
