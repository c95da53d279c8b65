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

//! Seat inventory.
//!
//! Each flight carries a version number that moves forward on every change.
//! Decrements are compare-and-swap on that version, so a writer that read a
//! stale availability loses instead of overwriting someone else's claim.
//!
//! # Example
//!
//! ```
//! use seat_reservation_rs::{FlightId, InventoryStore};
//!
//! let inventory = InventoryStore::new();
//! inventory.register(FlightId(1), 2);
//!
//! let seen = inventory.get_availability(FlightId(1)).unwrap();
//! assert_eq!(seen.available_seats, 2);
//!
//! // First writer wins, the second one saw a stale version.
//! assert!(inventory.try_decrement(FlightId(1), seen.version).unwrap().is_some());
//! assert!(inventory.try_decrement(FlightId(1), seen.version).unwrap().is_none());
//! ```

use crate::base::FlightId;
use crate::error::ReservationError;
use crate::store::Conflict;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde::ser::{Serialize, SerializeStruct, Serializer};
use std::sync::Arc;

/// Seats left on a flight together with the version they were read at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Availability {
    pub available_seats: u32,
    pub version: u64,
}

/// Seat counters for one flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlightInventory {
    flight_id: FlightId,
    total_seats: u32,
    available_seats: u32,
    version: u64,
}

impl FlightInventory {
    fn new(flight_id: FlightId, total_seats: u32) -> Self {
        Self {
            flight_id,
            total_seats,
            available_seats: total_seats,
            version: 0,
        }
    }

    pub fn flight_id(&self) -> FlightId {
        self.flight_id
    }

    pub fn total_seats(&self) -> u32 {
        self.total_seats
    }

    pub fn available_seats(&self) -> u32 {
        self.available_seats
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Seats currently claimed by confirmed bookings.
    pub fn claimed_seats(&self) -> u32 {
        self.total_seats - self.available_seats
    }

    pub fn availability(&self) -> Availability {
        Availability {
            available_seats: self.available_seats,
            version: self.version,
        }
    }

    fn assert_invariants(&self) {
        debug_assert!(
            self.available_seats <= self.total_seats,
            "Invariant violated: flight {} has {} available of {} seats",
            self.flight_id,
            self.available_seats,
            self.total_seats
        );
    }

    /// Takes one seat if nobody changed the flight since `expected_version`.
    pub(crate) fn try_decrement(&mut self, expected_version: u64) -> Result<u64, Conflict> {
        if self.version != expected_version {
            return Err(Conflict::VersionMismatch {
                flight_id: self.flight_id,
                expected: expected_version,
                actual: self.version,
            });
        }
        if self.available_seats == 0 {
            return Err(Conflict::SoldOut {
                flight_id: self.flight_id,
            });
        }
        self.available_seats -= 1;
        self.version += 1;
        self.assert_invariants();
        Ok(self.version)
    }

    /// Gives one seat back, unless every seat is already available.
    pub(crate) fn increment(&mut self) -> Result<u64, Conflict> {
        if self.available_seats >= self.total_seats {
            return Err(Conflict::Full {
                flight_id: self.flight_id,
            });
        }
        self.available_seats += 1;
        self.version += 1;
        self.assert_invariants();
        Ok(self.version)
    }
}

impl Serialize for FlightInventory {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("FlightInventory", 4)?;
        state.serialize_field("flight", &self.flight_id)?;
        state.serialize_field("total", &self.total_seats)?;
        state.serialize_field("available", &self.available_seats)?;
        state.serialize_field("version", &self.version)?;
        state.end()
    }
}

/// Per-flight seat counters.
///
/// Every flight sits behind its own [`Mutex`], so operations on different
/// flights never contend and each operation on one flight is atomic.
#[derive(Debug, Default)]
pub struct InventoryStore {
    flights: DashMap<FlightId, Arc<Mutex<FlightInventory>>>,
}

impl InventoryStore {
    pub fn new() -> Self {
        Self {
            flights: DashMap::new(),
        }
    }

    /// Adds a flight with all of its seats available.
    ///
    /// Returns `false` and leaves the existing flight untouched if the ID is
    /// already registered; seat totals never change after creation.
    pub fn register(&self, flight_id: FlightId, total_seats: u32) -> bool {
        match self.flights.entry(flight_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(Mutex::new(FlightInventory::new(
                    flight_id,
                    total_seats,
                ))));
                true
            }
        }
    }

    /// Reads seats left and the current version.
    ///
    /// # Errors
    ///
    /// [`ReservationError::NotFound`] if the flight is unknown.
    pub fn get_availability(&self, flight_id: FlightId) -> Result<Availability, ReservationError> {
        Ok(self.handle(flight_id)?.lock().availability())
    }

    /// Takes one seat only if the version still equals `expected_version` and a
    /// seat is left.
    ///
    /// Returns the new version, or `None` without touching the flight if the
    /// compare-and-swap lost.
    ///
    /// # Errors
    ///
    /// [`ReservationError::NotFound`] if the flight is unknown.
    pub fn try_decrement(
        &self,
        flight_id: FlightId,
        expected_version: u64,
    ) -> Result<Option<u64>, ReservationError> {
        let handle = self.handle(flight_id)?;
        let mut flight = handle.lock();
        Ok(flight.try_decrement(expected_version).ok())
    }

    /// Returns one seat to the flight and yields the new version.
    ///
    /// Returns `None` without touching the flight if no seat is claimed.
    ///
    /// # Errors
    ///
    /// [`ReservationError::NotFound`] if the flight is unknown.
    pub fn increment(&self, flight_id: FlightId) -> Result<Option<u64>, ReservationError> {
        let handle = self.handle(flight_id)?;
        let mut flight = handle.lock();
        Ok(flight.increment().ok())
    }

    /// Returns a copy of the flight's counters, if the flight exists.
    pub fn snapshot(&self, flight_id: FlightId) -> Option<FlightInventory> {
        let handle = self.handle(flight_id).ok()?;
        let flight = handle.lock().clone();
        Some(flight)
    }

    /// Copies of every flight's counters, ordered by flight ID.
    pub fn flights(&self) -> Vec<FlightInventory> {
        let handles: Vec<_> = self
            .flights
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut flights: Vec<_> = handles.iter().map(|handle| handle.lock().clone()).collect();
        flights.sort_by_key(FlightInventory::flight_id);
        flights
    }

    /// Shared handle to a flight's lock; the map shard is released before the
    /// caller locks it.
    pub(crate) fn handle(
        &self,
        flight_id: FlightId,
    ) -> Result<Arc<Mutex<FlightInventory>>, ReservationError> {
        self.flights
            .get(&flight_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(ReservationError::NotFound)
    }
}
