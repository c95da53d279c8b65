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

//! # Seat Reservation
//!
//! This library claims flight seats under concurrent load without overselling,
//! losing bookings, or leaving seat counters and booking records out of step.
//!
//! ## Core Components
//!
//! - [`ReservationEngine`]: Books, cancels and reconciles bookings
//! - [`InventoryStore`]: Per-flight seat counters with versioned compare-and-swap
//! - [`BookingLedger`]: Append-only booking records
//! - [`IdempotencyGuard`]: Unique index from request token to booking
//! - [`ReservationStore`]: Transactional storage boundary, with [`MemoryStore`] in memory
//! - [`ReservationError`]: Error types for reservation failures
//!
//! ## Example
//!
//! ```
//! use seat_reservation_rs::{BookingStatus, FlightId, RequestToken, RequesterId, ReservationEngine};
//!
//! let engine = ReservationEngine::new();
//! engine.register_flight(FlightId(42), 100);
//!
//! let token = RequestToken::from("abc");
//! let booking = engine.book(FlightId(42), RequesterId(7), Some(token.clone())).unwrap();
//! assert_eq!(booking.status, BookingStatus::Confirmed);
//!
//! // A retry with the same token returns the same booking.
//! let replay = engine.book(FlightId(42), RequesterId(7), Some(token)).unwrap();
//! assert_eq!(replay.id, booking.id);
//! assert_eq!(engine.availability(FlightId(42)).unwrap().available_seats, 99);
//! ```
//!
//! ## Thread Safety
//!
//! The engine holds no locks of its own. Correctness rests on two atomic
//! store operations: the unique insert of a request token and the
//! all-or-nothing commit of a seat change together with its booking status.

mod base;
pub mod booking;
mod engine;
pub mod error;
pub mod faults;
mod idempotency;
pub mod inventory;
mod ledger;
mod reconciler;
pub mod retry;
pub mod settings;
pub mod store;

pub use base::{BookingId, FlightId, RequestToken, RequesterId};
pub use booking::{Booking, BookingStatus, FailureReason};
pub use engine::ReservationEngine;
pub use error::ReservationError;
pub use faults::{FaultInjector, Failpoint};
pub use idempotency::IdempotencyGuard;
pub use inventory::{Availability, FlightInventory, InventoryStore};
pub use ledger::BookingLedger;
pub use reconciler::Reconciler;
pub use retry::RetryPolicy;
pub use settings::EngineConfig;
pub use store::{Commit, Conflict, MemoryStore, Receipt, ReservationStore, Transaction, Write};
