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

use clap::Parser;
use csv::{ReaderBuilder, Trim, Writer};
use seat_reservation_rs::{
    BookingId, BookingStatus, EngineConfig, FailureReason, FlightId, MemoryStore, RequestToken,
    RequesterId, ReservationEngine,
};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process;
use tracing::{debug, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Seat Reservation - Replay a booking script against the reservation engine
///
/// Reads operations from a CSV file and outputs flight inventory to stdout.
/// Supports registering flights, booking, cancelling and reconciling.
#[derive(Parser, Debug)]
#[command(name = "seat-reservation-rs")]
#[command(about = "Replays a CSV booking script and prints seat inventory", long_about = None)]
struct Args {
    /// Path to CSV file with operations
    ///
    /// Expected format: op,flight,requester,token,seats
    /// Example: cargo run -- script.csv > flights.csv
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// Optional TOML configuration file (overridable with SEATS__* variables)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Also print the booking ledger after the inventory
    #[arg(long)]
    bookings: bool,
}

fn main() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "seat_reservation_rs=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let config = match EngineConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            process::exit(1);
        }
    };

    let file = match File::open(&args.input) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error opening file '{}': {}", args.input.display(), e);
            process::exit(1);
        }
    };

    let engine = match process_script(BufReader::new(file), config) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Error processing script: {}", e);
            process::exit(1);
        }
    };

    let mut stdout = std::io::stdout().lock();
    if let Err(e) = write_flights(&engine, &mut stdout) {
        eprintln!("Error writing output: {}", e);
        process::exit(1);
    }
    if args.bookings {
        let written = stdout
            .write_all(b"\n")
            .map_err(csv::Error::from)
            .and_then(|()| write_bookings(&engine, &mut stdout));
        if let Err(e) = written {
            eprintln!("Error writing output: {}", e);
            process::exit(1);
        }
    }
}

/// Raw CSV record matching the input format.
///
/// Fields: `op, flight, requester, token, seats`
#[derive(Debug, Deserialize)]
struct CsvRecord {
    op: String,
    #[serde(deserialize_with = "csv::invalid_option")]
    flight: Option<u32>,
    #[serde(deserialize_with = "csv::invalid_option")]
    requester: Option<u32>,
    token: Option<String>,
    #[serde(deserialize_with = "csv::invalid_option")]
    seats: Option<u32>,
}

#[derive(Debug, PartialEq)]
enum Command {
    Flight {
        flight_id: FlightId,
        seats: u32,
    },
    Book {
        flight_id: FlightId,
        requester_id: RequesterId,
        token: Option<RequestToken>,
    },
    Cancel {
        requester_id: RequesterId,
        token: RequestToken,
    },
    Reconcile,
}

impl CsvRecord {
    /// Converts CSV record to a command.
    ///
    /// Returns `None` for unknown operations or missing required fields.
    fn into_command(self) -> Option<Command> {
        let token = self
            .token
            .filter(|token| !token.is_empty())
            .map(RequestToken::from);

        match self.op.to_lowercase().as_str() {
            "flight" => Some(Command::Flight {
                flight_id: FlightId(self.flight?),
                seats: self.seats?,
            }),
            "book" => Some(Command::Book {
                flight_id: FlightId(self.flight?),
                requester_id: RequesterId(self.requester?),
                token,
            }),
            "cancel" => Some(Command::Cancel {
                requester_id: RequesterId(self.requester?),
                token: token?,
            }),
            "reconcile" => Some(Command::Reconcile),
            _ => None,
        }
    }
}

/// Replay operations from a CSV reader.
///
/// Rows are streamed, so arbitrarily long scripts are fine. Malformed rows
/// and failed operations are logged and skipped.
///
/// # CSV Format
///
/// Expected columns: `op, flight, requester, token, seats`
/// - `op`: Operation (flight, book, cancel, reconcile)
/// - `flight`: Flight ID (u32), required for flight and book
/// - `requester`: Requester ID (u32), required for book and cancel
/// - `token`: Request token, optional for book, required for cancel
/// - `seats`: Seat count (u32), required for flight
///
/// # Example
///
/// ```csv
/// op,flight,requester,token,seats
/// flight,42,,,100
/// book,42,7,abc,
/// cancel,,7,abc,
/// ```
///
/// # Errors
///
/// Returns a CSV error if the reader fails or the CSV structure is invalid.
pub fn process_script<R: Read>(reader: R, config: EngineConfig) -> Result<ReservationEngine, csv::Error> {
    let engine = ReservationEngine::with_store(MemoryStore::new(), config);

    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    for (line, result) in rdr.deserialize::<CsvRecord>().enumerate() {
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                warn!(line, error = %e, "skipping malformed row");
                continue;
            }
        };
        let Some(command) = record.into_command() else {
            warn!(line, "skipping invalid operation");
            continue;
        };
        apply(&engine, command, line);
    }

    Ok(engine)
}

fn apply(engine: &ReservationEngine, command: Command, line: usize) {
    match command {
        Command::Flight { flight_id, seats } => {
            if !engine.register_flight(flight_id, seats) {
                warn!(line, flight = %flight_id, "flight already registered");
            }
        }
        Command::Book {
            flight_id,
            requester_id,
            token,
        } => {
            if let Err(e) = engine.book(flight_id, requester_id, token) {
                debug!(line, error = %e, "booking rejected");
            }
        }
        Command::Cancel {
            requester_id,
            token,
        } => {
            if let Err(e) = engine.cancel_by_token(requester_id, &token) {
                debug!(line, error = %e, "cancellation rejected");
            }
        }
        Command::Reconcile => {
            if let Err(e) = engine.reconcile() {
                warn!(line, error = %e, "reconciliation failed");
            }
        }
    }
}

/// Write flight inventory to a CSV writer, ordered by flight ID.
///
/// # CSV Format
///
/// Columns: `flight, total, available, version`
///
/// # Errors
///
/// Returns a CSV error if writing fails.
pub fn write_flights<W: Write>(engine: &ReservationEngine, writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);
    for flight in engine.store().inventory().flights() {
        wtr.serialize(&flight)?;
    }
    wtr.flush()?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct BookingRow<'a> {
    booking: BookingId,
    flight: FlightId,
    requester: RequesterId,
    token: &'a str,
    status: BookingStatus,
    reason: Option<FailureReason>,
}

/// Write the booking ledger to a CSV writer, in creation order.
///
/// # CSV Format
///
/// Columns: `booking, flight, requester, token, status, reason`
///
/// # Errors
///
/// Returns a CSV error if writing fails.
pub fn write_bookings<W: Write>(engine: &ReservationEngine, writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);
    for booking in engine.store().ledger().bookings() {
        wtr.serialize(BookingRow {
            booking: booking.id,
            flight: booking.flight_id,
            requester: booking.requester_id,
            token: booking.request_token.as_str(),
            status: booking.status,
            reason: booking.failure_reason,
        })?;
    }
    wtr.flush()?;
    Ok(())
}
