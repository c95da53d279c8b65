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

//! Benchmarks for the reservation engine.
//!
//! Run with: cargo bench
//!
//! Benchmarks include:
//! - Single-threaded booking, replay and cancellation
//! - Booking throughput on one flight
//! - Parallel bookings contending for one flight
//! - Parallel bookings spread over many flights
//! - Scaling with number of threads

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rayon::prelude::*;
use seat_reservation_rs::{
    EngineConfig, FlightId, MemoryStore, RequestToken, RequesterId, ReservationEngine,
    RetryPolicy,
};
use std::sync::atomic::{AtomicU32, Ordering};

// =============================================================================
// Helper Functions
// =============================================================================

fn engine_with_flights(flights: u32, seats: u32) -> ReservationEngine {
    let config = EngineConfig {
        retry: RetryPolicy::default().with_max_attempts(20),
        ..EngineConfig::default()
    };
    let engine = ReservationEngine::with_store(MemoryStore::new(), config);
    for flight in 0..flights {
        engine.register_flight(FlightId(flight), seats);
    }
    engine
}

fn token(n: u32) -> Option<RequestToken> {
    Some(RequestToken::from(format!("req-{n}")))
}

// =============================================================================
// Single-Threaded Benchmarks
// =============================================================================

fn bench_single_booking(c: &mut Criterion) {
    c.bench_function("single_booking", |b| {
        let engine = engine_with_flights(1, u32::MAX);
        let mut n = 0u32;
        b.iter(|| {
            n += 1;
            engine
                .book(FlightId(0), RequesterId(1), black_box(token(n)))
                .unwrap();
        })
    });
}

fn bench_replayed_booking(c: &mut Criterion) {
    c.bench_function("replayed_booking", |b| {
        let engine = engine_with_flights(1, 10);
        engine.book(FlightId(0), RequesterId(1), token(0)).unwrap();
        b.iter(|| {
            engine
                .book(FlightId(0), RequesterId(1), black_box(token(0)))
                .unwrap();
        })
    });
}

fn bench_book_then_cancel(c: &mut Criterion) {
    c.bench_function("book_then_cancel", |b| {
        let engine = engine_with_flights(1, 1);
        let mut n = 0u32;
        b.iter(|| {
            n += 1;
            let booking = engine.book(FlightId(0), RequesterId(1), token(n)).unwrap();
            engine.cancel(black_box(booking.id)).unwrap();
        })
    });
}

fn bench_booking_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("booking_throughput");

    for count in [100, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            b.iter(|| {
                let engine = engine_with_flights(1, count);
                for n in 0..count {
                    engine.book(FlightId(0), RequesterId(n), token(n)).unwrap();
                }
                black_box(&engine);
            })
        });
    }
    group.finish();
}

// =============================================================================
// Multi-Threaded Benchmarks
// =============================================================================

fn bench_parallel_same_flight(c: &mut Criterion) {
    let mut group = c.benchmark_group("parallel_same_flight");

    for count in [1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            b.iter(|| {
                let engine = engine_with_flights(1, count / 2);
                // Half the requests find the flight sold out.
                (0..count).into_par_iter().for_each(|n| {
                    let _ = engine.book(FlightId(0), RequesterId(n), token(n));
                });
                black_box(&engine);
            })
        });
    }
    group.finish();
}

fn bench_parallel_many_flights(c: &mut Criterion) {
    let mut group = c.benchmark_group("parallel_many_flights");

    for flights in [10, 100, 1_000].iter() {
        let count = 10_000u32;
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(flights),
            flights,
            |b, &flights| {
                b.iter(|| {
                    let engine = engine_with_flights(flights, count);
                    (0..count).into_par_iter().for_each(|n| {
                        let _ = engine.book(FlightId(n % flights), RequesterId(n), token(n));
                    });
                    black_box(&engine);
                })
            },
        );
    }
    group.finish();
}

fn bench_parallel_book_cancel(c: &mut Criterion) {
    let mut group = c.benchmark_group("parallel_book_cancel");
    let count = 10_000u32;
    group.throughput(Throughput::Elements(count as u64 * 2));
    group.bench_function("churn", |b| {
        b.iter(|| {
            let engine = engine_with_flights(4, 64);
            let counter = AtomicU32::new(0);
            (0..count).into_par_iter().for_each(|_| {
                let n = counter.fetch_add(1, Ordering::Relaxed);
                if let Ok(booking) = engine.book(FlightId(n % 4), RequesterId(n), token(n)) {
                    let _ = engine.cancel(booking.id);
                }
            });
            black_box(&engine);
        })
    });
    group.finish();
}

// =============================================================================
// Scaling Benchmarks
// =============================================================================

fn bench_thread_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("thread_scaling");
    let total_bookings = 10_000u32;

    for num_threads in [1, 2, 4, 8].iter() {
        group.throughput(Throughput::Elements(total_bookings as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(num_threads),
            num_threads,
            |b, &num_threads| {
                // Configure rayon thread pool for this benchmark
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(num_threads)
                    .build()
                    .unwrap();

                b.iter(|| {
                    let engine = engine_with_flights(100, total_bookings);
                    pool.install(|| {
                        (0..total_bookings).into_par_iter().for_each(|n| {
                            let _ = engine.book(FlightId(n % 100), RequesterId(n), token(n));
                        });
                    });
                    black_box(&engine);
                })
            },
        );
    }
    group.finish();
}

criterion_group!(
    single_threaded,
    bench_single_booking,
    bench_replayed_booking,
    bench_book_then_cancel,
    bench_booking_throughput,
);

criterion_group!(
    multi_threaded,
    bench_parallel_same_flight,
    bench_parallel_many_flights,
    bench_parallel_book_cancel,
);

criterion_group!(scaling, bench_thread_scaling);

criterion_main!(single_threaded, multi_threaded, scaling);
