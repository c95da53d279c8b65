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

//! Background reconciliation of abandoned pending bookings.

use crate::engine::ReservationEngine;
use crate::store::ReservationStore;
use crossbeam::channel::{self, Sender};
use crossbeam::select;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{info, warn};

/// Runs [`ReservationEngine::reconcile`] on a fixed interval in its own thread.
///
/// The thread stops on [`shutdown`](Self::shutdown) or when the handle is dropped.
#[derive(Debug)]
pub struct Reconciler {
    stop: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl Reconciler {
    /// Starts reconciling at the engine's configured interval.
    pub fn spawn<S>(engine: Arc<ReservationEngine<S>>) -> Self
    where
        S: ReservationStore + 'static,
    {
        let interval = engine.config().reconcile_interval();
        Self::spawn_with_interval(engine, interval)
    }

    pub fn spawn_with_interval<S>(engine: Arc<ReservationEngine<S>>, interval: Duration) -> Self
    where
        S: ReservationStore + 'static,
    {
        // Never sent on; dropping the sender is the stop signal.
        let (stop, stopped) = channel::bounded::<()>(0);
        let ticks = channel::tick(interval);

        let worker = thread::spawn(move || {
            loop {
                select! {
                    recv(ticks) -> _ => match engine.reconcile() {
                        Ok(0) => {}
                        Ok(resolved) => info!(resolved, "reconciled abandoned bookings"),
                        Err(error) => warn!(%error, "reconciliation pass failed"),
                    },
                    recv(stopped) -> _ => break,
                }
            }
        });

        Self {
            stop: Some(stop),
            worker: Some(worker),
        }
    }

    /// Stops the thread and waits for the current pass to finish.
    pub fn shutdown(mut self) {
        self.stop_worker();
    }

    fn stop_worker(&mut self) {
        drop(self.stop.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("reconciler thread panicked");
            }
        }
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        self.stop_worker();
    }
}
