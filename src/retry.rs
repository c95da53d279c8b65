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

//! Bounded retry with exponential backoff.
//!
//! Losing a compare-and-swap means somebody else just took a seat. Retrying
//! at once tends to collide again with the same crowd, so each retry waits a
//! little longer, with random jitter to spread the callers apart.
//!
//! # Default Values
//!
//! - `max_attempts`: 5
//! - `base_delay_ms`: 1
//! - `max_delay_ms`: 50
//! - `multiplier`: 2.0
//! - `jitter`: true

use rand::Rng;
use serde::Deserialize;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Claim attempts per booking, first one included.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Cap on any single delay, in milliseconds.
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Pick each delay uniformly between half and all of the computed backoff.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1,
            max_delay_ms: 50,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Retries without waiting. Used in simulations and tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            jitter: false,
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Backoff before retry number `retry` (zero-based), without jitter.
    ///
    /// `base_delay * multiplier ^ retry`, capped at `max_delay`.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let delay_ms = self.base_delay_ms as f64 * self.multiplier.powi(i32::try_from(retry).unwrap_or(i32::MAX));
        let capped = delay_ms.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_micros((capped * 1000.0) as u64)
    }

    /// Backoff before retry number `retry`, with jitter applied if enabled.
    pub fn backoff(&self, retry: u32) -> Duration {
        let delay = self.delay_for_retry(retry);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let micros = delay.as_micros() as u64;
        Duration::from_micros(rand::thread_rng().gen_range(micros / 2..=micros))
    }

    /// Blocks the current thread for the backoff of retry number `retry`.
    pub fn wait(&self, retry: u32) {
        let delay = self.backoff(retry);
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }
}
