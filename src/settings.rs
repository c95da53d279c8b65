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

//! Engine configuration.
//!
//! Every field has a default, so an empty file is a valid configuration.
//! Sources are layered: an optional TOML file first, then environment
//! variables prefixed with `SEATS`, using `__` between nested keys:
//!
//! ```text
//! SEATS__PENDING_TIMEOUT_SECS=60
//! SEATS__RETRY__MAX_ATTEMPTS=8
//! ```

use crate::retry::RetryPolicy;
use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Upper bound on the pending timeout, one year.
const MAX_PENDING_TIMEOUT_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    /// How long a booking may stay pending before reconciliation fails it.
    pub pending_timeout_secs: u64,
    /// How often the background reconciler runs.
    pub reconcile_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            pending_timeout_secs: 30,
            reconcile_interval_secs: 10,
        }
    }
}

impl EngineConfig {
    /// Loads the optional file at `path`, then applies `SEATS__*` overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder
            .add_source(
                Environment::with_prefix("SEATS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Parses a TOML document.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    pub fn pending_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.pending_timeout_secs.min(MAX_PENDING_TIMEOUT_SECS) as i64)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }
}
