// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::process::ExitCode;

use sensebridge::app;
use sensebridge::config::{JsonFileStore, LogLevel};
use sensebridge::registry::Registry;

/// Exit status for any startup or runtime failure.
const EXIT_FAILURE: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    let path = app::config_path();
    let registry = match Registry::open(JsonFileStore::new(&path)) {
        Ok(registry) => registry,
        Err(e) => {
            app::init_logging(LogLevel::default());
            tracing::error!(path = %path.display(), error = %e, "Failed to load configuration");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    app::init_logging(registry.log_level());
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %path.display(),
        sensors = registry.len(),
        "Starting sensebridge"
    );

    match app::run(registry, app::shutdown_signal()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "sensebridge failed");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}
