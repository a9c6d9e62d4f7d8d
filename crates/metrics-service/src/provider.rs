// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use crate::log::{Environment, MetricsLog};

/// Supplies payload fragments to logs at fixed points of the log lifecycle.
///
/// Every hook is called from the service task and must return promptly.
pub trait MetricsProvider: Send {
    fn on_recording_enabled(&mut self) {}

    fn on_recording_disabled(&mut self) {}

    /// Called whenever a new ongoing log becomes current.
    fn on_log_created(&mut self) {}

    fn provide_stability_metrics(
        &mut self,
        _log: &mut MetricsLog,
        _incremental_uptime: Duration,
        _uptime: Duration,
    ) {
    }

    fn provide_general_metrics(&mut self, _log: &mut MetricsLog) {}

    /// Adds fields describing the system to the environment recorded into a log.
    /// The synthetic trials active for the log are already filled in.
    fn provide_environment(&mut self, _environment: &mut Environment) {}
}
