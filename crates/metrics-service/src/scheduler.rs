// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Timer state deciding when the service should attempt an upload.
//!
//! The scheduler does not own a timer task. It exposes the instant at which
//! the next upload is due and the service task sleeps until then, calling
//! [`UploadScheduler::on_timer_fired`] when it elapses.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ServiceConfig;

#[derive(Debug)]
pub struct UploadScheduler {
    upload_interval: Duration,
    standard_interval: Duration,
    unsent_logs_interval: Duration,
    backoff_multiplier: f64,
    max_interval: Duration,
    deadline: Option<Instant>,
    running: bool,
    callback_pending: bool,
    init_task_complete: bool,
    waiting_for_init_task_complete: bool,
}

impl UploadScheduler {
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            upload_interval: config.initial_upload_interval,
            standard_interval: config.standard_upload_interval,
            unsent_logs_interval: config.unsent_logs_interval,
            backoff_multiplier: config.backoff_multiplier,
            max_interval: config.max_backoff_interval(),
            deadline: None,
            running: false,
            callback_pending: false,
            init_task_complete: false,
            waiting_for_init_task_complete: false,
        }
    }

    pub fn start(&mut self) {
        self.running = true;
        self.schedule_next_upload();
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.deadline = None;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Instant at which the armed timer fires, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn upload_interval(&self) -> Duration {
        self.upload_interval
    }

    /// True between a triggered upload and its completion or cancellation.
    pub fn callback_pending(&self) -> bool {
        self.callback_pending
    }

    /// Returns true when an upload that was held back by the init task should
    /// run now.
    pub fn init_task_complete(&mut self) -> bool {
        self.init_task_complete = true;
        if self.waiting_for_init_task_complete {
            self.waiting_for_init_task_complete = false;
            return self.trigger_upload();
        }
        false
    }

    /// Disarms the timer. Returns true when the service should run an upload.
    pub fn on_timer_fired(&mut self) -> bool {
        self.deadline = None;
        self.trigger_upload()
    }

    fn trigger_upload(&mut self) -> bool {
        // Uploads wait for the init task; it triggers the held-back upload.
        if !self.init_task_complete {
            self.waiting_for_init_task_complete = true;
            return false;
        }
        self.callback_pending = true;
        true
    }

    /// Completes a triggered upload. An unhealthy server lengthens the
    /// interval; pending logs shorten it.
    pub fn upload_finished(&mut self, server_is_healthy: bool, more_logs_remaining: bool) {
        if !self.callback_pending {
            warn!("Upload finished without a pending upload callback");
        }
        self.callback_pending = false;

        if !server_is_healthy {
            self.back_off();
        } else if more_logs_remaining {
            self.upload_interval = self.unsent_logs_interval;
        } else {
            self.upload_interval = self.standard_interval;
        }
        debug!(
            "Next upload in {:?} (healthy: {}, more logs: {})",
            self.upload_interval, server_is_healthy, more_logs_remaining
        );

        if self.running {
            self.schedule_next_upload();
        }
    }

    /// Completes a triggered upload without touching the interval.
    pub fn upload_cancelled(&mut self) {
        if !self.callback_pending {
            warn!("Upload cancelled without a pending upload callback");
        }
        self.callback_pending = false;
        if self.running {
            self.schedule_next_upload();
        }
    }

    fn schedule_next_upload(&mut self) {
        if self.deadline.is_some() || self.callback_pending {
            return;
        }
        self.deadline = Some(Instant::now() + self.upload_interval);
    }

    fn back_off(&mut self) {
        let backed_off = self.upload_interval.mul_f64(self.backoff_multiplier);
        self.upload_interval = backed_off.min(self.max_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> UploadScheduler {
        UploadScheduler::new(&ServiceConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn start_arms_initial_interval() {
        let mut scheduler = scheduler();
        assert!(scheduler.deadline().is_none());
        scheduler.start();
        assert_eq!(
            scheduler.deadline(),
            Some(Instant::now() + Duration::from_secs(60))
        );

        // Restarting keeps the armed timer.
        let deadline = scheduler.deadline();
        tokio::time::advance(Duration::from_secs(10)).await;
        scheduler.start();
        assert_eq!(scheduler.deadline(), deadline);

        scheduler.stop();
        assert!(scheduler.deadline().is_none());
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_before_init_task_is_held_back() {
        let mut scheduler = scheduler();
        scheduler.start();
        assert!(!scheduler.on_timer_fired());
        assert!(!scheduler.callback_pending());

        assert!(scheduler.init_task_complete());
        assert!(scheduler.callback_pending());

        // Completion without a held-back upload does not trigger.
        let mut other = UploadScheduler::new(&ServiceConfig::default());
        assert!(!other.init_task_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn no_timer_while_callback_pending() {
        let mut scheduler = scheduler();
        scheduler.init_task_complete();
        scheduler.start();
        assert!(scheduler.on_timer_fired());

        scheduler.start();
        assert!(scheduler.deadline().is_none());

        scheduler.upload_cancelled();
        assert!(scheduler.deadline().is_some());
        assert_eq!(scheduler.upload_interval(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn interval_follows_upload_health() {
        let mut scheduler = scheduler();
        scheduler.init_task_complete();
        scheduler.start();

        assert!(scheduler.on_timer_fired());
        scheduler.upload_finished(true, true);
        assert_eq!(scheduler.upload_interval(), Duration::from_secs(15));

        assert!(scheduler.on_timer_fired());
        scheduler.upload_finished(true, false);
        assert_eq!(scheduler.upload_interval(), Duration::from_secs(30 * 60));

        assert!(scheduler.on_timer_fired());
        scheduler.upload_finished(false, false);
        assert_eq!(scheduler.upload_interval(), Duration::from_secs(33 * 60));
        assert_eq!(
            scheduler.deadline(),
            Some(Instant::now() + Duration::from_secs(33 * 60))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_is_capped() {
        let mut scheduler = scheduler();
        scheduler.init_task_complete();
        for _ in 0..100 {
            assert!(scheduler.on_timer_fired());
            scheduler.upload_finished(false, true);
        }
        assert_eq!(
            scheduler.upload_interval(),
            Duration::from_secs(10 * 30 * 60)
        );
        // Not running: completion leaves the timer disarmed.
        assert!(scheduler.deadline().is_none());
    }
}
