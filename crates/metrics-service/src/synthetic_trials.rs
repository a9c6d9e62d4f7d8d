// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

/// Experiment group membership registered by the embedder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticTrialGroup {
    pub name: String,
    pub group: String,
    pub start_time: Instant,
}

/// Trial membership as it appears in a log's environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveTrial {
    pub name: String,
    pub group: String,
}

#[derive(Debug, Default)]
pub struct SyntheticTrials {
    groups: Vec<SyntheticTrialGroup>,
}

impl SyntheticTrials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers membership in `name`. Re-registering with a different group
    /// replaces the group and restarts the membership clock.
    pub fn register(&mut self, name: &str, group: &str) {
        if let Some(existing) = self.groups.iter_mut().find(|g| g.name == name) {
            if existing.group != group {
                debug!("Synthetic trial {} moved to group {}", name, group);
                existing.group = group.to_string();
                existing.start_time = Instant::now();
            }
            return;
        }
        self.groups.push(SyntheticTrialGroup {
            name: name.to_string(),
            group: group.to_string(),
            start_time: Instant::now(),
        });
    }

    /// Trials whose membership started no later than `log_creation`.
    pub fn active_groups(&self, log_creation: Instant) -> Vec<ActiveTrial> {
        self.groups
            .iter()
            .filter(|g| g.start_time <= log_creation)
            .map(|g| ActiveTrial {
                name: g.name.clone(),
                group: g.group.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn trial_is_active_only_for_later_logs() {
        let mut trials = SyntheticTrials::new();
        let before = Instant::now();
        tokio::time::advance(Duration::from_secs(1)).await;

        trials.register("NewTabPage", "Enabled");
        assert!(trials.active_groups(before).is_empty());
        assert_eq!(
            trials.active_groups(Instant::now()),
            vec![ActiveTrial {
                name: "NewTabPage".to_string(),
                group: "Enabled".to_string(),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn changing_group_refreshes_start_time() {
        let mut trials = SyntheticTrials::new();
        trials.register("Prefetch", "Control");
        tokio::time::advance(Duration::from_secs(5)).await;
        let log_created = Instant::now();

        // Same group keeps the original start time.
        trials.register("Prefetch", "Control");
        assert_eq!(trials.active_groups(log_created).len(), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        trials.register("Prefetch", "Treatment");
        assert_eq!(trials.len(), 1);
        assert!(trials.active_groups(log_created).is_empty());
        assert_eq!(trials.active_groups(Instant::now())[0].group, "Treatment");
    }
}
