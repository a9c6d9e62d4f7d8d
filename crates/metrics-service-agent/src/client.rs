// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

use async_trait::async_trait;
use metrics_service::{Environment, MetricsProvider, MetricsServiceClient};
use tracing::{debug, warn};

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Client identity of the agent process.
pub struct AgentClient {
    client_id: String,
}

impl AgentClient {
    pub fn new(client_id: String) -> Self {
        Self { client_id }
    }
}

#[async_trait]
impl MetricsServiceClient for AgentClient {
    fn client_id(&self) -> String {
        self.client_id.clone()
    }

    fn version_string(&self) -> String {
        AGENT_VERSION.to_string()
    }

    async fn gather_initial_metrics(&self) -> BTreeMap<String, String> {
        // Filesystem probes may block; keep them off the runtime workers.
        match tokio::task::spawn_blocking(gather_host_facts).await {
            Ok(facts) => facts,
            Err(e) => {
                warn!("Failed to gather host facts: {}", e);
                BTreeMap::new()
            }
        }
    }

    fn on_log_upload_complete(&self) {
        debug!("Metrics log uploaded");
    }
}

fn gather_host_facts() -> BTreeMap<String, String> {
    let mut facts = BTreeMap::new();
    if let Ok(hostname) = std::fs::read_to_string("/etc/hostname") {
        facts.insert("hostname".to_string(), hostname.trim().to_string());
    }
    if let Ok(cwd) = std::env::current_dir() {
        facts.insert("working_dir".to_string(), cwd.display().to_string());
    }
    if let Ok(exe) = std::env::current_exe() {
        facts.insert("executable".to_string(), exe.display().to_string());
    }
    facts
}

/// Describes the host system in every recorded environment.
#[derive(Default)]
pub struct SystemProfileProvider;

impl MetricsProvider for SystemProfileProvider {
    fn provide_environment(&mut self, environment: &mut Environment) {
        environment.set("os", std::env::consts::OS);
        environment.set("arch", std::env::consts::ARCH);
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        environment.set("cpu_count", cpu_count.to_string());
        environment.set("agent_version", AGENT_VERSION);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_profile_fields() {
        let mut environment = Environment::default();
        SystemProfileProvider.provide_environment(&mut environment);
        assert_eq!(environment.get("os"), Some(std::env::consts::OS));
        assert_eq!(environment.get("agent_version"), Some(AGENT_VERSION));
        assert!(environment.get("cpu_count").is_some());
    }

    #[tokio::test]
    async fn test_gathers_host_facts_off_runtime() {
        let client = AgentClient::new("id".to_string());
        let facts = client.gather_initial_metrics().await;
        assert!(facts.contains_key("working_dir"));
        assert_eq!(client.client_id(), "id");
    }
}
