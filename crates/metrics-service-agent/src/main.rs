// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod client;
mod intake;

use std::{env, sync::Arc};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use metrics_service::{
    session::load_or_create_client_id, ExecutionPhase, Histograms, InMemoryPrefStore, LocalState,
    PrefStore, ReportingService, ReqwestTransport, ServiceConfig, ServiceError, SledPrefStore,
};

use crate::client::{AgentClient, SystemProfileProvider};
use crate::intake::Intake;

const DEFAULT_INTAKE_PORT: u16 = 8127;
const AGENT_HOST: &str = "127.0.0.1";

#[tokio::main]
pub async fn main() {
    let config = match ServiceConfig::from_env().and_then(|config| {
        config.validate()?;
        Ok(config)
    }) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading metrics service configuration: {e}");
            return;
        }
    };

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", config.log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let intake_port = env::var("METRICS_INTAKE_PORT")
        .ok()
        .and_then(|port| port.parse::<u16>().ok())
        .unwrap_or(DEFAULT_INTAKE_PORT);

    if let Err(e) = run(config, intake_port).await {
        error!("Metrics service agent failed: {e}");
    }
}

fn open_store(config: &ServiceConfig) -> Result<Box<dyn PrefStore>, ServiceError> {
    match &config.store_path {
        Some(path) => Ok(Box::new(SledPrefStore::open(path)?)),
        None => {
            info!("METRICS_STORE_PATH not set, local state will not survive restarts");
            Ok(Box::new(InMemoryPrefStore::new()))
        }
    }
}

async fn run(config: ServiceConfig, intake_port: u16) -> Result<(), ServiceError> {
    let mut local_state = LocalState::new(open_store(&config)?);
    let client_id = load_or_create_client_id(&mut local_state);

    let transport = ReqwestTransport::new(&config)?;
    let histograms = Histograms::new();
    let (mut service, handle) = ReportingService::new(
        config,
        local_state,
        Arc::new(AgentClient::new(client_id)),
        Arc::new(transport),
        histograms.clone(),
    );
    service.register_provider(Box::new(SystemProfileProvider));
    let service_task = tokio::spawn(service.run());

    let send_error = |e| ServiceError::ChannelClosed(format!("{e}"));
    handle.start().map_err(send_error)?;
    handle.log_need_for_clean_shutdown().map_err(send_error)?;
    handle
        .set_execution_phase(ExecutionPhase::MainMessageLoopRun)
        .map_err(send_error)?;

    let cancel_token = CancellationToken::new();
    let intake = Intake::bind(
        &format!("{AGENT_HOST}:{intake_port}"),
        handle.clone(),
        histograms,
        cancel_token.clone(),
    )
    .await?;
    info!("metrics-intake-udp: starting to listen on port {intake_port}");
    let intake_task = tokio::spawn(intake.spin());

    wait_for_shutdown_signal().await;
    info!("Shutting down metrics service agent");

    cancel_token.cancel();
    if let Err(e) = intake_task.await {
        error!("Intake task failed: {e}");
    }

    handle.stop().await?;
    handle.log_clean_shutdown().await?;
    handle.shutdown().map_err(send_error)?;
    if let Err(e) = service_task.await {
        error!("Reporting service task failed: {e}");
    }
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => error!("Unable to listen for SIGTERM: {e}"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for shutdown signal: {e}");
    }
}
