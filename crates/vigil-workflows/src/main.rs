// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Vigil cron trigger
//!
//! Runs due tasks once within the configured execution budget and exits.
//! Meant to be started by cron every minute; overlapping invocations are safe.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use vigil_core::{Config, TaskRunner, persistence};
use vigil_remote::http_client;
use vigil_workflows::{HttpPushTransport, LogMailer, build_registry, ensure_system_tasks};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vigil=info".parse()?),
        )
        .init();

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        runner_id = %config.runner_id,
        max_execution_secs = config.max_execution.as_secs(),
        bias = config.execution_bias,
        "Configuration loaded"
    );

    let persistence = persistence::connect(&config.database_url).await?;
    let created = ensure_system_tasks(persistence.as_ref()).await?;
    if created > 0 {
        info!(created, "System tasks created");
    }

    let http = http_client(config.max_execution)?;
    let registry = build_registry(
        http.clone(),
        Arc::new(LogMailer),
        Arc::new(HttpPushTransport::new(http)),
    );

    let runner = TaskRunner::new(persistence, Arc::new(registry), Arc::new(config));
    let summary = runner.run_due().await?;

    info!(
        executed = summary.executed.len(),
        reset_stale = summary.reset_stale,
        "Cron run complete"
    );
    Ok(())
}
