// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod generator;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::generator::{run, GeneratorConfig, LogSender};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GeneratorConfig::from_env();

    let env_filter = format!("h2=off,hyper=off,reqwest=off,rustls=off,{}", config.log_level);
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).context("could not parse GENERATOR_LOG_LEVEL")?,
        )
        .with_level(true)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    debug!("Logging subsystem enabled");
    info!(
        "GENERATOR | Sending logs to {} every {} s",
        config.backend_url,
        config.interval.as_secs()
    );

    let sender =
        LogSender::new(config.backend_url.clone()).context("failed to build HTTP client")?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    let mut rng = fastrand::Rng::new();
    let sent = run(&sender, &config, &cancel, &mut rng).await;
    info!("GENERATOR | Stopped after {sent} records");
    Ok(())
}
