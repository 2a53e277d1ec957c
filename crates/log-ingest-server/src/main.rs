// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, process, sync::Arc};
use tokio::net::TcpListener;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use log_ingest::{
    backend::{
        elasticsearch::ElasticsearchBackend, memory::InMemoryBackend, StorageBackend,
    },
    config::{BackendKind, Config},
    pipeline::IngestPipeline,
    server::LogServer,
};

#[tokio::main]
pub async fn main() {
    let log_level = env::var("LOG_INGEST_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{log_level}");

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
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            process::exit(1);
        }
    };

    let backend: Arc<dyn StorageBackend> = match config.backend {
        BackendKind::Elasticsearch => {
            let es_config = config.elasticsearch();
            info!(
                "Using Elasticsearch backend at {} (index {})",
                es_config.url, es_config.index
            );
            match ElasticsearchBackend::new(es_config) {
                Ok(backend) => Arc::new(backend),
                Err(e) => {
                    error!("Unable to create Elasticsearch client: {e}");
                    process::exit(1);
                }
            }
        }
        BackendKind::Memory => {
            info!("Using in-memory backend");
            Arc::new(InMemoryBackend::new())
        }
    };

    let pipeline = Arc::new(IngestPipeline::new(backend, config.pipeline()));

    // Traffic is only accepted once the index exists.
    if let Err(e) = pipeline.initialize().await {
        error!("{e}");
        process::exit(1);
    }
    if let Err(e) = pipeline.start() {
        error!("{e}");
        process::exit(1);
    }

    let listener = match TcpListener::bind(config.addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Unable to bind {}: {e}", config.addr);
            process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    let server = Arc::new(LogServer::new(
        Arc::clone(&pipeline),
        config.max_request_bytes,
    ));
    let mut server_handle = tokio::spawn(server.serve(listener, shutdown.clone()));

    let server_exited = tokio::select! {
        () = shutdown_signal() => {
            info!("Shutdown signal received");
            false
        }
        result = &mut server_handle => {
            error!("HTTP server terminated unexpectedly: {result:?}");
            true
        }
    };

    shutdown.cancel();
    match pipeline.shutdown(config.shutdown_grace).await {
        Ok(report) if report.abandoned > 0 => {
            error!(
                "{} records were not committed before shutdown",
                report.abandoned
            );
        }
        Ok(_) => info!("All queued records committed"),
        Err(e) => error!("{e}"),
    }
    if !server_exited {
        report_server_exit(server_handle.await);
    }
    info!("Shutdown complete");
}

fn report_server_exit(result: Result<std::io::Result<()>, JoinError>) {
    match result {
        Ok(Ok(())) => debug!("HTTP server stopped"),
        Ok(Err(e)) => error!("HTTP server stopped with an error: {e}"),
        Err(e) => error!("HTTP server task failed: {e}"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Unable to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
