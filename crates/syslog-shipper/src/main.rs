// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::{signal, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use syslog_pipeline::{
    batch_writer::BatchWriter,
    classifier::Classifier,
    clickhouse::ClickHouseConnection,
    config::{Config, DEFAULT_CONFIG_PATH},
    directory::{load_name_cache, DeviceDirectory, HttpDeviceDirectory},
    dispatcher::{Dispatcher, PipelineContext},
    listener::{SyslogListener, SyslogListenerConfig},
    resolver::NameResolver,
};

#[derive(Debug, Parser)]
#[command(about = "Ships syslog from switches, web and mail servers into ClickHouse")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
pub async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration from {}: {e}", args.config.display());
            return ExitCode::FAILURE;
        }
    };

    let env_filter = format!(
        "h2=off,hyper=off,reqwest=off,rustls=off,{}",
        config.log_level.as_str()
    );
    let filter = match EnvFilter::try_new(env_filter) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("could not parse log level in configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {e}");
        return ExitCode::FAILURE;
    }
    debug!("Logging subsystem enabled");

    if !args.config.exists() {
        warn!(
            "Configuration file {} not found, using defaults and environment",
            args.config.display()
        );
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let time = config.time_settings()?;

    // One connection per category, so a broken batch never blocks the others.
    let switch_conn = ClickHouseConnection::connect(config.clickhouse()).await?;
    let web_conn = ClickHouseConnection::connect(config.clickhouse()).await?;
    let mail_conn = ClickHouseConnection::connect(config.clickhouse()).await?;
    info!("Connected to ClickHouse at {}", config.db_host);

    let directory = match config.directory_server() {
        Some(url) => Some(HttpDeviceDirectory::new(url, config.request_timeout())?),
        None => None,
    };
    let cache = load_name_cache(directory.as_ref().map(|d| d as &dyn DeviceDirectory)).await;
    info!("Name cache seeded with {} switches", cache.len());

    let context = PipelineContext {
        classifier: Classifier::new(config.web_tag.clone()),
        resolver: NameResolver::new(cache, Box::new(config.snmp_lookup())),
        switch_writer: BatchWriter::new(Box::new(switch_conn), config.switch_batch_size, time),
        web_writer: BatchWriter::new(Box::new(web_conn), config.web_batch_size, time),
        mail_writer: BatchWriter::new(Box::new(mail_conn), config.mail_batch_size, time),
        flush_interval: config.flush_interval(),
    };

    let cancel_token = CancellationToken::new();
    let (tx, rx) = mpsc::channel(config.queue_capacity);
    let listener = SyslogListener::new(
        &SyslogListenerConfig {
            listen_address: config.listen_address.clone(),
        },
        tx,
        cancel_token.clone(),
    )
    .await?;
    info!("syslog-udp: starting to listen on {}", config.listen_address);

    let listener_handle = tokio::spawn(listener.spin());
    let dispatcher_handle = tokio::spawn(Dispatcher::new(context).run(rx, cancel_token.clone()));

    shutdown_signal().await;
    cancel_token.cancel();

    if let Err(e) = listener_handle.await {
        error!("syslog listener task failed: {e}");
    }
    let stats = dispatcher_handle.await?;
    info!(
        "Shut down after {} records: {} written, {} filtered, {} dropped, {} lost in failed batches",
        stats.received, stats.written, stats.filtered, stats.dropped, stats.lost
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
