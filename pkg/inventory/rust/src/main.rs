// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

// Correctness
#![deny(clippy::indexing_slicing)]
#![deny(clippy::string_slice)]
#![deny(clippy::cast_possible_wrap)]
#![deny(clippy::undocumented_unsafe_blocks)]
// Panicking code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unimplemented)]
#![deny(clippy::todo)]
// Debug code that shouldn't be in production
#![deny(clippy::dbg_macro)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use dd_inventory::collector::{
    Collector, DockerCollector, KubernetesCollector, PortCollector, PortCollectorConfig,
    ProcessCollector, SystemCollector, SystemdCollector,
};
use dd_inventory::cli::Args;
use dd_inventory::config::{self, Config};
use dd_inventory::{Context, Manager, api, procfs};
use log::{info, warn};
use tokio::signal::unix::{SignalKind, signal};

async fn build_collectors(config: &Config) -> Vec<Arc<dyn Collector>> {
    let proc_root = config
        .host_proc
        .clone()
        .unwrap_or_else(|| procfs::root_path().to_path_buf());
    let enabled = &config.collectors;
    let mut collectors: Vec<Arc<dyn Collector>> = Vec::new();

    if enabled.process {
        collectors.push(Arc::new(ProcessCollector::new(&proc_root)));
    }
    if enabled.port {
        collectors.push(Arc::new(PortCollector::new(PortCollectorConfig {
            command: config.port.command.clone(),
            args: config.port.args.clone(),
            ..PortCollectorConfig::with_proc_root(&proc_root)
        })));
    }
    if enabled.system {
        collectors.push(Arc::new(SystemCollector::new(&proc_root, Path::new("/"))));
    }
    if enabled.systemd {
        match SystemdCollector::connect(&config.systemd.systemctl, Path::new("/run")).await {
            Ok(collector) => collectors.push(Arc::new(collector)),
            Err(e) => warn!("Skipping systemd collector: {e}"),
        }
    }
    if enabled.docker {
        match DockerCollector::connect(&config.docker.socket).await {
            Ok(collector) => collectors.push(Arc::new(collector)),
            Err(e) => warn!("Skipping docker collector: {e}"),
        }
    }
    if enabled.kubernetes {
        match KubernetesCollector::connect(&config.kubernetes.kubelet_url).await {
            Ok(collector) => collectors.push(Arc::new(collector)),
            Err(e) => warn!("Skipping kubernetes collector: {e}"),
        }
    }

    collectors
}

async fn build_manager(config: &Config) -> Manager {
    let mut manager = Manager::new(config.interval())
        .with_tick_timeout(config.tick_timeout())
        .with_subscriber_capacity(config.subscriber_capacity);
    for collector in build_collectors(config).await {
        manager.register(collector);
    }
    manager
}

#[allow(clippy::print_stdout)]
async fn run_once(manager: &Manager) -> Result<()> {
    let data = manager.collect(&Context::background()).await;
    let json = serde_json::to_string_pretty(&*data).context("Failed to serialize snapshot")?;
    println!("{json}");
    Ok(())
}

/// Cancels `ctx` on the first SIGTERM or SIGINT.
fn cancel_on_signal(ctx: Context) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down"),
            _ = ctx.done() => return,
        }
        ctx.cancel();
    });
    Ok(())
}

async fn run_agent(config: &Config, manager: Manager) -> Result<()> {
    let listener = api::bind(&config.listen).await?;
    let manager = Arc::new(manager);
    let ctx = Context::background();
    cancel_on_signal(ctx.clone())?;

    let ((), served) = tokio::join!(manager.run(&ctx), async {
        let result = api::serve(listener, Arc::clone(&manager), &ctx).await;
        // Stop collecting if the API went down on its own.
        ctx.cancel();
        result
    });
    served
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let (mut config, source) = config::load_config(args.config.as_deref())?;
    args.apply(&mut config);

    let log_level = config::get_log_level(&config, args.debug);
    simple_logger::init_with_level(log_level)?;
    info!("Log level set to: {:?}", log_level);
    source.log();

    let manager = build_manager(&config).await;
    info!(
        "Collectors enabled: {}",
        manager.collector_names().join(", ")
    );

    if args.once {
        return run_once(&manager).await;
    }

    info!("Starting inventory agent");
    run_agent(&config, manager).await
}
