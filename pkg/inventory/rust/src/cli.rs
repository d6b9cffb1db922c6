// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::path::PathBuf;

use clap::Parser;

use crate::config::Config;

#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "inventory-agent")]
#[command(about = "Collects a host inventory and serves it over a local HTTP API")]
pub struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Status API listen address, overrides the config file
    #[arg(long)]
    pub listen: Option<String>,

    /// Collection interval in seconds, overrides the config file
    #[arg(long)]
    pub interval: Option<u64>,

    /// Log at debug level unless a log level is configured
    #[arg(long)]
    pub debug: bool,

    /// Run a single collection, print it as JSON and exit
    #[arg(long)]
    pub once: bool,
}

impl Args {
    /// Flags win over the file and the environment.
    pub fn apply(&self, config: &mut Config) {
        if let Some(listen) = &self.listen {
            config.listen.clone_from(listen);
        }
        if let Some(interval) = self.interval {
            config.interval = interval.max(1);
        }
    }
}
