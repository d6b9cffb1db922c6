// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Listening socket discovery.
//!
//! The `ss` tool is tried first. When it cannot be run the kernel socket
//! tables are parsed and socket inodes are matched against every process's
//! file descriptors.

pub mod proc_net;
pub mod ss;

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};

use super::Collector;
use crate::context::Context;
use crate::errors::Error;
use crate::model::{CollectionResult, PortInfo};
use crate::procfs::{self, UserCache, fd::socket_owners};

const NAME: &str = "port";

#[derive(Debug, Clone)]
pub struct PortCollectorConfig {
    /// Socket statistics command and its arguments.
    pub command: String,
    pub args: Vec<String>,
    /// Process table used to resolve owners.
    pub proc_root: PathBuf,
    /// Directory holding the tcp, tcp6, udp and udp6 socket tables.
    pub net_root: PathBuf,
}

impl Default for PortCollectorConfig {
    fn default() -> Self {
        Self::with_proc_root(procfs::root_path())
    }
}

impl PortCollectorConfig {
    pub fn with_proc_root(proc_root: &Path) -> Self {
        PortCollectorConfig {
            command: "ss".to_string(),
            args: vec!["-tulnp".to_string()],
            proc_root: proc_root.to_path_buf(),
            net_root: proc_root.join("net"),
        }
    }
}

pub struct PortCollector {
    config: Arc<PortCollectorConfig>,
}

impl PortCollector {
    pub fn new(config: PortCollectorConfig) -> Self {
        info!(
            "[{NAME}] using `{} {}` with {} as fallback",
            config.command,
            config.args.join(" "),
            config.net_root.display()
        );
        PortCollector {
            config: Arc::new(config),
        }
    }

    /// Lists sockets with the socket statistics command.
    pub async fn collect_primary(&self, ctx: &Context) -> Result<Vec<PortInfo>, Error> {
        let ports = ss::list_sockets(&self.config, ctx).await?;
        self.resolve_owners(ports, ctx).await
    }

    /// Lists sockets from the kernel socket tables.
    pub async fn collect_fallback(&self, ctx: &Context) -> Result<Vec<PortInfo>, Error> {
        let config = Arc::clone(&self.config);
        let scan_ctx = ctx.clone();
        let ports = tokio::task::spawn_blocking(move || {
            let entries = proc_net::read_socket_tables(&config.net_root)?;

            let wanted: HashSet<_> = entries
                .iter()
                .map(|entry| entry.inode)
                .filter(|inode| *inode != 0)
                .collect();
            let owners = socket_owners(&config.proc_root, &wanted, &scan_ctx);

            Ok::<_, Error>(
                entries
                    .into_iter()
                    .map(|entry| {
                        let mut port = entry.port;
                        port.pid = owners.get(&entry.inode).copied().unwrap_or(0);
                        port
                    })
                    .collect::<Vec<_>>(),
            )
        })
        .await
        .map_err(|e| Error::Io(io::Error::other(e)))??;

        self.resolve_owners(ports, ctx).await
    }

    /// Fills command line, executable and user of every port with a known pid.
    async fn resolve_owners(
        &self,
        mut ports: Vec<PortInfo>,
        ctx: &Context,
    ) -> Result<Vec<PortInfo>, Error> {
        if ports.iter().all(|port| port.pid <= 0) {
            return Ok(ports);
        }

        let config = Arc::clone(&self.config);
        let ctx = ctx.clone();
        tokio::task::spawn_blocking(move || {
            let mut users = UserCache::default();
            for port in ports.iter_mut().filter(|port| port.pid > 0) {
                if ctx.is_done() {
                    break;
                }
                let owner = procfs::read_owner(&config.proc_root, port.pid, &mut users);
                if port.process_name.is_empty() {
                    port.process_name = owner.name;
                }
                port.cmdline = owner.cmdline;
                port.exe = owner.exe;
                port.username = owner.username;
            }
            ports
        })
        .await
        .map_err(|e| Error::Io(io::Error::other(e)))
    }
}

#[async_trait]
impl Collector for PortCollector {
    fn name(&self) -> &str {
        NAME
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(10)
    }

    async fn collect(&self, ctx: &Context) -> Result<CollectionResult, Error> {
        let ports = match self.collect_primary(ctx).await {
            Ok(ports) => ports,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                debug!("[{NAME}] {e}, reading socket tables instead");
                self.collect_fallback(ctx).await?
            }
        };

        debug!("[{NAME}] found {} sockets", ports.len());
        Ok(CollectionResult {
            ports,
            ..CollectionResult::default()
        })
    }
}
