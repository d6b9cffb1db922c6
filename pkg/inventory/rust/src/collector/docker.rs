// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Containers reported by the Docker Engine API over its unix socket.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use tokio::task::JoinSet;
use tokio::time::Instant;

use super::Collector;
use crate::context::Context;
use crate::errors::Error;
use crate::http::Endpoint;
use crate::model::{CollectionResult, ContainerInfo, ContainerPort};

const NAME: &str = "docker";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Share of the remaining collection time given to per-container details.
const DETAILS_SHARE: f64 = 0.8;

const POD_NAME_LABEL: &str = "io.kubernetes.pod.name";
const POD_NAMESPACE_LABEL: &str = "io.kubernetes.pod.namespace";
const POD_UID_LABEL: &str = "io.kubernetes.pod.uid";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerSummary {
    id: String,
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    image: String,
    #[serde(rename = "ImageID", default)]
    image_id: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    created: i64,
    #[serde(default)]
    ports: Vec<SummaryPort>,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    host_config: Option<SummaryHostConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SummaryPort {
    #[serde(rename = "IP", default)]
    ip: String,
    #[serde(default)]
    private_port: u16,
    #[serde(default)]
    public_port: u16,
    #[serde(rename = "Type", default)]
    kind: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SummaryHostConfig {
    #[serde(default)]
    network_mode: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Inspect {
    state: Option<InspectState>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    pid: i32,
    #[serde(default)]
    started_at: String,
}

#[derive(Debug, Default, Deserialize)]
struct Stats {
    #[serde(default)]
    cpu_stats: CpuStats,
    #[serde(default)]
    precpu_stats: CpuStats,
    #[serde(default)]
    memory_stats: MemoryStats,
    #[serde(default)]
    networks: Option<HashMap<String, NetworkStats>>,
    #[serde(default)]
    blkio_stats: BlkioStats,
}

#[derive(Debug, Default, Deserialize)]
struct CpuStats {
    #[serde(default)]
    cpu_usage: CpuUsage,
    #[serde(default)]
    system_cpu_usage: u64,
    #[serde(default)]
    online_cpus: u32,
}

#[derive(Debug, Default, Deserialize)]
struct CpuUsage {
    #[serde(default)]
    total_usage: u64,
    #[serde(default)]
    percpu_usage: Option<Vec<u64>>,
}

#[derive(Debug, Default, Deserialize)]
struct MemoryStats {
    #[serde(default)]
    usage: u64,
    #[serde(default)]
    limit: u64,
    #[serde(default)]
    stats: HashMap<String, u64>,
}

#[derive(Debug, Default, Deserialize)]
struct NetworkStats {
    #[serde(default)]
    rx_bytes: u64,
    #[serde(default)]
    tx_bytes: u64,
}

#[derive(Debug, Default, Deserialize)]
struct BlkioStats {
    #[serde(default)]
    io_service_bytes_recursive: Option<Vec<BlkioEntry>>,
}

#[derive(Debug, Deserialize)]
struct BlkioEntry {
    #[serde(default)]
    op: String,
    #[serde(default)]
    value: u64,
}

impl From<ContainerSummary> for ContainerInfo {
    fn from(summary: ContainerSummary) -> Self {
        let labels = summary.labels.unwrap_or_default();
        let label = |key: &str| labels.get(key).cloned().unwrap_or_default();
        let (pod_name, pod_namespace, pod_uid) = (
            label(POD_NAME_LABEL),
            label(POD_NAMESPACE_LABEL),
            label(POD_UID_LABEL),
        );

        ContainerInfo {
            id: summary.id.chars().take(12).collect(),
            name: summary
                .names
                .first()
                .map(|name| name.strip_prefix('/').unwrap_or(name).to_string())
                .unwrap_or_default(),
            image: summary.image,
            image_id: summary.image_id,
            state: summary.state,
            status: summary.status,
            created: summary.created,
            ports: summary
                .ports
                .into_iter()
                .map(|port| ContainerPort {
                    private_port: port.private_port,
                    public_port: port.public_port,
                    kind: port.kind,
                    ip: port.ip,
                })
                .collect(),
            network_mode: summary
                .host_config
                .map(|config| config.network_mode)
                .unwrap_or_default(),
            labels,
            pod_name,
            pod_namespace,
            pod_uid,
            ..ContainerInfo::default()
        }
    }
}

impl Stats {
    fn apply(&self, info: &mut ContainerInfo) {
        let cpu_delta = self
            .cpu_stats
            .cpu_usage
            .total_usage
            .saturating_sub(self.precpu_stats.cpu_usage.total_usage);
        let system_delta = self
            .cpu_stats
            .system_cpu_usage
            .saturating_sub(self.precpu_stats.system_cpu_usage);
        let cpus = match self.cpu_stats.online_cpus {
            0 => self
                .cpu_stats
                .cpu_usage
                .percpu_usage
                .as_ref()
                .map_or(1, |per_cpu| per_cpu.len().max(1)),
            n => n as usize,
        };
        if system_delta > 0 {
            info.cpu_percent = cpu_delta as f64 / system_delta as f64 * cpus as f64 * 100.0;
        }

        // Page cache is reclaimable and not counted as usage.
        let cache = self
            .memory_stats
            .stats
            .get("inactive_file")
            .or_else(|| self.memory_stats.stats.get("total_inactive_file"))
            .copied()
            .unwrap_or_default();
        info.mem_usage = self.memory_stats.usage.saturating_sub(cache);
        info.mem_limit = self.memory_stats.limit;
        if info.mem_limit > 0 {
            info.mem_percent = info.mem_usage as f64 / info.mem_limit as f64 * 100.0;
        }

        for network in self.networks.iter().flat_map(|n| n.values()) {
            info.net_rx_bytes += network.rx_bytes;
            info.net_tx_bytes += network.tx_bytes;
        }

        for entry in self
            .blkio_stats
            .io_service_bytes_recursive
            .iter()
            .flatten()
        {
            match entry.op.to_ascii_lowercase().as_str() {
                "read" => info.block_read += entry.value,
                "write" => info.block_write += entry.value,
                _ => {}
            }
        }
    }
}

/// Per-container details fetched for a running container.
#[derive(Debug)]
struct Details {
    state: Option<InspectState>,
    stats: Option<Stats>,
}

impl Details {
    /// Inspect and stats run side by side. A failed call leaves its fields
    /// empty.
    async fn fetch(endpoint: &Endpoint, id: &str, ctx: &Context) -> Self {
        let inspect_path = format!("/containers/{id}/json");
        let stats_path = format!("/containers/{id}/stats?stream=false&one-shot=true");
        let (inspect, stats) = tokio::join!(
            endpoint.get_json::<Inspect>(&inspect_path, "container inspect", ctx),
            endpoint.get_json::<Stats>(&stats_path, "container stats", ctx),
        );

        let state = match inspect {
            Ok(inspect) => inspect.state,
            Err(e) => {
                debug!("[{NAME}] inspect {id}: {e}");
                None
            }
        };
        let stats = match stats {
            Ok(stats) => Some(stats),
            Err(e) => {
                debug!("[{NAME}] stats {id}: {e}");
                None
            }
        };
        Details { state, stats }
    }

    fn apply(self, info: &mut ContainerInfo) {
        if let Some(state) = self.state.filter(|state| state.pid > 0) {
            info.pid = state.pid;
            info.started_at = state.started_at;
        }
        if let Some(stats) = self.stats {
            stats.apply(info);
        }
    }
}

/// Detail calls must finish before the collection deadline so the container
/// list survives a slow daemon.
fn details_context(ctx: &Context) -> Context {
    match ctx.deadline() {
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            ctx.with_timeout(remaining.mul_f64(DETAILS_SHARE))
        }
        None => ctx.clone(),
    }
}

pub struct DockerCollector {
    endpoint: Endpoint,
}

impl DockerCollector {
    /// Connects to the daemon socket. Fails when the daemon does not answer a
    /// ping within five seconds.
    pub async fn connect(socket: &Path) -> Result<Self, Error> {
        let endpoint = Endpoint::Unix(socket.to_path_buf());
        let ctx = Context::background().with_timeout(CONNECT_TIMEOUT);

        let (status, _) = endpoint
            .get("/_ping", &ctx)
            .await
            .map_err(|e| Error::unavailable(NAME, e))?;
        if !status.is_success() {
            return Err(Error::unavailable(
                NAME,
                format!("ping returned {status}"),
            ));
        }

        Ok(DockerCollector { endpoint })
    }
}

#[async_trait]
impl Collector for DockerCollector {
    fn name(&self) -> &str {
        NAME
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(15)
    }

    async fn collect(&self, ctx: &Context) -> Result<CollectionResult, Error> {
        let summaries: Vec<ContainerSummary> = self
            .endpoint
            .get_json("/containers/json?all=1", "container list", ctx)
            .await?;

        let details_ctx = details_context(ctx);
        let mut details = JoinSet::new();
        let mut containers = Vec::with_capacity(summaries.len());
        for (index, summary) in summaries.into_iter().enumerate() {
            if summary.state == "running" {
                let endpoint = self.endpoint.clone();
                let id = summary.id.clone();
                let ctx = details_ctx.clone();
                details.spawn(async move { (index, Details::fetch(&endpoint, &id, &ctx).await) });
            }
            containers.push(ContainerInfo::from(summary));
        }

        while let Some(joined) = details.join_next().await {
            match joined {
                Ok((index, fetched)) => {
                    if let Some(info) = containers.get_mut(index) {
                        fetched.apply(info);
                    }
                }
                Err(e) => debug!("[{NAME}] detail task failed: {e}"),
            }
        }

        debug!("[{NAME}] found {} containers", containers.len());
        Ok(CollectionResult {
            containers,
            ..CollectionResult::default()
        })
    }
}
