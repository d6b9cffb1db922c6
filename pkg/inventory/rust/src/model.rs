// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Records produced by the collectors and the merged snapshot served to
//! consumers. These types carry no behavior beyond serialization.

use std::collections::BTreeMap;

use serde::Serialize;
use time::OffsetDateTime;

pub type Pid = i32;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub ppid: Pid,
    pub name: String,
    pub cmdline: String,
    pub exe: String,
    pub cwd: String,
    pub username: String,
    pub uid: u32,
    pub gid: u32,
    pub status: String,
    /// Milliseconds since the Unix epoch.
    pub create_time: i64,
    pub cpu_percent: f64,
    pub mem_percent: f32,
    pub mem_rss: u64,
    pub mem_vms: u64,
    pub num_fds: u32,
    pub num_threads: u32,
    pub io_read: u64,
    pub io_write: u64,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub container_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub container_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub pod_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub pod_namespace: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub systemd_unit: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// A listening (or bound) socket and the process owning it. Identity within
/// a snapshot is `(protocol, address, port)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortInfo {
    pub port: u16,
    pub protocol: Protocol,
    pub address: String,
    /// 0 when the owner could not be resolved.
    pub pid: Pid,
    pub process_name: String,
    pub cmdline: String,
    pub username: String,
    pub exe: String,
    pub state: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub container_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub container_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub container_image: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub pod_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub pod_namespace: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub systemd_unit: String,
}

impl PortInfo {
    pub fn new(protocol: Protocol, address: impl Into<String>, port: u16) -> Self {
        PortInfo {
            port,
            protocol,
            address: address.into(),
            pid: 0,
            process_name: String::new(),
            cmdline: String::new(),
            username: String::new(),
            exe: String::new(),
            state: String::new(),
            container_id: String::new(),
            container_name: String::new(),
            container_image: String::new(),
            pod_name: String::new(),
            pod_namespace: String::new(),
            systemd_unit: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub os: String,
    pub platform: String,
    pub kernel_version: String,
    pub uptime: u64,
    pub boot_time: u64,

    pub cpu_count: u32,
    pub cpu_percent: f64,
    pub cpu_user: f64,
    pub cpu_system: f64,
    pub cpu_idle: f64,
    pub cpu_iowait: f64,
    pub load_avg_1: f64,
    pub load_avg_5: f64,
    pub load_avg_15: f64,

    pub mem_total: u64,
    pub mem_used: u64,
    pub mem_free: u64,
    pub mem_available: u64,
    pub mem_percent: f64,
    pub swap_total: u64,
    pub swap_used: u64,
    pub swap_percent: f64,

    pub disk_total: u64,
    pub disk_used: u64,
    pub disk_free: u64,
    pub disk_percent: f64,
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,

    pub net_bytes_sent: u64,
    pub net_bytes_recv: u64,
    pub net_packets_sent: u64,
    pub net_packets_recv: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemdUnitInfo {
    pub name: String,
    pub description: String,
    pub load_state: String,
    pub active_state: String,
    pub sub_state: String,
    pub main_pid: u32,
    pub exec_main_pid: u32,
    pub memory_current: u64,
    pub cpu_usage_nsec: u64,
    pub tasks_current: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContainerPort {
    pub private_port: u16,
    pub public_port: u16,
    #[serde(rename = "type")]
    pub kind: String,
    pub ip: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContainerInfo {
    /// Short (12 character) container id.
    pub id: String,
    pub name: String,
    pub image: String,
    pub image_id: String,
    pub state: String,
    pub status: String,
    pub created: i64,
    pub started_at: String,
    /// Main process pid on the host, 0 when not running.
    pub pid: Pid,
    pub ports: Vec<ContainerPort>,
    pub labels: BTreeMap<String, String>,
    pub network_mode: String,

    pub cpu_percent: f64,
    pub mem_usage: u64,
    pub mem_limit: u64,
    pub mem_percent: f64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
    pub block_read: u64,
    pub block_write: u64,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub pod_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub pod_namespace: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub pod_uid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KubeContainer {
    pub name: String,
    pub container_id: String,
    pub image: String,
    pub ready: bool,
    pub restart_count: i32,
    pub state: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KubernetesPodInfo {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub node_name: String,
    pub host_ip: String,
    pub pod_ip: String,
    pub phase: String,
    pub start_time: String,
    pub labels: BTreeMap<String, String>,
    pub containers: Vec<KubeContainer>,
}

/// The partial snapshot produced by one collector during one tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionResult {
    pub processes: Vec<ProcessInfo>,
    pub ports: Vec<PortInfo>,
    pub system: Option<SystemInfo>,
    pub systemd_units: Vec<SystemdUnitInfo>,
    pub containers: Vec<ContainerInfo>,
    pub pods: Vec<KubernetesPodInfo>,
}

/// One merged and enriched view of the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedData {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub processes: Vec<ProcessInfo>,
    pub ports: Vec<PortInfo>,
    pub system: Option<SystemInfo>,
    pub systemd_units: Vec<SystemdUnitInfo>,
    pub containers: Vec<ContainerInfo>,
    pub pods: Vec<KubernetesPodInfo>,
}

impl AggregatedData {
    pub fn empty(timestamp: OffsetDateTime) -> Self {
        AggregatedData {
            timestamp,
            processes: Vec::new(),
            ports: Vec::new(),
            system: None,
            systemd_units: Vec::new(),
            containers: Vec::new(),
            pods: Vec::new(),
        }
    }
}
