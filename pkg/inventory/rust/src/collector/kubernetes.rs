// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Pods scheduled on this node, read from the kubelet API. Both the
//! read-only http port and the https port with a self-signed certificate
//! are accepted.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use serde::de::IgnoredAny;

use super::Collector;
use crate::context::Context;
use crate::errors::Error;
use crate::http::Endpoint;
use crate::model::{CollectionResult, KubeContainer, KubernetesPodInfo};

const NAME: &str = "kubernetes";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_KUBELET_URL: &str = "http://localhost:10255";

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Pod {
    metadata: Metadata,
    spec: Spec,
    status: Status,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Metadata {
    name: String,
    namespace: String,
    uid: String,
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct Spec {
    node_name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct Status {
    phase: String,
    #[serde(rename = "hostIP")]
    host_ip: String,
    #[serde(rename = "podIP")]
    pod_ip: String,
    start_time: String,
    container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ContainerStatus {
    name: String,
    #[serde(rename = "containerID")]
    container_id: String,
    image: String,
    ready: bool,
    restart_count: i32,
    state: ContainerState,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ContainerState {
    running: Option<IgnoredAny>,
    waiting: Option<IgnoredAny>,
    terminated: Option<IgnoredAny>,
}

impl ContainerState {
    fn as_str(&self) -> &'static str {
        if self.running.is_some() {
            "running"
        } else if self.waiting.is_some() {
            "waiting"
        } else if self.terminated.is_some() {
            "terminated"
        } else {
            "unknown"
        }
    }
}

impl From<Pod> for KubernetesPodInfo {
    fn from(pod: Pod) -> Self {
        KubernetesPodInfo {
            name: pod.metadata.name,
            namespace: pod.metadata.namespace,
            uid: pod.metadata.uid,
            node_name: pod.spec.node_name,
            host_ip: pod.status.host_ip,
            pod_ip: pod.status.pod_ip,
            phase: pod.status.phase,
            start_time: pod.status.start_time,
            labels: pod.metadata.labels.unwrap_or_default(),
            containers: pod
                .status
                .container_statuses
                .into_iter()
                .map(|status| KubeContainer {
                    state: status.state.as_str().to_string(),
                    name: status.name,
                    container_id: status.container_id,
                    image: status.image,
                    ready: status.ready,
                    restart_count: status.restart_count,
                })
                .collect(),
        }
    }
}

pub struct KubernetesCollector {
    endpoint: Endpoint,
}

impl KubernetesCollector {
    /// Checks the kubelet health endpoint.
    pub async fn connect(kubelet_url: &str) -> Result<Self, Error> {
        let endpoint = Endpoint::from_url(kubelet_url).map_err(|e| Error::unavailable(NAME, e))?;
        let ctx = Context::background().with_timeout(CONNECT_TIMEOUT);

        let (status, _) = endpoint
            .get("/healthz", &ctx)
            .await
            .map_err(|e| Error::unavailable(NAME, e))?;
        if !status.is_success() {
            return Err(Error::unavailable(
                NAME,
                format!("kubelet health check returned {status}"),
            ));
        }

        Ok(KubernetesCollector { endpoint })
    }
}

#[async_trait]
impl Collector for KubernetesCollector {
    fn name(&self) -> &str {
        NAME
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(30)
    }

    async fn collect(&self, ctx: &Context) -> Result<CollectionResult, Error> {
        let list: PodList = self.endpoint.get_json("/pods", "pod list", ctx).await?;
        let pods: Vec<KubernetesPodInfo> = list.items.into_iter().map(Into::into).collect();

        debug!("[{NAME}] found {} pods", pods.len());
        Ok(CollectionResult {
            pods,
            ..CollectionResult::default()
        })
    }
}
