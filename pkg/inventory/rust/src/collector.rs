// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

pub mod docker;
pub mod kubernetes;
pub mod port;
pub mod process;
pub mod system;
pub mod systemd;

use std::time::Duration;

use async_trait::async_trait;

use crate::context::Context;
use crate::errors::Error;
use crate::model::CollectionResult;

pub use docker::DockerCollector;
pub use kubernetes::KubernetesCollector;
pub use port::{PortCollector, PortCollectorConfig};
pub use process::ProcessCollector;
pub use system::SystemCollector;
pub use systemd::SystemdCollector;

/// A source of host facts. Each call to `collect` produces one partial
/// snapshot; an error means the source contributed nothing this tick.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Stable identifier used in logs.
    fn name(&self) -> &str;

    /// Preferred cadence. The manager drives every collector from one shared
    /// tick and only reports this value.
    fn interval(&self) -> Duration;

    async fn collect(&self, ctx: &Context) -> Result<CollectionResult, Error>;
}
