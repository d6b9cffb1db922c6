// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use log::{info, warn};
use serde::Deserialize;

use crate::collector::kubernetes::DEFAULT_KUBELET_URL;
use crate::manager::DEFAULT_SUBSCRIBER_CAPACITY;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/datadog-agent/inventory.yaml";

fn default_listen() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_interval() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_subscriber_capacity() -> usize {
    DEFAULT_SUBSCRIBER_CAPACITY
}

fn default_ss_command() -> String {
    "ss".to_string()
}

fn default_ss_args() -> Vec<String> {
    vec!["-tulnp".to_string()]
}

fn default_docker_socket() -> PathBuf {
    PathBuf::from("/var/run/docker.sock")
}

fn default_kubelet_url() -> String {
    DEFAULT_KUBELET_URL.to_string()
}

fn default_systemctl() -> PathBuf {
    PathBuf::from("systemctl")
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    /// Address of the status API.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Seconds between collections.
    #[serde(default = "default_interval")]
    pub interval: u64,
    /// Seconds a collection may run before slow collectors are abandoned.
    /// Defaults to `interval`.
    #[serde(default)]
    pub tick_timeout: Option<u64>,
    #[serde(default)]
    pub log_level: Option<String>,
    /// Process table root, overriding HOST_PROC.
    #[serde(default)]
    pub host_proc: Option<PathBuf>,
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,
    #[serde(default)]
    pub collectors: CollectorsConfig,
    #[serde(default)]
    pub port: PortConfig,
    #[serde(default)]
    pub systemd: SystemdConfig,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub kubernetes: KubernetesConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CollectorsConfig {
    #[serde(default = "default_true")]
    pub process: bool,
    #[serde(default = "default_true")]
    pub port: bool,
    #[serde(default = "default_true")]
    pub system: bool,
    #[serde(default = "default_true")]
    pub systemd: bool,
    #[serde(default = "default_true")]
    pub docker: bool,
    #[serde(default)]
    pub kubernetes: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PortConfig {
    #[serde(default = "default_ss_command")]
    pub command: String,
    #[serde(default = "default_ss_args")]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SystemdConfig {
    #[serde(default = "default_systemctl")]
    pub systemctl: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DockerConfig {
    #[serde(default = "default_docker_socket")]
    pub socket: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct KubernetesConfig {
    #[serde(default = "default_kubelet_url")]
    pub kubelet_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            interval: default_interval(),
            tick_timeout: None,
            log_level: None,
            host_proc: None,
            subscriber_capacity: default_subscriber_capacity(),
            collectors: CollectorsConfig::default(),
            port: PortConfig::default(),
            systemd: SystemdConfig::default(),
            docker: DockerConfig::default(),
            kubernetes: KubernetesConfig::default(),
        }
    }
}

impl Default for CollectorsConfig {
    fn default() -> Self {
        Self {
            process: true,
            port: true,
            system: true,
            systemd: true,
            docker: true,
            kubernetes: false,
        }
    }
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            command: default_ss_command(),
            args: default_ss_args(),
        }
    }
}

impl Default for SystemdConfig {
    fn default() -> Self {
        Self {
            systemctl: default_systemctl(),
        }
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket: default_docker_socket(),
        }
    }
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            kubelet_url: default_kubelet_url(),
        }
    }
}

impl Config {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    pub fn tick_timeout(&self) -> Duration {
        Duration::from_secs(self.tick_timeout.unwrap_or(self.interval))
    }

    /// Applies `DD_INVENTORY_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(listen) = env::var("DD_INVENTORY_LISTEN") {
            self.listen = listen;
        }
        if let Ok(interval) = env::var("DD_INVENTORY_INTERVAL") {
            self.interval = interval
                .parse()
                .with_context(|| format!("invalid DD_INVENTORY_INTERVAL {interval:?}"))?;
        }
        if let Ok(socket) = env::var("DD_INVENTORY_DOCKER_SOCKET") {
            self.docker.socket = PathBuf::from(socket);
        }
        if let Ok(url) = env::var("DD_INVENTORY_KUBELET_URL") {
            self.kubernetes.kubelet_url = url;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.interval == 0 {
            bail!("interval must be at least 1 second");
        }
        if self.tick_timeout == Some(0) {
            bail!("tick_timeout must be at least 1 second");
        }
        Ok(())
    }
}

/// Where the loaded configuration came from. Config is loaded before the
/// logger exists, so the outcome is reported with `log` afterwards.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSource {
    File(PathBuf),
    /// The file at this path does not exist.
    Defaults(PathBuf),
}

impl ConfigSource {
    pub fn log(&self) {
        match self {
            ConfigSource::File(path) => info!("Loaded config from {}", path.display()),
            ConfigSource::Defaults(path) => warn!(
                "Config file not found at {}. Using defaults.",
                path.display()
            ),
        }
    }
}

/// Loads the configuration file, falling back to defaults when it does not
/// exist, then applies environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<(Config, ConfigSource)> {
    let path = path.unwrap_or(Path::new(DEFAULT_CONFIG_PATH));

    let (mut config, source) = if path.exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config =
            parse_config(&contents).with_context(|| format!("parsing {}", path.display()))?;
        (config, ConfigSource::File(path.to_path_buf()))
    } else {
        (Config::default(), ConfigSource::Defaults(path.to_path_buf()))
    };

    config.apply_env()?;
    config.validate()?;
    Ok((config, source))
}

pub fn parse_config(contents: &str) -> Result<Config> {
    // An empty file deserializes as null.
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    Ok(serde_yaml::from_str(contents)?)
}

fn parse_log_level(level: &str) -> log::Level {
    match level.to_lowercase().as_str() {
        "trace" => log::Level::Trace,
        "debug" => log::Level::Debug,
        "info" => log::Level::Info,
        "warn" | "warning" => log::Level::Warn,
        "error" | "critical" | "off" => log::Level::Error,
        _ => log::Level::Info,
    }
}

/// Priority: DD_LOG_LEVEL > LOG_LEVEL > YAML config > `--debug` > Info
pub fn get_log_level(config: &Config, debug_flag: bool) -> log::Level {
    if let Ok(level) = env::var("DD_LOG_LEVEL") {
        return parse_log_level(&level);
    }

    if let Ok(level) = env::var("LOG_LEVEL") {
        return parse_log_level(&level);
    }

    if let Some(level) = &config.log_level {
        return parse_log_level(level);
    }

    if debug_flag {
        log::Level::Debug
    } else {
        log::Level::Info
    }
}
