// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Service, socket and timer units managed by systemd, queried through
//! `systemctl`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

use super::Collector;
use crate::context::Context;
use crate::errors::Error;
use crate::model::{CollectionResult, SystemdUnitInfo};

const NAME: &str = "systemd";
const RELEVANT_SUFFIXES: [&str; 3] = [".service", ".socket", ".timer"];
const SHOW_PROPERTIES: &str = "Id,MainPID,ExecMainPID,MemoryCurrent,CPUUsageNSec,TasksCurrent";
const SHOW_BATCH: usize = 64;

pub fn is_relevant_unit(name: &str) -> bool {
    RELEVANT_SUFFIXES
        .iter()
        .any(|suffix| name.len() > suffix.len() && name.ends_with(suffix))
}

/// Parses `systemctl list-units --plain --no-legend` output.
pub fn parse_list_units(output: &str) -> Vec<SystemdUnitInfo> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let name = fields.next()?;
            let load_state = fields.next()?;
            let active_state = fields.next()?;
            let sub_state = fields.next()?;
            let description = fields.collect::<Vec<_>>().join(" ");
            Some(SystemdUnitInfo {
                name: name.to_string(),
                description,
                load_state: load_state.to_string(),
                active_state: active_state.to_string(),
                sub_state: sub_state.to_string(),
                ..SystemdUnitInfo::default()
            })
        })
        .filter(|unit| is_relevant_unit(&unit.name))
        .collect()
}

/// Parses `systemctl show` output for several units: blocks of `Key=Value`
/// lines separated by blank lines, keyed by their `Id`.
pub fn parse_show(output: &str) -> HashMap<String, HashMap<String, String>> {
    let mut units = HashMap::new();
    let mut current: HashMap<String, String> = HashMap::new();

    let mut flush = |block: &mut HashMap<String, String>| {
        if let Some(id) = block.get("Id").cloned() {
            units.insert(id, std::mem::take(block));
        }
        block.clear();
    };

    for line in output.lines() {
        if line.trim().is_empty() {
            flush(&mut current);
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            current.insert(key.to_string(), value.to_string());
        }
    }
    flush(&mut current);
    units
}

/// Unset numeric properties are printed as `[not set]` or as `UINT64_MAX`.
fn property<T: std::str::FromStr>(props: &HashMap<String, String>, key: &str) -> Option<T> {
    let value = props.get(key)?;
    if value == &u64::MAX.to_string() {
        return None;
    }
    value.parse().ok()
}

pub fn apply_properties(unit: &mut SystemdUnitInfo, props: &HashMap<String, String>) {
    unit.main_pid = property(props, "MainPID").unwrap_or_default();
    unit.exec_main_pid = property(props, "ExecMainPID").unwrap_or_default();
    unit.memory_current = property(props, "MemoryCurrent").unwrap_or_default();
    unit.cpu_usage_nsec = property(props, "CPUUsageNSec").unwrap_or_default();
    unit.tasks_current = property(props, "TasksCurrent").unwrap_or_default();
}

pub struct SystemdCollector {
    systemctl: PathBuf,
}

impl SystemdCollector {
    /// Fails unless the host was booted with systemd and `systemctl` runs.
    pub async fn connect(systemctl: &Path, run_root: &Path) -> Result<Self, Error> {
        let marker = run_root.join("systemd/system");
        if !marker.is_dir() {
            return Err(Error::unavailable(
                NAME,
                format!("{} does not exist", marker.display()),
            ));
        }

        let collector = SystemdCollector {
            systemctl: systemctl.to_path_buf(),
        };
        let ctx = Context::background().with_timeout(Duration::from_secs(5));
        collector
            .systemctl(&["--version"], &ctx)
            .await
            .map_err(|e| Error::unavailable(NAME, e))?;

        Ok(collector)
    }

    async fn systemctl(&self, args: &[&str], ctx: &Context) -> Result<String, Error> {
        let command_error = |reason: String| Error::Command {
            command: format!("{} {}", self.systemctl.display(), args.join(" ")),
            reason,
        };

        let output = Command::new(&self.systemctl)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = ctx.run(output).await?.map_err(|e| command_error(e.to_string()))?;

        if !output.status.success() {
            return Err(command_error(output.status.to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Collector for SystemdCollector {
    fn name(&self) -> &str {
        NAME
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(30)
    }

    async fn collect(&self, ctx: &Context) -> Result<CollectionResult, Error> {
        let listing = self
            .systemctl(
                &[
                    "list-units",
                    "--all",
                    "--plain",
                    "--no-legend",
                    "--no-pager",
                    "--type=service,socket,timer",
                ],
                ctx,
            )
            .await?;
        let mut units = parse_list_units(&listing);

        let active: Vec<String> = units
            .iter()
            .filter(|unit| unit.active_state == "active")
            .map(|unit| unit.name.clone())
            .collect();

        let mut properties = HashMap::new();
        for batch in active.chunks(SHOW_BATCH) {
            let property_arg = format!("--property={SHOW_PROPERTIES}");
            let mut args = vec!["show", property_arg.as_str()];
            args.extend(batch.iter().map(String::as_str));
            match self.systemctl(&args, ctx).await {
                Ok(output) => properties.extend(parse_show(&output)),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => debug!("[{NAME}] {e}"),
            }
        }

        for unit in units.iter_mut() {
            if let Some(props) = properties.get(&unit.name) {
                apply_properties(unit, props);
            }
        }

        debug!("[{NAME}] found {} units", units.len());
        Ok(CollectionResult {
            systemd_units: units,
            ..CollectionResult::default()
        })
    }
}
