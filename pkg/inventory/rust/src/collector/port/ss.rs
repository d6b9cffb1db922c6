// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Listening sockets as reported by the `ss` socket statistics tool.

use std::process::Stdio;

use log::trace;
use tokio::process::Command;

use crate::context::Context;
use crate::errors::Error;
use crate::model::{Pid, PortInfo, Protocol};

use super::PortCollectorConfig;

/// Runs the socket statistics command and parses its output. Any failure to
/// run the command, including a non-zero exit, is an error.
pub(super) async fn list_sockets(
    config: &PortCollectorConfig,
    ctx: &Context,
) -> Result<Vec<PortInfo>, Error> {
    let display = format!("{} {}", config.command, config.args.join(" "));
    let output = Command::new(&config.command)
        .args(&config.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = ctx.run(output).await?.map_err(|e| Error::Command {
        command: display.clone(),
        reason: e.to_string(),
    })?;

    if !output.status.success() {
        return Err(Error::Command {
            command: display,
            reason: output.status.to_string(),
        });
    }

    Ok(parse_output(&String::from_utf8_lossy(&output.stdout)))
}

pub fn parse_output(output: &str) -> Vec<PortInfo> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let port = parse_line(line);
            if port.is_none() && !line.trim().is_empty() {
                trace!("skipping ss line: {line}");
            }
            port
        })
        .collect()
}

/// Parses one line, e.g.
/// `tcp LISTEN 0 128 0.0.0.0:8080 0.0.0.0:* users:(("nginx",pid=1234,fd=6))`
pub fn parse_line(line: &str) -> Option<PortInfo> {
    let mut fields = line.split_whitespace();
    let protocol = match fields.next()? {
        "tcp" | "tcp6" => Protocol::Tcp,
        "udp" | "udp6" => Protocol::Udp,
        _ => return None,
    };
    let state = fields.next()?;
    let local = fields.nth(2)?;

    let (address, port) = split_address(local)?;
    let mut info = PortInfo::new(protocol, address, port);
    info.state = state.to_string();

    if let Some((name, pid)) = line.find("users:").and_then(|pos| {
        line.get(pos..).and_then(parse_users)
    }) {
        info.process_name = name;
        info.pid = pid;
    }

    Some(info)
}

/// Splits `addr:port` or `[addr]:port`. A `*` address means every interface.
pub fn split_address(local: &str) -> Option<(String, u16)> {
    let (address, port) = match local.rsplit_once("]:") {
        Some((address, port)) => (address.strip_prefix('[').unwrap_or(address), port),
        None => local.rsplit_once(':')?,
    };
    let port = port.parse().ok()?;
    let address = if address == "*" { "0.0.0.0" } else { address };
    Some((address.to_string(), port))
}

/// Extracts the name and pid of the first process in a
/// `users:(("name",pid=N,fd=M),...)` annotation.
pub fn parse_users(users: &str) -> Option<(String, Pid)> {
    let tuple = users.strip_prefix("users:((")?;
    let tuple = tuple.split(')').next()?;

    let name = tuple
        .split('"')
        .nth(1)
        .map(str::to_string)
        .unwrap_or_default();

    let (_, pid) = tuple.split_once("pid=")?;
    let pid = pid.split(',').next()?.parse().ok()?;

    Some((name, pid))
}
