// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use log::{debug, trace};

use super::Collector;
use crate::context::Context;
use crate::errors::Error;
use crate::model::{CollectionResult, Pid, ProcessInfo};
use crate::procfs::{self, UserCache, fd::count_fds, pid_path};

const NAME: &str = "process";

/// Fields of /proc/<pid>/stat used by the collector.
#[derive(Debug, Default, PartialEq)]
pub struct Stat {
    pub comm: String,
    pub state: char,
    pub ppid: Pid,
    pub utime: u64,
    pub stime: u64,
    pub num_threads: u32,
    pub start_time: u64,
}

/// Parses a stat line. The command name may contain spaces and parentheses,
/// so fields are counted from the last closing parenthesis.
pub fn parse_stat(contents: &str) -> Option<Stat> {
    let open = contents.find('(')?;
    let close = contents.rfind(')')?;
    let comm = contents.get(open + 1..close)?.to_string();
    let rest: Vec<&str> = contents.get(close + 1..)?.split_whitespace().collect();

    // Indices are the stat(5) field numbers minus 3.
    let field = |n: usize| rest.get(n).copied();
    Some(Stat {
        comm,
        state: field(0)?.chars().next()?,
        ppid: field(1)?.parse().ok()?,
        utime: field(11)?.parse().ok()?,
        stime: field(12)?.parse().ok()?,
        num_threads: field(17)?.parse().ok()?,
        start_time: field(19)?.parse().ok()?,
    })
}

pub fn status_name(state: char) -> &'static str {
    match state {
        'R' => "running",
        'S' => "sleeping",
        'D' => "disk-sleep",
        'Z' => "zombie",
        'T' => "stopped",
        't' => "tracing-stop",
        'X' | 'x' => "dead",
        'I' => "idle",
        _ => "unknown",
    }
}

/// Extracts a short container id from a cgroup file, recognizing docker,
/// podman and kubernetes layouts.
pub fn container_id_from_cgroup(contents: &str) -> Option<String> {
    for line in contents.lines() {
        if let Some((_, id)) = line.split_once("/docker/") {
            if let Some(id) = short_id(id.trim()) {
                return Some(id);
            }
        }

        if let Some((_, rest)) = line.split_once("/libpod-") {
            let id = rest.split('.').next().unwrap_or_default();
            if let Some(id) = short_id(id) {
                return Some(id);
            }
        }

        if line.contains("/kubepods/") || line.contains("/kubepods.slice/") {
            let last = line.rsplit('/').next().unwrap_or_default();
            let last = last.strip_prefix("cri-containerd-").unwrap_or(last);
            let last = last.strip_prefix("docker-").unwrap_or(last);
            let last = last.strip_suffix(".scope").unwrap_or(last);
            if let Some(id) = short_id(last) {
                return Some(id);
            }
        }
    }
    None
}

fn short_id(id: &str) -> Option<String> {
    id.get(..12).map(str::to_string)
}

/// Returns the first `.service` or `.scope` path segment of a cgroup file.
pub fn systemd_unit_from_cgroup(contents: &str) -> Option<String> {
    contents
        .lines()
        .flat_map(|line| line.split('/'))
        .find(|part| part.ends_with(".service") || part.ends_with(".scope"))
        .map(|part| part.trim().to_string())
}

fn read_io(root: &Path, pid: Pid) -> io::Result<(u64, u64)> {
    let contents = fs::read_to_string(pid_path(root, pid).join("io"))?;
    let mut read = 0;
    let mut write = 0;
    for line in contents.lines() {
        match line.split_once(':') {
            Some(("read_bytes", value)) => read = value.trim().parse().unwrap_or_default(),
            Some(("write_bytes", value)) => write = value.trim().parse().unwrap_or_default(),
            _ => {}
        }
    }
    Ok((read, write))
}

/// Host-wide values needed to turn per-process counters into percentages.
struct HostClock {
    boot_time: u64,
    mem_total: u64,
    now_ms: i64,
    ticks: u64,
}

impl HostClock {
    fn read(root: &Path) -> Self {
        let mem_total = fs::read_to_string(root.join("meminfo"))
            .ok()
            .and_then(|contents| procfs::parse_meminfo(&contents).get("MemTotal").copied())
            .unwrap_or_default();
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or_default();
        HostClock {
            boot_time: procfs::read_boot_time(root).unwrap_or_default(),
            mem_total,
            now_ms,
            ticks: procfs::clock_ticks(),
        }
    }

    fn create_time_ms(&self, start_ticks: u64) -> i64 {
        let ms = self
            .boot_time
            .saturating_mul(1000)
            .saturating_add(start_ticks.saturating_mul(1000) / self.ticks);
        i64::try_from(ms).unwrap_or(i64::MAX)
    }

    /// CPU time over wall time since the process started.
    fn cpu_percent(&self, stat: &Stat, create_time_ms: i64) -> f64 {
        let elapsed = (self.now_ms - create_time_ms) as f64 / 1000.0;
        if elapsed <= 0.0 {
            return 0.0;
        }
        let cpu = (stat.utime + stat.stime) as f64 / self.ticks as f64;
        100.0 * cpu / elapsed
    }

    fn mem_percent(&self, rss: u64) -> f32 {
        if self.mem_total == 0 {
            return 0.0;
        }
        (100.0 * rss as f64 / self.mem_total as f64) as f32
    }
}

pub struct ProcessCollector {
    proc_root: PathBuf,
}

impl Default for ProcessCollector {
    fn default() -> Self {
        Self::new(procfs::root_path())
    }
}

impl ProcessCollector {
    pub fn new(proc_root: &Path) -> Self {
        ProcessCollector {
            proc_root: proc_root.to_path_buf(),
        }
    }

    fn read_process(
        root: &Path,
        pid: Pid,
        clock: &HostClock,
        users: &mut UserCache,
    ) -> Option<ProcessInfo> {
        // A process without a readable stat has exited since it was listed.
        let stat = fs::read_to_string(pid_path(root, pid).join("stat"))
            .ok()
            .and_then(|contents| parse_stat(&contents))?;
        let status = procfs::read_status(root, pid).unwrap_or_default();

        let create_time = clock.create_time_ms(stat.start_time);
        let mut info = ProcessInfo {
            pid,
            ppid: stat.ppid,
            name: if status.name.is_empty() {
                stat.comm.clone()
            } else {
                status.name
            },
            cmdline: procfs::read_cmdline(root, pid).unwrap_or_default(),
            exe: path_string(procfs::read_exe(root, pid)),
            cwd: path_string(procfs::read_cwd(root, pid)),
            username: users.name(status.uid),
            uid: status.uid,
            gid: status.gid,
            status: status_name(stat.state).to_string(),
            create_time,
            cpu_percent: clock.cpu_percent(&stat, create_time),
            mem_percent: clock.mem_percent(status.vm_rss),
            mem_rss: status.vm_rss,
            mem_vms: status.vm_size,
            num_fds: count_fds(root, pid)
                .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
                .unwrap_or_default(),
            num_threads: stat.num_threads,
            ..ProcessInfo::default()
        };

        if let Ok((read, write)) = read_io(root, pid) {
            info.io_read = read;
            info.io_write = write;
        }

        if let Ok(cgroup) = fs::read_to_string(pid_path(root, pid).join("cgroup")) {
            info.container_id = container_id_from_cgroup(&cgroup).unwrap_or_default();
            info.systemd_unit = systemd_unit_from_cgroup(&cgroup).unwrap_or_default();
        }

        Some(info)
    }

    fn scan(root: &Path, ctx: &Context) -> Result<Vec<ProcessInfo>, Error> {
        let pids = procfs::pids(root)?;
        let clock = HostClock::read(root);
        let mut users = UserCache::default();
        let mut processes = Vec::with_capacity(pids.len());

        for pid in pids {
            if ctx.is_done() {
                return Err(Error::Cancelled);
            }
            match Self::read_process(root, pid, &clock, &mut users) {
                Some(info) => processes.push(info),
                None => trace!("[{NAME}] pid {pid} vanished during scan"),
            }
        }
        Ok(processes)
    }
}

fn path_string(path: io::Result<PathBuf>) -> String {
    path.map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[async_trait]
impl Collector for ProcessCollector {
    fn name(&self) -> &str {
        NAME
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(10)
    }

    async fn collect(&self, ctx: &Context) -> Result<CollectionResult, Error> {
        let root = self.proc_root.clone();
        let scan_ctx = ctx.clone();
        let processes = tokio::task::spawn_blocking(move || Self::scan(&root, &scan_ctx))
            .await
            .map_err(|e| Error::Io(io::Error::other(e)))??;

        debug!("[{NAME}] found {} processes", processes.len());
        Ok(CollectionResult {
            processes,
            ..CollectionResult::default()
        })
    }
}
