// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace};

use super::Collector;
use crate::context::Context;
use crate::errors::Error;
use crate::model::{CollectionResult, SystemInfo};
use crate::procfs;

const NAME: &str = "system";

/// Aggregate CPU time counters from the `cpu` line of /proc/stat, in ticks.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuTimes {
    fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    fn since(&self, earlier: &CpuTimes) -> CpuTimes {
        CpuTimes {
            user: self.user.saturating_sub(earlier.user),
            nice: self.nice.saturating_sub(earlier.nice),
            system: self.system.saturating_sub(earlier.system),
            idle: self.idle.saturating_sub(earlier.idle),
            iowait: self.iowait.saturating_sub(earlier.iowait),
            irq: self.irq.saturating_sub(earlier.irq),
            softirq: self.softirq.saturating_sub(earlier.softirq),
            steal: self.steal.saturating_sub(earlier.steal),
        }
    }

    /// Writes busy percentage and the user/system/idle/iowait breakdown.
    fn fill(&self, info: &mut SystemInfo) {
        let total = self.total();
        if total > 0 {
            let busy = total - self.idle - self.iowait;
            info.cpu_percent = 100.0 * busy as f64 / total as f64;
        }

        let breakdown = self.user + self.system + self.idle + self.iowait;
        if breakdown > 0 {
            let pct = |v: u64| 100.0 * v as f64 / breakdown as f64;
            info.cpu_user = pct(self.user);
            info.cpu_system = pct(self.system);
            info.cpu_idle = pct(self.idle);
            info.cpu_iowait = pct(self.iowait);
        }
    }
}

/// Returns the aggregate CPU times and the number of logical CPUs.
pub fn parse_cpu_times(stat: &str) -> Option<(CpuTimes, u32)> {
    let mut times = None;
    let mut count = 0;
    for line in stat.lines() {
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("cpu") => {
                let values: Vec<u64> = fields.filter_map(|v| v.parse().ok()).collect();
                let get = |i: usize| values.get(i).copied().unwrap_or_default();
                times = Some(CpuTimes {
                    user: get(0),
                    nice: get(1),
                    system: get(2),
                    idle: get(3),
                    iowait: get(4),
                    irq: get(5),
                    softirq: get(6),
                    steal: get(7),
                });
            }
            Some(name)
                if name
                    .strip_prefix("cpu")
                    .is_some_and(|n| n.chars().all(|c| c.is_ascii_digit())) =>
            {
                count += 1
            }
            _ => {}
        }
    }
    times.map(|t| (t, count))
}

pub fn parse_loadavg(contents: &str) -> Option<(f64, f64, f64)> {
    let mut fields = contents.split_whitespace();
    Some((
        fields.next()?.parse().ok()?,
        fields.next()?.parse().ok()?,
        fields.next()?.parse().ok()?,
    ))
}

/// Sums (rx bytes, rx packets, tx bytes, tx packets) over every interface.
pub fn parse_net_dev(contents: &str) -> (u64, u64, u64, u64) {
    let mut totals = (0, 0, 0, 0);
    for line in contents.lines().skip(2) {
        let Some((_, counters)) = line.split_once(':') else {
            continue;
        };
        let values: Vec<u64> = counters
            .split_whitespace()
            .filter_map(|v| v.parse().ok())
            .collect();
        let get = |i: usize| values.get(i).copied().unwrap_or_default();
        totals.0 += get(0);
        totals.1 += get(1);
        totals.2 += get(8);
        totals.3 += get(9);
    }
    totals
}

/// Sums bytes read and written over every block device.
pub fn parse_diskstats(contents: &str) -> (u64, u64) {
    const SECTOR_SIZE: u64 = 512;
    contents.lines().fold((0, 0), |(read, write), line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let sectors = |i: usize| -> u64 {
            fields
                .get(i)
                .and_then(|v| v.parse().ok())
                .unwrap_or_default()
        };
        (
            read + sectors(5) * SECTOR_SIZE,
            write + sectors(9) * SECTOR_SIZE,
        )
    })
}

pub fn parse_os_release_id(contents: &str) -> Option<String> {
    contents
        .lines()
        .find_map(|line| line.strip_prefix("ID="))
        .map(|id| id.trim().trim_matches('"').to_string())
}

fn read_trimmed(path: &Path) -> String {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    100.0 * used as f64 / total as f64
}

pub struct SystemCollector {
    proc_root: PathBuf,
    /// Filesystem root used for os-release and disk usage.
    host_root: PathBuf,
    previous_cpu: Arc<Mutex<Option<CpuTimes>>>,
}

impl Default for SystemCollector {
    fn default() -> Self {
        Self::new(procfs::root_path(), Path::new("/"))
    }
}

impl SystemCollector {
    pub fn new(proc_root: &Path, host_root: &Path) -> Self {
        SystemCollector {
            proc_root: proc_root.to_path_buf(),
            host_root: host_root.to_path_buf(),
            previous_cpu: Arc::new(Mutex::new(None)),
        }
    }

    fn gather(
        proc_root: &Path,
        host_root: &Path,
        previous_cpu: &Mutex<Option<CpuTimes>>,
    ) -> SystemInfo {
        let mut info = SystemInfo {
            hostname: read_trimmed(&proc_root.join("sys/kernel/hostname")),
            os: std::env::consts::OS.to_string(),
            kernel_version: read_trimmed(&proc_root.join("sys/kernel/osrelease")),
            boot_time: procfs::read_boot_time(proc_root).unwrap_or_default(),
            ..SystemInfo::default()
        };

        if let Ok(contents) = fs::read_to_string(host_root.join("etc/os-release")) {
            info.platform = parse_os_release_id(&contents).unwrap_or_default();
        }

        if let Some(uptime) = fs::read_to_string(proc_root.join("uptime"))
            .ok()
            .and_then(|s| s.split_whitespace().next()?.parse::<f64>().ok())
        {
            info.uptime = uptime as u64;
        }

        if let Some((times, count)) = fs::read_to_string(proc_root.join("stat"))
            .ok()
            .and_then(|s| parse_cpu_times(&s))
        {
            info.cpu_count = count;
            let mut previous = match previous_cpu.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let delta = match previous.as_ref() {
                Some(earlier) => times.since(earlier),
                None => times,
            };
            delta.fill(&mut info);
            *previous = Some(times);
        }

        if let Some((one, five, fifteen)) = fs::read_to_string(proc_root.join("loadavg"))
            .ok()
            .and_then(|s| parse_loadavg(&s))
        {
            info.load_avg_1 = one;
            info.load_avg_5 = five;
            info.load_avg_15 = fifteen;
        }

        if let Ok(contents) = fs::read_to_string(proc_root.join("meminfo")) {
            let mem = procfs::parse_meminfo(&contents);
            let get = |key: &str| mem.get(key).copied().unwrap_or_default();
            info.mem_total = get("MemTotal");
            info.mem_free = get("MemFree");
            info.mem_available = get("MemAvailable");
            info.mem_used = info.mem_total.saturating_sub(info.mem_available);
            info.mem_percent = percent(info.mem_used, info.mem_total);
            info.swap_total = get("SwapTotal");
            info.swap_used = info.swap_total.saturating_sub(get("SwapFree"));
            info.swap_percent = percent(info.swap_used, info.swap_total);
        }

        match nix::sys::statvfs::statvfs(host_root) {
            Ok(stat) => {
                let fragment = stat.fragment_size() as u64;
                let total = stat.blocks() as u64 * fragment;
                let free = stat.blocks_available() as u64 * fragment;
                let used = (stat.blocks() as u64).saturating_sub(stat.blocks_free() as u64) * fragment;
                info.disk_total = total;
                info.disk_free = free;
                info.disk_used = used;
                info.disk_percent = percent(used, used + free);
            }
            Err(e) => trace!("[{NAME}] statvfs {}: {e}", host_root.display()),
        }

        if let Ok(contents) = fs::read_to_string(proc_root.join("diskstats")) {
            (info.disk_read_bytes, info.disk_write_bytes) = parse_diskstats(&contents);
        }

        if let Ok(contents) = fs::read_to_string(proc_root.join("net/dev")) {
            (
                info.net_bytes_recv,
                info.net_packets_recv,
                info.net_bytes_sent,
                info.net_packets_sent,
            ) = parse_net_dev(&contents);
        }

        info
    }
}

#[async_trait]
impl Collector for SystemCollector {
    fn name(&self) -> &str {
        NAME
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(10)
    }

    async fn collect(&self, _ctx: &Context) -> Result<CollectionResult, Error> {
        let proc_root = self.proc_root.clone();
        let host_root = self.host_root.clone();
        let previous_cpu = Arc::clone(&self.previous_cpu);
        let info = tokio::task::spawn_blocking(move || {
            Self::gather(&proc_root, &host_root, &previous_cpu)
        })
        .await
        .map_err(|e| Error::Io(io::Error::other(e)))?;

        debug!(
            "[{NAME}] {} cpus, {:.1}% busy, {} bytes available",
            info.cpu_count, info.cpu_percent, info.mem_available
        );
        Ok(CollectionResult {
            system: Some(info),
            ..CollectionResult::default()
        })
    }
}
