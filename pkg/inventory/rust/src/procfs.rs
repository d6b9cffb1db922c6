// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

pub mod fd;

use std::collections::HashMap;
use std::env;
use std::ffi::c_long;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::model::Pid;

static PROC_ROOT: OnceLock<PathBuf> = OnceLock::new();

static CLOCK_TICKS: OnceLock<u64> = OnceLock::new();

/// Used when `_SC_CLK_TCK` cannot be read.
pub const DEFAULT_CLOCK_TICKS: u64 = 100;

/// Ticks per second used by the kernel for /proc/<pid>/stat time fields.
pub fn clock_ticks() -> u64 {
    *CLOCK_TICKS.get_or_init(|| {
        ticks_or_default(nix::unistd::sysconf(nix::unistd::SysconfVar::CLK_TCK))
    })
}

fn ticks_or_default(ticks: nix::Result<Option<c_long>>) -> u64 {
    ticks
        .ok()
        .flatten()
        .and_then(|ticks| u64::try_from(ticks).ok())
        .filter(|ticks| *ticks > 0)
        .unwrap_or(DEFAULT_CLOCK_TICKS)
}

pub fn root_path() -> &'static Path {
    PROC_ROOT.get_or_init(|| {
        if let Ok(v) = env::var("HOST_PROC") {
            return v.into();
        }

        if env::var("DOCKER_DD_AGENT").is_ok() && Path::new("/host").exists() {
            return "/host/proc".into();
        }

        "/proc".into()
    })
}

/// Lists the numeric entries of the process table, in ascending pid order.
pub fn pids(root: &Path) -> io::Result<Vec<Pid>> {
    let mut pids: Vec<Pid> = fs::read_dir(root)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse::<Pid>().ok())
        .filter(|pid| *pid > 0)
        .collect();
    pids.sort_unstable();
    Ok(pids)
}

pub fn pid_path(root: &Path, pid: Pid) -> PathBuf {
    root.join(pid.to_string())
}

/// Reads the command line of a process as a single space-separated string.
pub fn read_cmdline(root: &Path, pid: Pid) -> io::Result<String> {
    let raw = fs::read(pid_path(root, pid).join("cmdline"))?;
    Ok(format_cmdline(&raw))
}

fn format_cmdline(raw: &[u8]) -> String {
    // Processes that rewrite their argv may leave trailing null bytes.
    let end = raw.iter().rposition(|b| *b != 0).map_or(0, |pos| pos + 1);
    let trimmed = raw.get(..end).unwrap_or_default();
    String::from_utf8_lossy(trimmed).replace('\0', " ")
}

pub fn read_exe(root: &Path, pid: Pid) -> io::Result<PathBuf> {
    fs::read_link(pid_path(root, pid).join("exe"))
}

pub fn read_cwd(root: &Path, pid: Pid) -> io::Result<PathBuf> {
    fs::read_link(pid_path(root, pid).join("cwd"))
}

/// Subset of /proc/<pid>/status.
#[derive(Debug, Default, PartialEq)]
pub struct Status {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    /// Resident and virtual memory in bytes, 0 for kernel threads.
    pub vm_rss: u64,
    pub vm_size: u64,
}

pub fn read_status(root: &Path, pid: Pid) -> io::Result<Status> {
    let contents = fs::read_to_string(pid_path(root, pid).join("status"))?;
    Ok(parse_status(&contents))
}

pub fn parse_status(contents: &str) -> Status {
    let mut status = Status::default();
    for line in contents.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key {
            "Name" => status.name = value.trim().to_string(),
            // Real, effective, saved, filesystem; the real id is reported.
            "Uid" => status.uid = first_number(value).unwrap_or_default(),
            "Gid" => status.gid = first_number(value).unwrap_or_default(),
            "VmRSS" => status.vm_rss = kilobytes(value).unwrap_or_default(),
            "VmSize" => status.vm_size = kilobytes(value).unwrap_or_default(),
            _ => {}
        }
    }
    status
}

fn first_number(value: &str) -> Option<u32> {
    value.split_whitespace().next()?.parse().ok()
}

fn kilobytes(value: &str) -> Option<u64> {
    let kb: u64 = value.split_whitespace().next()?.parse().ok()?;
    Some(kb.saturating_mul(1024))
}

/// Parses /proc/meminfo into a map of byte values.
pub fn parse_meminfo(contents: &str) -> HashMap<&str, u64> {
    contents
        .lines()
        .filter_map(|line| {
            let (key, rest) = line.split_once(':')?;
            let mut parts = rest.split_whitespace();
            let value: u64 = parts.next()?.parse().ok()?;
            let value = match parts.next() {
                Some("kB") => value.saturating_mul(1024),
                _ => value,
            };
            Some((key, value))
        })
        .collect()
}

pub fn read_boot_time(root: &Path) -> io::Result<u64> {
    let contents = fs::read_to_string(root.join("stat"))?;
    contents
        .lines()
        .find_map(|line| line.strip_prefix("btime ")?.trim().parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "btime not found"))
}

/// Resolves uids to user names, remembering previous answers.
#[derive(Debug, Default)]
pub struct UserCache {
    names: HashMap<u32, String>,
}

impl UserCache {
    pub fn name(&mut self, uid: u32) -> String {
        self.names
            .entry(uid)
            .or_insert_with(|| {
                uzers::get_user_by_uid(uid)
                    .map(|user| user.name().to_string_lossy().into_owned())
                    .unwrap_or_else(|| uid.to_string())
            })
            .clone()
    }
}

/// Identity of a process owning a socket. Every field is best-effort and
/// left empty when the process table denies access or the process is gone.
#[derive(Debug, Default, PartialEq)]
pub struct Owner {
    pub name: String,
    pub cmdline: String,
    pub exe: String,
    pub username: String,
}

pub fn read_owner(root: &Path, pid: Pid, users: &mut UserCache) -> Owner {
    let mut owner = Owner {
        cmdline: read_cmdline(root, pid).unwrap_or_default(),
        exe: read_exe(root, pid)
            .map(|exe| exe.to_string_lossy().into_owned())
            .unwrap_or_default(),
        ..Owner::default()
    };
    if let Ok(status) = read_status(root, pid) {
        owner.username = users.name(status.uid);
        owner.name = status.name;
    }
    owner
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    /// Writes a minimal process entry under a fake process-table root.
    pub(crate) fn write_process(root: &Path, pid: Pid, name: &str, uid: u32, cmdline: &[&str]) {
        let dir = pid_path(root, pid);
        fs::create_dir_all(dir.join("fd")).unwrap();
        fs::write(
            dir.join("status"),
            format!("Name:\t{name}\nState:\tS (sleeping)\nUid:\t{uid}\t{uid}\t{uid}\t{uid}\nGid:\t{uid}\t{uid}\t{uid}\t{uid}\n"),
        )
        .unwrap();
        let mut raw = cmdline.join("\0");
        raw.push('\0');
        fs::write(dir.join("cmdline"), raw).unwrap();
        symlink(format!("/usr/bin/{name}"), dir.join("exe")).unwrap();
    }

    #[test]
    fn test_format_cmdline() {
        assert_eq!(format_cmdline(b"nginx\0-g\0daemon off;\0"), "nginx -g daemon off;");
        assert_eq!(format_cmdline(b"gunicorn: master [app]\0\0\0"), "gunicorn: master [app]");
        assert_eq!(format_cmdline(b""), "");
        assert_eq!(format_cmdline(b"\0\0"), "");
    }

    #[test]
    fn test_clock_ticks() {
        assert_eq!(ticks_or_default(Ok(Some(250))), 250);
        assert_eq!(ticks_or_default(Ok(None)), DEFAULT_CLOCK_TICKS);
        assert_eq!(ticks_or_default(Ok(Some(0))), DEFAULT_CLOCK_TICKS);
        assert_eq!(ticks_or_default(Ok(Some(-1))), DEFAULT_CLOCK_TICKS);
        assert_eq!(
            ticks_or_default(Err(nix::errno::Errno::EINVAL)),
            DEFAULT_CLOCK_TICKS
        );
        assert!(clock_ticks() > 0);
    }

    #[test]
    fn test_parse_status() {
        let status = parse_status(
            "Name:\tsshd\nUmask:\t0022\nState:\tS (sleeping)\nUid:\t1000\t1001\t1001\t1001\nGid:\t50\t50\t50\t50\nVmSize:\t   15000 kB\nVmRSS:\t    6000 kB\n",
        );
        assert_eq!(
            status,
            Status {
                name: "sshd".to_string(),
                uid: 1000,
                gid: 50,
                vm_rss: 6000 * 1024,
                vm_size: 15000 * 1024,
            }
        );
    }

    #[test]
    fn test_parse_meminfo() {
        let info = parse_meminfo("MemTotal:       16000 kB\nMemFree:         4000 kB\nHugePages_Total:       0\n");
        assert_eq!(info.get("MemTotal"), Some(&(16000 * 1024)));
        assert_eq!(info.get("MemFree"), Some(&(4000 * 1024)));
        assert_eq!(info.get("HugePages_Total"), Some(&0));
    }

    #[test]
    fn test_pids_skips_non_numeric() {
        let root = tempfile::tempdir().unwrap();
        for name in ["1", "42", "7", "self", "net", "sys"] {
            fs::create_dir(root.path().join(name)).unwrap();
        }
        assert_eq!(pids(root.path()).unwrap(), vec![1, 7, 42]);
    }

    #[test]
    fn test_read_owner() {
        let root = tempfile::tempdir().unwrap();
        write_process(root.path(), 1234, "nginx", 0, &["nginx", "-g", "daemon off;"]);

        let owner = read_owner(root.path(), 1234, &mut UserCache::default());
        assert_eq!(owner.name, "nginx");
        assert_eq!(owner.cmdline, "nginx -g daemon off;");
        assert_eq!(owner.exe, "/usr/bin/nginx");
        assert_eq!(owner.username, "root");
    }

    #[test]
    fn test_read_owner_missing_process() {
        let root = tempfile::tempdir().unwrap();
        let owner = read_owner(root.path(), 99, &mut UserCache::default());
        assert_eq!(owner, Owner::default());
    }
}
