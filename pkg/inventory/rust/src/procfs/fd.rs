// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Helpers for information located in /proc/<pid>/fd

use std::collections::{HashMap, HashSet};
use std::fs::{read_dir, read_link};
use std::path::Path;

use log::trace;

use crate::context::Context;
use crate::model::Pid;
use crate::procfs::{pid_path, pids};

pub type Ino = u64;

pub fn socket_inode(link: &Path) -> Option<Ino> {
    link.to_str()?
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

pub fn count_fds(root: &Path, pid: Pid) -> std::io::Result<usize> {
    Ok(read_dir(pid_path(root, pid).join("fd"))?.count())
}

/// Maps each wanted socket inode to the first pid (in ascending pid order)
/// holding a descriptor on it.
///
/// The scan stops early once every inode is resolved, and stops with what it
/// has found so far when `ctx` is done. Processes whose descriptors cannot be
/// listed are skipped.
pub fn socket_owners(root: &Path, wanted: &HashSet<Ino>, ctx: &Context) -> HashMap<Ino, Pid> {
    let mut owners = HashMap::with_capacity(wanted.len());
    if wanted.is_empty() {
        return owners;
    }

    let Ok(pids) = pids(root) else {
        return owners;
    };

    for pid in pids {
        if ctx.is_done() {
            trace!("socket owner scan interrupted at pid {pid}");
            break;
        }

        let Ok(entries) = read_dir(pid_path(root, pid).join("fd")) else {
            continue;
        };

        for entry in entries.filter_map(|entry| entry.ok()) {
            let Some(inode) = read_link(entry.path())
                .ok()
                .and_then(|link| socket_inode(&link))
            else {
                continue;
            };
            if wanted.contains(&inode) {
                owners.entry(inode).or_insert(pid);
            }
        }

        if owners.len() == wanted.len() {
            break;
        }
    }

    owners
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::symlink;
    use std::path::PathBuf;

    fn link_fd(root: &Path, pid: Pid, fd: u32, target: &str) {
        let dir = pid_path(root, pid).join("fd");
        fs::create_dir_all(&dir).unwrap();
        symlink(target, dir.join(fd.to_string())).unwrap();
    }

    #[test]
    fn test_socket_inode() {
        assert_eq!(socket_inode(&PathBuf::from("socket:[12345]")), Some(12345));
        assert_eq!(socket_inode(&PathBuf::from("pipe:[12345]")), None);
        assert_eq!(socket_inode(&PathBuf::from("socket:[abc]")), None);
        assert_eq!(socket_inode(&PathBuf::from("/dev/null")), None);
    }

    #[test]
    fn test_socket_owners_first_pid_wins() {
        let root = tempfile::tempdir().unwrap();
        link_fd(root.path(), 300, 3, "socket:[777]");
        link_fd(root.path(), 20, 4, "socket:[777]");
        link_fd(root.path(), 20, 5, "socket:[888]");
        link_fd(root.path(), 20, 0, "/dev/null");

        let wanted = HashSet::from([777, 888, 999]);
        let owners = socket_owners(root.path(), &wanted, &Context::background());

        assert_eq!(owners.get(&777), Some(&20));
        assert_eq!(owners.get(&888), Some(&20));
        assert_eq!(owners.get(&999), None);
    }

    #[test]
    fn test_socket_owners_canceled() {
        let root = tempfile::tempdir().unwrap();
        link_fd(root.path(), 1, 3, "socket:[1]");

        let ctx = Context::background();
        ctx.cancel();
        let owners = socket_owners(root.path(), &HashSet::from([1]), &ctx);
        assert!(owners.is_empty());
    }

    #[test]
    fn test_count_fds() {
        let root = tempfile::tempdir().unwrap();
        link_fd(root.path(), 5, 0, "/dev/null");
        link_fd(root.path(), 5, 1, "/dev/null");
        assert_eq!(count_fds(root.path(), 5).unwrap(), 2);
    }
}
