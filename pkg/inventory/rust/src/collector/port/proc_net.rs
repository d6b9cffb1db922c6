// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Sockets read straight from the kernel tables in /proc/net.

use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::net::Ipv4Addr;
use std::path::Path;

use log::{debug, trace};

use crate::errors::Error;
use crate::model::{PortInfo, Protocol};
use crate::procfs::fd::Ino;

const SOCKET_TABLES: [(&str, Protocol); 4] = [
    ("tcp", Protocol::Tcp),
    ("tcp6", Protocol::Tcp),
    ("udp", Protocol::Udp),
    ("udp6", Protocol::Udp),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TcpState {
    Established = 0x01,
    SynSent = 0x02,
    SynRecv = 0x03,
    FinWait1 = 0x04,
    FinWait2 = 0x05,
    TimeWait = 0x06,
    Close = 0x07,
    CloseWait = 0x08,
    LastAck = 0x09,
    Listen = 0x0A,
    Closing = 0x0B,
}

impl TcpState {
    fn from_code(code: u8) -> Option<Self> {
        use TcpState::*;
        Some(match code {
            0x01 => Established,
            0x02 => SynSent,
            0x03 => SynRecv,
            0x04 => FinWait1,
            0x05 => FinWait2,
            0x06 => TimeWait,
            0x07 => Close,
            0x08 => CloseWait,
            0x09 => LastAck,
            0x0A => Listen,
            0x0B => Closing,
            _ => return None,
        })
    }

    fn as_str(self) -> &'static str {
        use TcpState::*;
        match self {
            Established => "ESTABLISHED",
            SynSent => "SYN_SENT",
            SynRecv => "SYN_RECV",
            FinWait1 => "FIN_WAIT1",
            FinWait2 => "FIN_WAIT2",
            TimeWait => "TIME_WAIT",
            Close => "CLOSE",
            CloseWait => "CLOSE_WAIT",
            LastAck => "LAST_ACK",
            Listen => "LISTEN",
            Closing => "CLOSING",
        }
    }
}

pub fn state_name(code: u8) -> &'static str {
    TcpState::from_code(code).map_or("UNKNOWN", TcpState::as_str)
}

/// A socket table row: the port record (owner not yet resolved) and the
/// socket inode.
#[derive(Debug, PartialEq)]
pub struct SocketEntry {
    pub port: PortInfo,
    pub inode: Ino,
}

/// Reads the four socket tables under `net_root`. Missing tables are skipped;
/// the call fails only when none of them could be opened.
pub fn read_socket_tables(net_root: &Path) -> Result<Vec<SocketEntry>, Error> {
    let mut entries = Vec::new();
    let mut opened = 0;

    for (table, protocol) in SOCKET_TABLES {
        let path = net_root.join(table);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) => {
                debug!("could not open {}: {e}", path.display());
                continue;
            }
        };
        opened += 1;
        parse_socket_table(BufReader::new(file), protocol, &mut entries);
    }

    if opened == 0 {
        return Err(Error::SocketTables(net_root.to_path_buf()));
    }
    Ok(entries)
}

fn parse_socket_table<R: Read>(
    mut reader: BufReader<R>,
    protocol: Protocol,
    entries: &mut Vec<SocketEntry>,
) {
    let mut line_buf = String::with_capacity(256);

    // Skip the header line
    if reader.read_line(&mut line_buf).is_err() {
        return;
    }

    loop {
        line_buf.clear();
        match reader.read_line(&mut line_buf) {
            Ok(0) => break,
            Ok(_) => match parse_socket_line(&line_buf, protocol) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => continue,
                Err(e) => trace!("{e}"),
            },
            Err(_) => break,
        }
    }
}

/// Parses one socket table row. Returns `Ok(None)` for TCP sockets that are
/// not listening.
pub fn parse_socket_line(line: &str, protocol: Protocol) -> Result<Option<SocketEntry>, Error> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 10 {
        return Err(Error::socket_parsing(format!(
            "expected at least 10 fields, got {}",
            fields.len()
        )));
    }
    let (Some(local_address), Some(state), Some(inode)) =
        (fields.get(1), fields.get(3), fields.get(9))
    else {
        return Err(Error::socket_parsing("missing socket fields"));
    };

    let state = u8::from_str_radix(state, 16)
        .map_err(|_| Error::socket_parsing(format!("invalid socket state {state}")))?;
    if protocol == Protocol::Tcp && TcpState::from_code(state) != Some(TcpState::Listen) {
        return Ok(None);
    }

    let (address, port) = decode_address(local_address)?;
    let inode = inode
        .parse()
        .map_err(|_| Error::socket_parsing(format!("invalid inode {inode}")))?;

    let mut info = PortInfo::new(protocol, address, port);
    info.state = state_name(state).to_string();
    Ok(Some(SocketEntry { port: info, inode }))
}

/// Decodes `HEXADDR:HEXPORT` as written by the kernel. IPv4 addresses are
/// stored in host (little endian) byte order. IPv6 addresses are reported as
/// the unspecified address.
pub fn decode_address(local_address: &str) -> Result<(String, u16), Error> {
    let Some((address, port)) = local_address.split_once(':') else {
        return Err(Error::socket_parsing(format!(
            "no colon found in local address {local_address}"
        )));
    };

    let port = u16::from_str_radix(port, 16)
        .map_err(|_| Error::socket_parsing(format!("invalid port {port}")))?;

    let address = match address.len() {
        8 => {
            let raw = u32::from_str_radix(address, 16)
                .map_err(|_| Error::socket_parsing(format!("invalid address {address}")))?;
            Ipv4Addr::from(raw.to_le_bytes()).to_string()
        }
        32 => "::".to_string(),
        _ => {
            return Err(Error::socket_parsing(format!(
                "unexpected address length in {local_address}"
            )));
        }
    };

    Ok((address, port))
}
