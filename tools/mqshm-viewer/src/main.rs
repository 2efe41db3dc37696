// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! mqshm-viewer - inspect mqshm shared memory segments.
//!
//! Scans `/dev/shm` for the global registry, buffer pools and port
//! queues and decodes each header. Headers are little-endian by contract
//! (the runtime refuses big-endian targets), so a plain `read` of the
//! first cache line is enough - the viewer never maps the segments it
//! inspects and can safely probe half-dead ones.

use clap::Parser;
use colored::Colorize;
use std::ffi::CString;
use std::fmt::Write as _;

/// Magic word stamped at offset 0 of every mqshm header ("MQSH").
const MAGIC: u32 = 0x4D51_5348;

/// How much of a segment the probe reads: one cache line covers every
/// field the viewer decodes.
const HEADER_PROBE: usize = 64;

/// Inspect mqshm shared memory segments
#[derive(Parser, Debug)]
#[command(name = "mqshm-viewer", version)]
#[command(about = "Inspect mqshm shared memory segments")]
struct Cli {
    /// Inspect a single segment by name instead of scanning /dev/shm
    segment: Option<String>,

    /// Emit one JSON object per segment instead of the table
    #[arg(long)]
    json: bool,

    /// Include the raw magic and version words
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let names = match &cli.segment {
        Some(name) => vec![name.trim_start_matches('/').to_string()],
        None => match scan_shm_dir() {
            Ok(names) => names,
            Err(e) => {
                eprintln!("{}: {e}", "error".red().bold());
                std::process::exit(1);
            }
        },
    };

    if names.is_empty() {
        println!("{}", "no mqshm segments in /dev/shm".yellow());
        return;
    }

    let entries: Vec<Entry> = names.iter().map(|name| Entry::probe(name)).collect();

    if cli.json {
        for entry in &entries {
            println!("{}", entry.to_json());
        }
    } else {
        print_table(&entries, cli.verbose);
    }
}

/// All mqshm segment names currently present, sorted.
fn scan_shm_dir() -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir("/dev/shm")? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if name.starts_with("mqshm_") {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// One probed segment.
struct Entry {
    name: String,
    bytes: u64,
    report: Report,
}

/// Decoded view of a segment header, by segment kind.
enum Report {
    Registry {
        total_size: u64,
        created_ns: u64,
        raw: RawWords,
    },
    Pool {
        pool_id: u32,
        block_size: u64,
        block_count: u64,
        free_count: u32,
        raw: RawWords,
    },
    Port {
        port_id: u32,
        capacity: u64,
        tail: u64,
        consumers: u32,
        owner_pid: u32,
        owner_alive: bool,
        raw: RawWords,
    },
    /// mqshm-prefixed but not a layout this viewer knows
    Opaque { raw: RawWords },
    Unreadable { reason: String },
}

/// Magic and version words shared by every header.
struct RawWords {
    magic: u32,
    version: u32,
}

impl RawWords {
    fn ok(&self) -> bool {
        self.magic == MAGIC
    }
}

impl Entry {
    fn probe(name: &str) -> Self {
        let bytes = std::fs::metadata(format!("/dev/shm/{name}"))
            .map(|m| m.len())
            .unwrap_or(0);
        let report = match read_header_bytes(name) {
            Ok(header) => decode(name, &header),
            Err(reason) => Report::Unreadable { reason },
        };
        Self {
            name: name.to_string(),
            bytes,
            report,
        }
    }

    fn kind(&self) -> &'static str {
        match self.report {
            Report::Registry { .. } => "registry",
            Report::Pool { .. } => "pool",
            Report::Port { .. } => "port",
            Report::Opaque { .. } => "other",
            Report::Unreadable { .. } => "error",
        }
    }

    /// One JSON object, no trailing newline.
    fn to_json(&self) -> String {
        let mut out = String::from("{");
        let _ = write!(
            out,
            "\"name\":\"{}\",\"kind\":\"{}\",\"bytes\":{}",
            json_escape(&self.name),
            self.kind(),
            self.bytes
        );
        match &self.report {
            Report::Registry {
                total_size,
                created_ns,
                raw,
            } => {
                let _ = write!(
                    out,
                    ",\"valid\":{},\"total_size\":{total_size},\"created_ns\":{created_ns}",
                    raw.ok()
                );
            }
            Report::Pool {
                pool_id,
                block_size,
                block_count,
                free_count,
                raw,
            } => {
                let _ = write!(
                    out,
                    ",\"valid\":{},\"pool_id\":{pool_id},\"block_size\":{block_size},\
                     \"block_count\":{block_count},\"free_count\":{free_count}",
                    raw.ok()
                );
            }
            Report::Port {
                port_id,
                capacity,
                tail,
                consumers,
                owner_pid,
                owner_alive,
                raw,
            } => {
                let _ = write!(
                    out,
                    ",\"valid\":{},\"port_id\":{port_id},\"capacity\":{capacity},\
                     \"tail\":{tail},\"consumers\":{consumers},\
                     \"owner_pid\":{owner_pid},\"owner_alive\":{owner_alive}",
                    raw.ok()
                );
            }
            Report::Opaque { raw } => {
                let _ = write!(out, ",\"valid\":{}", raw.ok());
            }
            Report::Unreadable { reason } => {
                let _ = write!(out, ",\"error\":\"{}\"", json_escape(reason));
            }
        }
        out.push('}');
        out
    }
}

/// Pull the first cache line of a segment through a plain read.
fn read_header_bytes(name: &str) -> Result<[u8; HEADER_PROBE], String> {
    let c_name =
        CString::new(format!("/{name}")).map_err(|_| "name contains NUL".to_string())?;

    // SAFETY: read-only fd, buffer of exactly HEADER_PROBE bytes, fd
    // closed on every path. No mapping is created.
    unsafe {
        let fd = libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0);
        if fd < 0 {
            return Err("cannot open".to_string());
        }

        let mut buf = [0u8; HEADER_PROBE];
        let mut got = 0usize;
        while got < HEADER_PROBE {
            let n = libc::read(fd, buf.as_mut_ptr().add(got).cast(), HEADER_PROBE - got);
            if n <= 0 {
                break;
            }
            got += n as usize;
        }
        libc::close(fd);

        if got < HEADER_PROBE {
            return Err(format!("short header ({got} bytes)"));
        }
        Ok(buf)
    }
}

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

fn u64_at(bytes: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
}

/// Decode the header fields for the segment kind implied by its name.
/// Field offsets follow the `#[repr(C)]` headers in the mqshm crate.
fn decode(name: &str, bytes: &[u8; HEADER_PROBE]) -> Report {
    let raw = RawWords {
        magic: u32_at(bytes, 0),
        version: u32_at(bytes, 4),
    };

    if name == "mqshm_global_registry" {
        Report::Registry {
            total_size: u64_at(bytes, 8),
            created_ns: u64_at(bytes, 16),
            raw,
        }
    } else if name.starts_with("mqshm_pool_") {
        Report::Pool {
            pool_id: u32_at(bytes, 8),
            block_size: u64_at(bytes, 16),
            block_count: u64_at(bytes, 24),
            free_count: u32_at(bytes, 48),
            raw,
        }
    } else if name.starts_with("mqshm_port_") {
        let owner_pid = u32_at(bytes, 24);
        Report::Port {
            port_id: u32_at(bytes, 8),
            capacity: u64_at(bytes, 16),
            tail: u64_at(bytes, 32),
            consumers: u32_at(bytes, 28),
            owner_pid,
            owner_alive: pid_alive(owner_pid),
            raw,
        }
    } else {
        Report::Opaque { raw }
    }
}

/// kill(pid, 0) liveness probe; EPERM still means the process exists.
fn pid_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // SAFETY: signal 0 performs permission checks only, nothing is sent.
    if unsafe { libc::kill(pid as libc::pid_t, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn print_table(entries: &[Entry], verbose: bool) {
    println!();
    println!(
        "{} {} {}  {}",
        format!("{:<9}", "KIND").bold(),
        format!("{:<42}", "NAME").bold(),
        format!("{:>9}", "SIZE").bold(),
        "DETAILS".bold()
    );

    let mut total_bytes = 0u64;
    let mut pools = 0usize;
    let mut ports = 0usize;
    let mut invalid = 0usize;

    for entry in entries {
        total_bytes += entry.bytes;

        let kind = format!("{:<9}", entry.kind());
        let kind = match entry.report {
            Report::Registry { .. } => kind.magenta(),
            Report::Pool { .. } => {
                pools += 1;
                kind.green()
            }
            Report::Port { .. } => {
                ports += 1;
                kind.blue()
            }
            Report::Opaque { .. } => kind.yellow(),
            Report::Unreadable { .. } => kind.red(),
        };

        let mut details = String::new();
        match &entry.report {
            Report::Registry {
                total_size,
                created_ns,
                raw,
            } => {
                let _ = write!(
                    details,
                    "declared {}  created_ns={created_ns}",
                    human_bytes(*total_size)
                );
                if !raw.ok() {
                    invalid += 1;
                    details.push_str(&format!("  {}", "bad magic".red()));
                }
            }
            Report::Pool {
                pool_id,
                block_size,
                block_count,
                free_count,
                raw,
            } => {
                let used = block_count.saturating_sub(u64::from(*free_count));
                let _ = write!(
                    details,
                    "id={pool_id}  {block_count} x {}  used={used} free={free_count}",
                    human_bytes(*block_size)
                );
                if !raw.ok() {
                    invalid += 1;
                    details.push_str(&format!("  {}", "bad magic".red()));
                }
            }
            Report::Port {
                port_id,
                capacity,
                tail,
                consumers,
                owner_pid,
                owner_alive,
                raw,
            } => {
                let owner = if *owner_pid == 0 {
                    "unclaimed".yellow()
                } else if *owner_alive {
                    format!("pid {owner_pid}").green()
                } else {
                    format!("pid {owner_pid} DEAD").red()
                };
                let _ = write!(
                    details,
                    "id={port_id}  cap={capacity} tail={tail} consumers={consumers} owner={owner}"
                );
                if !raw.ok() {
                    invalid += 1;
                    details.push_str(&format!("  {}", "bad magic".red()));
                }
            }
            Report::Opaque { raw } => {
                if raw.ok() {
                    details.push_str("unrecognized layout");
                } else {
                    invalid += 1;
                    details.push_str(&format!("{}", "bad magic".red()));
                }
            }
            Report::Unreadable { reason } => {
                let _ = write!(details, "{}", reason.red());
            }
        }

        if verbose {
            if let Some(raw) = entry.raw_words() {
                let _ = write!(
                    details,
                    "  [magic=0x{:08X} version=0x{:08X}]",
                    raw.magic, raw.version
                );
            }
        }

        println!(
            "{kind} {} {:>9}  {details}",
            format!("{:<42}", entry.name).cyan(),
            human_bytes(entry.bytes)
        );
    }

    println!();
    let summary = format!(
        "{} segments ({pools} pools, {ports} ports), {} total",
        entries.len(),
        human_bytes(total_bytes)
    );
    if invalid > 0 {
        println!("{}  {}", summary.dimmed(), format!("{invalid} invalid").red());
    } else {
        println!("{}", summary.dimmed());
    }
    println!();
}

impl Entry {
    fn raw_words(&self) -> Option<&RawWords> {
        match &self.report {
            Report::Registry { raw, .. }
            | Report::Pool { raw, .. }
            | Report::Port { raw, .. }
            | Report::Opaque { raw } => Some(raw),
            Report::Unreadable { .. } => None,
        }
    }
}

/// Binary-unit size rendering: exact byte counts stay exact, larger
/// values step through KiB/MiB/GiB.
fn human_bytes(n: u64) -> String {
    const UNITS: [&str; 3] = ["KiB", "MiB", "GiB"];
    if n < 1024 {
        return format!("{n} B");
    }
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit - 1])
}

/// Minimal JSON string escaping (quotes, backslashes, control bytes).
fn json_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}
