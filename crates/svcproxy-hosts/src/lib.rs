//! Hosts-file rendering of the service registry
//!
//! Produces a block of `<ip>    <hostname>` lines between
//! `### START <TAG> ###` and `### END <TAG> ###` markers, and can splice
//! that block into an existing hosts file, replacing a previous block with
//! the same tag.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use svcproxy_router::RegistryEntry;
use thiserror::Error;
use tracing::{debug, info};

/// Marker tag used when none is configured
pub const DEFAULT_TAG: &str = "SVCPROXY";

#[derive(Debug, Error)]
pub enum HostsError {
    #[error("Failed to read hosts file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write hosts file {path}: {source}\n\nHint: updating the system hosts file usually requires root privileges")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Hosts file {path} has a START marker for {tag} without a matching END marker")]
    UnterminatedBlock { path: PathBuf, tag: String },
}

/// Location of the system hosts file
pub fn default_hosts_path() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\Windows\System32\drivers\etc\hosts")
    } else {
        PathBuf::from("/etc/hosts")
    }
}

fn start_marker(tag: &str) -> String {
    format!("### START {} ###", tag)
}

fn end_marker(tag: &str) -> String {
    format!("### END {} ###", tag)
}

/// Render registry entries as a marker-bracketed hosts block
///
/// Ports are stripped from both sides; hostnames that only differ by port
/// collapse into one line. Lines are ordered by hostname.
pub fn render_hosts(entries: &[RegistryEntry], tag: &str) -> String {
    let hosts: BTreeMap<&str, &str> = entries
        .iter()
        .map(|entry| (entry.host(), entry.backend_ip()))
        .collect();

    let mut out = String::new();
    out.push_str(&start_marker(tag));
    out.push('\n');
    for (host, ip) in hosts {
        out.push_str(&format!("{}    {}\n", ip, host));
    }
    out.push_str(&end_marker(tag));
    out.push('\n');
    out
}

/// Replace the block tagged `tag` in `existing` with `block`, or append it
///
/// Keeps the file's line ending: a file using CRLF gets a CRLF block.
fn splice_block(existing: &str, block: &str, tag: &str) -> Option<String> {
    let start = start_marker(tag);
    let end = end_marker(tag);

    let eol = if existing.contains("\r\n") { "\r\n" } else { "\n" };
    let block = if eol == "\n" {
        block.to_string()
    } else {
        block.replace('\n', eol)
    };

    let mut out = String::with_capacity(existing.len() + block.len());
    let mut lines = existing.lines();
    let mut replaced = false;

    while let Some(line) = lines.next() {
        if line.trim() == start {
            // Skip the old block up to and including its END marker
            lines.by_ref().find(|l| l.trim() == end)?;
            if !replaced {
                out.push_str(&block);
                replaced = true;
            }
            continue;
        }
        out.push_str(line);
        out.push_str(eol);
    }

    if !replaced {
        if !out.is_empty() && !out.ends_with(&eol.repeat(2)) {
            out.push_str(eol);
        }
        out.push_str(&block);
    }

    Some(out)
}

/// Write `block` into the hosts file at `path`
pub fn update_hosts_file(path: &Path, block: &str, tag: &str) -> Result<(), HostsError> {
    let existing = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("Hosts file {} does not exist, creating it", path.display());
            String::new()
        }
        Err(e) => {
            return Err(HostsError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    let updated =
        splice_block(&existing, block, tag).ok_or_else(|| HostsError::UnterminatedBlock {
            path: path.to_path_buf(),
            tag: tag.to_string(),
        })?;

    fs::write(path, updated).map_err(|e| HostsError::Write {
        path: path.to_path_buf(),
        source: e,
    })?;

    info!("Updated {} with {} block", path.display(), tag);
    Ok(())
}
