// SPDX-License-Identifier: MPL-2.0

//! Configuration of the inter-world memory subsystem.
//!
//! The options are given as kernel command-line module arguments of the
//! `tziw` module, following the Linux kernel command line rules:
//!
//! ```text
//! tziw.backend=hyp tziw.channel_pages=2 tziw.max_batch_size=1048576
//! ```

use core::time::Duration;

use crate::{channel::MAX_CHANNEL_ENTRIES, prelude::*};

/// The module name under which the options are looked up.
pub const MODULE_NAME: &str = "tziw";

/// How memory descriptions reach the trusted peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// The peer can address physical memory directly.
    Direct,
    /// Page ownership is transferred to the peer VM through the hypervisor.
    Hypervisor,
}

/// The tunables of a [`TzDev`] instance.
///
/// [`TzDev`]: crate::TzDev
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IwConfig {
    pub backend: BackendKind,
    /// Whether each CPU owns a channel. If not, a single channel is shared.
    pub per_cpu_channels: bool,
    /// The data pages a channel keeps across transactions.
    pub channel_pages: usize,
    /// The maximum byte size of a physically contiguous chunk.
    pub max_chunk_size: usize,
    /// The maximum number of chunks shared in one hypervisor call.
    pub max_batch_chunks: usize,
    /// The maximum byte size shared in one hypervisor call.
    pub max_batch_size: usize,
    /// Whether newly allocated pages may be sorted by physical address.
    pub sort_pages: bool,
    pub accept_timeout: Duration,
    pub release_timeout: Duration,
    /// The number of event ids in each direction.
    pub event_capacity: usize,
    /// The maximum number of live registrations.
    pub shmem_capacity: usize,
}

impl Default for IwConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Direct,
            per_cpu_channels: true,
            channel_pages: 1,
            max_chunk_size: 512 * 1024,
            max_batch_chunks: 32,
            max_batch_size: 1024 * 1024,
            sort_pages: true,
            accept_timeout: Duration::from_millis(5000),
            release_timeout: Duration::from_millis(5000),
            event_capacity: 256,
            shmem_capacity: 1024,
        }
    }
}

impl IwConfig {
    /// Parses the `tziw.*` arguments of a kernel command line.
    ///
    /// Arguments of other modules are ignored. Unknown options and malformed
    /// values are skipped with a warning, keeping the default.
    pub fn from_cmdline(cmdline: &str) -> Self {
        let mut config = Self::default();
        for arg in split_arg(cmdline) {
            if arg == "--" {
                break;
            }
            let Some((entry, value)) = arg.split_once('=') else {
                continue;
            };
            let Some((module, option)) = entry.split_once('.') else {
                continue;
            };
            if module != MODULE_NAME {
                continue;
            }
            let value = value.trim_matches('"');
            if config.set_option(option, value).is_err() {
                warn!("[tziw] unable to parse option {}={}, skip for now", option, value);
            }
        }
        config
    }

    /// Sets one option from its textual value.
    pub fn set_option(&mut self, option: &str, value: &str) -> Result<()> {
        match option {
            "backend" => {
                self.backend = match value {
                    "direct" => BackendKind::Direct,
                    "hyp" | "hypervisor" => BackendKind::Hypervisor,
                    _ => return_errno_with_message!(ErrorKind::InvalidArgument, "unknown backend"),
                }
            }
            "per_cpu_channels" => self.per_cpu_channels = parse_bool(value)?,
            "channel_pages" => self.channel_pages = parse_usize(value)?,
            "max_chunk_size" => self.max_chunk_size = parse_usize(value)?,
            "max_batch_chunks" => self.max_batch_chunks = parse_usize(value)?,
            "max_batch_size" => self.max_batch_size = parse_usize(value)?,
            "sort_pages" => self.sort_pages = parse_bool(value)?,
            "accept_timeout_ms" => {
                self.accept_timeout = Duration::from_millis(parse_usize(value)? as u64)
            }
            "release_timeout_ms" => {
                self.release_timeout = Duration::from_millis(parse_usize(value)? as u64)
            }
            "event_capacity" => self.event_capacity = parse_usize(value)?,
            "shmem_capacity" => self.shmem_capacity = parse_usize(value)?,
            _ => return_errno_with_message!(ErrorKind::InvalidArgument, "unknown option"),
        }
        Ok(())
    }

    /// Checks the options against each other.
    pub fn validate(&self) -> Result<()> {
        if self.channel_pages == 0
            || self.max_batch_chunks == 0
            || self.event_capacity == 0
            || self.shmem_capacity == 0
        {
            return_errno_with_message!(ErrorKind::InvalidArgument, "a capacity is zero");
        }
        if self.channel_pages > MAX_CHANNEL_ENTRIES {
            return_errno_with_message!(
                ErrorKind::InvalidArgument,
                "the baseline does not fit in the channel metadata"
            );
        }
        if self.max_chunk_size < PAGE_SIZE || self.max_batch_size < PAGE_SIZE {
            return_errno_with_message!(
                ErrorKind::InvalidArgument,
                "chunks and batches must hold at least one page"
            );
        }
        if self.max_chunk_size > self.max_batch_size {
            return_errno_with_message!(
                ErrorKind::InvalidArgument,
                "a chunk must fit in one batch"
            );
        }
        Ok(())
    }
}

fn parse_usize(value: &str) -> Result<usize> {
    value
        .parse()
        .map_err(|_| Error::with_message(ErrorKind::InvalidArgument, "not a number"))
}

fn parse_bool(value: &str) -> Result<bool> {
    match value {
        "1" | "y" | "yes" | "on" | "true" => Ok(true),
        "0" | "n" | "no" | "off" | "false" => Ok(false),
        _ => return_errno_with_message!(ErrorKind::InvalidArgument, "not a boolean"),
    }
}

// Splits the command line string by spaces but preserve
// ones that are protected by double quotes(`"`).
fn split_arg(input: &str) -> impl Iterator<Item = &str> {
    let mut inside_quotes = false;

    input
        .split(move |c: char| {
            if c == '"' {
                inside_quotes = !inside_quotes;
            }

            !inside_quotes && c.is_whitespace()
        })
        .filter(|arg| !arg.is_empty())
}
