//! # Core Configuration
//!
//! Tunables for the locator and the command channel.
//!
//! ## Environment Variables
//!
//! - `REMORA_PROC_ROOT`: procfs mount the Linux locator scans (default: `/proc`)
//! - `REMORA_CHANNEL_YIELD`: yield the CPU while waiting on the companion (`true`/`false`, default: `true`)
//! - `REMORA_CHANNEL_CHECK`: spins between liveness checks of the target (default: `10000`)
//! - `REMORA_CHANNEL_SPINS`: give up after this many spins (default: wait forever)
//! - `REMORA_MAX_STRING`: longest foreign string accepted by the decoder, in bytes (default: 16 MiB)
//!
//! Unparseable values fall back to the default.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::abi::DEFAULT_MAX_LEN;

/// Configuration shared by the locator, sessions and channels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreConfig
{
    pub proc_root: PathBuf,
    pub channel_yield: bool,
    pub channel_check_every: u32,
    pub channel_spin_limit: Option<u64>,
    pub max_string_len: usize,
}

impl Default for CoreConfig
{
    fn default() -> Self
    {
        Self {
            proc_root: PathBuf::from("/proc"),
            channel_yield: true,
            channel_check_every: 10_000,
            channel_spin_limit: None,
            max_string_len: DEFAULT_MAX_LEN,
        }
    }
}

impl CoreConfig
{
    /// Defaults overridden by any `REMORA_*` variables that are set
    pub fn from_env() -> Self
    {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self
    {
        let defaults = Self::default();
        Self {
            proc_root: lookup("REMORA_PROC_ROOT").map_or(defaults.proc_root, PathBuf::from),
            channel_yield: lookup("REMORA_CHANNEL_YIELD")
                .and_then(|v| parse_flag(&v))
                .unwrap_or(defaults.channel_yield),
            channel_check_every: parse_or(lookup("REMORA_CHANNEL_CHECK"), defaults.channel_check_every).max(1),
            channel_spin_limit: lookup("REMORA_CHANNEL_SPINS").and_then(|v| v.trim().parse().ok()),
            max_string_len: parse_or(lookup("REMORA_MAX_STRING"), defaults.max_string_len),
        }
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T
{
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn parse_flag(value: &str) -> Option<bool>
{
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
