//! Engine settings and the read/write resource split.
//!
//! A store runs two DuckDB instances side by side: one serving reads, one
//! applying writes. When the caller does not budget memory and threads for
//! each explicitly, [`resolve_pair`] divides what is available between them
//! and returns two fully-specified settings objects.

use crate::error::{EngineError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing::debug;

/// Settings applied to one DuckDB instance when it is opened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// DuckDB `max_memory`, in DuckDB's human-readable form (`"4GB"`, `"512 bytes"`).
    pub max_memory: Option<String>,

    /// DuckDB `threads`.
    pub threads: Option<u32>,

    /// Any other DuckDB option, passed through verbatim.
    pub extra: BTreeMap<String, String>,
}

impl EngineSettings {
    /// Check that every recognised value is well formed.
    pub fn validate(&self) -> Result<()> {
        if let Some(mem) = &self.max_memory {
            parse_human_size(mem)?;
        }
        if self.threads == Some(0) {
            return Err(EngineError::config("threads must be at least 1"));
        }
        Ok(())
    }

    /// Build the DuckDB open-time configuration.
    pub(crate) fn to_duckdb_config(&self) -> Result<duckdb::Config> {
        let mut config = duckdb::Config::default();
        if let Some(mem) = &self.max_memory {
            config = config.with("max_memory", mem)?;
        }
        if let Some(threads) = self.threads {
            config = config.with("threads", &threads.to_string())?;
        }
        for (key, value) in &self.extra {
            config = config.with(key, value)?;
        }
        Ok(config)
    }
}

/// Memory and thread budget reported by a default DuckDB instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectedResources {
    pub max_memory_bytes: u64,
    pub threads: u32,
}

impl DetectedResources {
    /// Open a throwaway in-memory instance and read its defaults.
    pub fn detect() -> Result<Self> {
        let conn = duckdb::Connection::open_in_memory()?;
        let max_memory: String = conn.query_row(
            "SELECT value FROM duckdb_settings() WHERE name = 'max_memory'",
            [],
            |row| row.get(0),
        )?;
        let threads: String = conn.query_row(
            "SELECT value FROM duckdb_settings() WHERE name = 'threads'",
            [],
            |row| row.get(0),
        )?;

        let detected = Self {
            max_memory_bytes: parse_human_size(&max_memory)?,
            threads: threads
                .trim()
                .parse()
                .map_err(|e| EngineError::config(format!("unable to parse threads {threads:?}: {e}")))?,
        };
        debug!(
            max_memory_bytes = detected.max_memory_bytes,
            threads = detected.threads,
            "Detected engine resources"
        );
        Ok(detected)
    }
}

/// Resolve read and write settings, detecting engine defaults only if needed.
pub fn resolve_pair(
    read: &EngineSettings,
    write: &EngineSettings,
) -> Result<(EngineSettings, EngineSettings)> {
    resolve_pair_with(read, write, DetectedResources::detect)
}

/// Resolve read and write settings against a supplied detector.
///
/// Memory: if neither side sets `max_memory` the detected total is halved
/// for each; if exactly one side sets it, that value is halved for each.
/// Threads follow the same rule with the read side taking the odd thread.
pub fn resolve_pair_with<F>(
    read: &EngineSettings,
    write: &EngineSettings,
    detect: F,
) -> Result<(EngineSettings, EngineSettings)>
where
    F: FnOnce() -> Result<DetectedResources>,
{
    read.validate()?;
    write.validate()?;

    let mut read = read.clone();
    let mut write = write.clone();

    let needs_detect = (read.max_memory.is_none() && write.max_memory.is_none())
        || (read.threads.is_none() && write.threads.is_none());
    let detected = if needs_detect { Some(detect()?) } else { None };

    let total_memory = match (&read.max_memory, &write.max_memory) {
        (Some(_), Some(_)) => None,
        (Some(mem), None) | (None, Some(mem)) => Some(parse_human_size(mem)?),
        (None, None) => detected.map(|d| d.max_memory_bytes),
    };
    if let Some(total) = total_memory {
        let half = format!("{} bytes", total / 2);
        read.max_memory = Some(half.clone());
        write.max_memory = Some(half);
    }

    let total_threads = match (read.threads, write.threads) {
        (Some(_), Some(_)) => None,
        (Some(t), None) | (None, Some(t)) => Some(t),
        (None, None) => detected.map(|d| d.threads),
    };
    if let Some(total) = total_threads {
        read.threads = Some(total.div_ceil(2).max(1));
        write.threads = Some((total / 2).max(1));
    }

    Ok((read, write))
}

fn human_size_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([\d.]+)\s*(\S+)$").expect("static regex is valid"))
}

/// Parse a size in DuckDB's human-readable notation into bytes.
///
/// Accepts decimal (`KB`, `MB`, ...) and binary (`KiB`, `MiB`, ...) units as
/// well as `byte`/`bytes`.
pub fn parse_human_size(size: &str) -> Result<u64> {
    let size = size.trim();
    let caps = human_size_regex()
        .captures(size)
        .ok_or_else(|| EngineError::config(format!("invalid size format: '{size}'")))?;

    let value: f64 = caps[1]
        .parse()
        .map_err(|e| EngineError::config(format!("invalid size number in '{size}': {e}")))?;

    let multiplier: f64 = match &caps[2] {
        "byte" | "bytes" => 1.0,
        "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        "PB" => 1e15,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "PiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0,
        unit => {
            return Err(EngineError::config(format!(
                "unknown size unit '{unit}' in '{size}'"
            )))
        }
    };

    Ok((value * multiplier) as u64)
}
