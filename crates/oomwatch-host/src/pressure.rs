use std::path::Path;

use serde::{Deserialize, Serialize};

/// System-wide memory PSI file.
pub const PROC_PRESSURE_MEMORY: &str = "/proc/pressure/memory";

/// One line of a PSI file (`some ...` or `full ...`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PressureLine {
    /// Share of wall time stalled, in percent, over the last 10s/60s/300s.
    pub avg10: f64,
    pub avg60: f64,
    pub avg300: f64,
    /// Total stall time in microseconds.
    pub total_us: u64,
}

/// Parsed memory PSI contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PressureSnapshot {
    pub some: PressureLine,
    /// Absent on kernels that only report `some` for the resource.
    pub full: Option<PressureLine>,
}

impl PressureSnapshot {
    pub fn level(&self, thresholds: PressureThresholds) -> PressureLevel {
        let some = thresholds.level_for_avg(self.some.avg10);
        let full = self
            .full
            .map(|full| thresholds.level_for_avg(full.avg10 * thresholds.full_weight))
            .unwrap_or(PressureLevel::Low);
        some.max(full)
    }
}

/// Parse the contents of a PSI file.
///
/// Returns `None` when the mandatory `some` line is missing or malformed.
pub fn parse_pressure(contents: &str) -> Option<PressureSnapshot> {
    let mut some = None;
    let mut full = None;

    for line in contents.lines() {
        let mut fields = line.split_whitespace();
        let slot = match fields.next() {
            Some("some") => &mut some,
            Some("full") => &mut full,
            _ => continue,
        };
        *slot = parse_line(fields);
    }

    Some(PressureSnapshot { some: some?, full })
}

fn parse_line<'a>(fields: impl Iterator<Item = &'a str>) -> Option<PressureLine> {
    let mut line = PressureLine::default();
    let mut seen = 0u8;
    for field in fields {
        let (key, value) = field.split_once('=')?;
        match key {
            "avg10" => line.avg10 = value.parse().ok()?,
            "avg60" => line.avg60 = value.parse().ok()?,
            "avg300" => line.avg300 = value.parse().ok()?,
            "total" => line.total_us = value.parse().ok()?,
            _ => continue,
        }
        seen += 1;
    }
    (seen == 4).then_some(line)
}

/// Read and parse a PSI file. `None` when the kernel lacks PSI support.
pub fn read_pressure(path: &Path) -> Option<PressureSnapshot> {
    match std::fs::read_to_string(path) {
        Ok(contents) => parse_pressure(&contents),
        Err(err) => {
            tracing::debug!(
                target = "oomwatch.host",
                path = %path.display(),
                error = %err,
                "memory pressure is not available"
            );
            None
        }
    }
}

/// Coarse memory pressure levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Thresholds on the 10 second stall average, in percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PressureThresholds {
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
    /// `full` stalls count this many times a `some` stall of the same share.
    pub full_weight: f64,
}

impl Default for PressureThresholds {
    fn default() -> Self {
        Self {
            medium: 5.0,
            high: 20.0,
            critical: 50.0,
            full_weight: 2.0,
        }
    }
}

impl PressureThresholds {
    pub fn level_for_avg(self, avg: f64) -> PressureLevel {
        if avg >= self.critical {
            PressureLevel::Critical
        } else if avg >= self.high {
            PressureLevel::High
        } else if avg >= self.medium {
            PressureLevel::Medium
        } else {
            PressureLevel::Low
        }
    }
}
