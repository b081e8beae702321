//! Job statistics decoder.
//!
//! Turns the daemon's `(job type, typed parameters)` answer into a
//! [`StatusPatch`]. The decoder is pure: no I/O, no logging, no clock.
//!
//! A job type of `none` is reported as [`DecodedJob::NoJob`] and never as a
//! patch, so "no job present" cannot be confused with a job whose counters
//! happen to be zero.

use std::fmt::Write as _;
use std::time::Duration;

use crate::daemon::{JobType, ParamValue, TypedParam};

use super::record::{JobOperation, MigrationPhase, StatusPatch};

/// Result of decoding one job statistics answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedJob {
    /// The daemon reports no job for the domain.
    NoJob,
    /// A job is present (active or just finished).
    Progress(StatusPatch),
}

/// Decode job statistics into a status patch.
pub fn decode_job_stats(job_type: JobType, params: &[TypedParam]) -> DecodedJob {
    let phase = match job_type {
        JobType::None => return DecodedJob::NoJob,
        JobType::Bounded => MigrationPhase::Bounded,
        JobType::Unbounded => MigrationPhase::Unbounded,
        JobType::Completed => MigrationPhase::Completed,
        JobType::Failed => MigrationPhase::Failed,
        JobType::Cancelled => MigrationPhase::Cancelled,
    };

    let mut patch = StatusPatch::phase(phase);
    let mut success = None;

    for param in params {
        apply_param(&mut patch, &mut success, param);
    }

    match success {
        Some(true) => patch.phase = Some(MigrationPhase::Success),
        Some(false) if phase != MigrationPhase::Cancelled => {
            patch.phase = Some(MigrationPhase::Failed)
        }
        _ => {}
    }

    DecodedJob::Progress(patch)
}

fn apply_param(patch: &mut StatusPatch, success: &mut Option<bool>, param: &TypedParam) {
    let value = &param.value;
    match param.field.as_str() {
        "operation" => patch.operation = value.as_i64().map(JobOperation::from_code),

        "time_elapsed" => patch.time_elapsed = micros(value),
        "time_remaining" => patch.time_remaining = micros(value),
        "downtime" => patch.downtime = micros(value),
        "setup_time" => patch.setup_time = micros(value),

        "data_total" => patch.data_total = bytes(value),
        "data_processed" => patch.data_processed = bytes(value),
        "data_remaining" => patch.data_remaining = bytes(value),

        "memory_total" => patch.mem_total = bytes(value),
        "memory_processed" => patch.mem_processed = bytes(value),
        "memory_remaining" => patch.mem_remaining = bytes(value),
        "memory_normal_bytes" => patch.mem_normal_bytes = bytes(value),
        "memory_page_size" => patch.mem_page_size = bytes(value),
        "memory_bps" => patch.mem_bps = bytes(value).map(|b| format!("{b}/s")),
        "memory_dirty_rate" => patch.mem_dirty_rate = value.as_u64().map(|v| format!("{v}/s")),
        "memory_constant" => patch.mem_constant = value.as_u64(),
        "memory_normal" => patch.mem_normal = value.as_u64(),
        "memory_iteration" => patch.mem_iteration = value.as_u64(),
        "memory_postcopy_requests" => patch.mem_postcopy_requests = value.as_u64(),

        "disk_total" => patch.disk_total = bytes(value),
        "disk_processed" => patch.disk_processed = bytes(value),
        "disk_remaining" => patch.disk_remaining = bytes(value),
        "disk_bps" => patch.disk_bps = bytes(value).map(|b| format!("{b}/s")),

        "auto_converge_throttle" => {
            patch.auto_converge_throttle = value.as_u64().map(|v| format!("{v}%"))
        }

        "success" => *success = value.as_bool(),
        "errmsg" => patch.err_msg = value.as_str().map(str::to_string),

        _ => {}
    }
}

fn micros(value: &ParamValue) -> Option<String> {
    value
        .as_u64()
        .map(|v| format_duration(Duration::from_micros(v)))
}

fn bytes(value: &ParamValue) -> Option<String> {
    value.as_u64().map(format_bytes_iec)
}

/// Formats a duration compactly: `0s`, `750µs`, `1.5ms`, `5s`, `1m30s`, `2h0m5.25s`.
pub fn format_duration(duration: Duration) -> String {
    let micros = duration.as_micros();
    if micros == 0 {
        return "0s".to_string();
    }
    if micros < 1_000 {
        return format!("{micros}µs");
    }
    if micros < 1_000_000 {
        return format!("{}ms", with_fraction(micros / 1_000, micros % 1_000, 3));
    }

    let total_secs = micros / 1_000_000;
    let hours = total_secs / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let seconds = total_secs % 60;

    let mut out = String::new();
    if hours > 0 {
        let _ = write!(out, "{hours}h{minutes}m");
    } else if minutes > 0 {
        let _ = write!(out, "{minutes}m");
    }
    out.push_str(&with_fraction(seconds, micros % 1_000_000, 6));
    out.push('s');
    out
}

fn with_fraction(whole: u128, fraction: u128, digits: usize) -> String {
    if fraction == 0 {
        return whole.to_string();
    }
    let fraction = format!("{fraction:0digits$}");
    format!("{whole}.{}", fraction.trim_end_matches('0'))
}

/// Formats a byte count with binary prefixes: `512 B`, `1.5 KiB`, `2.0 MiB`.
pub fn format_bytes_iec(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{bytes} B");
    }

    let mut divisor = UNIT;
    let mut exponent = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        divisor *= UNIT;
        exponent += 1;
        n /= UNIT;
    }

    let prefix = ['K', 'M', 'G', 'T', 'P', 'E'][exponent];
    format!("{:.1} {prefix}iB", bytes as f64 / divisor as f64)
}
