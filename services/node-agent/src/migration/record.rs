//! Migration record model.
//!
//! A `MigrationRecord` is the cluster-visible mirror of one domain's migration
//! progress, keyed by the domain UUID. Watchers never replace a record; they
//! apply a `StatusPatch` against the version they read.

use std::fmt;

use chrono::{DateTime, Utc};
use kvm_id::{DomainUuid, HostId};
use serde::{Deserialize, Serialize};

// =============================================================================
// Phase
// =============================================================================

/// Migration phase as mirrored from the daemon's job type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    /// No job observed (yet).
    #[default]
    None,
    /// Job with a finite completion time.
    Bounded,
    /// Job without a finite completion time.
    Unbounded,
    /// Job finished.
    Completed,
    /// Job hit an error.
    Failed,
    /// Job was aborted.
    Cancelled,
    /// Job reported explicit success.
    Success,
}

impl MigrationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bounded => "bounded",
            Self::Unbounded => "unbounded",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Success => "success",
        }
    }

    /// Terminal phases end a watch.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Success
        )
    }

    /// Progress rank: `none` < in flight < terminal.
    pub fn rank(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Bounded | Self::Unbounded => 1,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Success => 2,
        }
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Operation
// =============================================================================

/// Kind of operation the daemon job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOperation {
    Unknown,
    Start,
    Save,
    Restore,
    MigrationIn,
    MigrationOut,
    Snapshot,
    SnapshotRevert,
    Dump,
    Backup,
    SnapshotDelete,
}

impl JobOperation {
    /// Maps the daemon's operation code; unknown codes map to `Unknown`.
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Start,
            2 => Self::Save,
            3 => Self::Restore,
            4 => Self::MigrationIn,
            5 => Self::MigrationOut,
            6 => Self::Snapshot,
            7 => Self::SnapshotRevert,
            8 => Self::Dump,
            9 => Self::Backup,
            10 => Self::SnapshotDelete,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Start => "start",
            Self::Save => "save",
            Self::Restore => "restore",
            Self::MigrationIn => "migration_in",
            Self::MigrationOut => "migration_out",
            Self::Snapshot => "snapshot",
            Self::SnapshotRevert => "snapshot_revert",
            Self::Dump => "dump",
            Self::Backup => "backup",
            Self::SnapshotDelete => "snapshot_delete",
        }
    }
}

impl fmt::Display for JobOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Status
// =============================================================================

/// Observed migration status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStatus {
    #[serde(rename = "type")]
    pub phase: MigrationPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<JobOperation>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_elapsed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_remaining: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downtime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup_time: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_total: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_processed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_remaining: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_total: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_processed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_remaining: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_constant: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_normal: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_normal_bytes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_bps: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_dirty_rate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_page_size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_iteration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_postcopy_requests: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_total: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_processed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_remaining: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_bps: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_converge_throttle: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_host: Option<HostId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_host: Option<HostId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err_msg: Option<String>,
}

/// Cluster record for one domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRecord {
    pub id: DomainUuid,
    /// Store version used for conditional writes.
    pub version: u64,
    pub status: MigrationStatus,
}

impl MigrationRecord {
    /// A freshly created, empty record.
    pub fn empty(id: DomainUuid) -> Self {
        Self {
            id,
            version: 1,
            status: MigrationStatus::default(),
        }
    }
}

// =============================================================================
// Patch
// =============================================================================

/// Partial status update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusPatch {
    pub phase: Option<MigrationPhase>,
    pub operation: Option<JobOperation>,
    pub time_elapsed: Option<String>,
    pub time_remaining: Option<String>,
    pub downtime: Option<String>,
    pub setup_time: Option<String>,
    pub data_total: Option<String>,
    pub data_processed: Option<String>,
    pub data_remaining: Option<String>,
    pub mem_total: Option<String>,
    pub mem_processed: Option<String>,
    pub mem_remaining: Option<String>,
    pub mem_constant: Option<u64>,
    pub mem_normal: Option<u64>,
    pub mem_normal_bytes: Option<String>,
    pub mem_bps: Option<String>,
    pub mem_dirty_rate: Option<String>,
    pub mem_page_size: Option<String>,
    pub mem_iteration: Option<u64>,
    pub mem_postcopy_requests: Option<u64>,
    pub disk_total: Option<String>,
    pub disk_processed: Option<String>,
    pub disk_remaining: Option<String>,
    pub disk_bps: Option<String>,
    pub auto_converge_throttle: Option<String>,
    pub origin_host: Option<HostId>,
    pub destination_host: Option<HostId>,
    pub started: Option<DateTime<Utc>>,
    pub err_msg: Option<String>,
}

macro_rules! merge_fields {
    ($patch:expr, $status:expr, [$($field:ident),* $(,)?]) => {
        $(
            if let Some(value) = &$patch.$field {
                $status.$field = Some(value.clone());
            }
        )*
    };
}

impl StatusPatch {
    /// Patch that only sets the phase.
    pub fn phase(phase: MigrationPhase) -> Self {
        Self {
            phase: Some(phase),
            ..Self::default()
        }
    }

    /// Apply the patch to a status in place.
    pub fn apply_to(&self, status: &mut MigrationStatus) {
        if let Some(phase) = self.phase {
            status.phase = phase;
        }

        merge_fields!(
            self,
            status,
            [
                operation,
                time_elapsed,
                time_remaining,
                downtime,
                setup_time,
                data_total,
                data_processed,
                data_remaining,
                mem_total,
                mem_processed,
                mem_remaining,
                mem_constant,
                mem_normal,
                mem_normal_bytes,
                mem_bps,
                mem_dirty_rate,
                mem_page_size,
                mem_iteration,
                mem_postcopy_requests,
                disk_total,
                disk_processed,
                disk_remaining,
                disk_bps,
                auto_converge_throttle,
                origin_host,
                destination_host,
                started,
                err_msg,
            ]
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_phases() {
        assert!(!MigrationPhase::None.is_terminal());
        assert!(!MigrationPhase::Bounded.is_terminal());
        assert!(!MigrationPhase::Unbounded.is_terminal());
        assert!(MigrationPhase::Completed.is_terminal());
        assert!(MigrationPhase::Failed.is_terminal());
        assert!(MigrationPhase::Cancelled.is_terminal());
        assert!(MigrationPhase::Success.is_terminal());
    }

    #[test]
    fn test_phase_rank_orders_progress() {
        assert!(MigrationPhase::None.rank() < MigrationPhase::Bounded.rank());
        assert_eq!(MigrationPhase::Bounded.rank(), MigrationPhase::Unbounded.rank());
        assert!(MigrationPhase::Unbounded.rank() < MigrationPhase::Failed.rank());
    }

    #[test]
    fn test_operation_codes() {
        assert_eq!(JobOperation::from_code(0), JobOperation::Unknown);
        assert_eq!(JobOperation::from_code(5), JobOperation::MigrationOut);
        assert_eq!(JobOperation::from_code(10), JobOperation::SnapshotDelete);
        assert_eq!(JobOperation::from_code(99), JobOperation::Unknown);
    }

    #[test]
    fn test_patch_leaves_untouched_fields() {
        let mut status = MigrationStatus {
            phase: MigrationPhase::Bounded,
            data_total: Some("2.0 MiB".to_string()),
            origin_host: Some(HostId::parse("host-a").unwrap()),
            ..MigrationStatus::default()
        };

        StatusPatch::phase(MigrationPhase::Completed).apply_to(&mut status);

        assert_eq!(status.phase, MigrationPhase::Completed);
        assert_eq!(status.data_total.as_deref(), Some("2.0 MiB"));
        assert_eq!(status.origin_host.as_ref().unwrap().as_str(), "host-a");
    }

    #[test]
    fn test_status_json_shape() {
        let status = MigrationStatus {
            phase: MigrationPhase::Unbounded,
            operation: Some(JobOperation::MigrationOut),
            mem_bps: Some("1.0 GiB/s".to_string()),
            ..MigrationStatus::default()
        };

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["type"], "unbounded");
        assert_eq!(json["operation"], "migration_out");
        assert_eq!(json["memBps"], "1.0 GiB/s");
        assert!(json.get("dataTotal").is_none());
    }
}
