//! Wire-level daemon types and the decoded event union.

use std::fmt;

use kvm_id::DomainRef;
use thiserror::Error;

// =============================================================================
// Event Categories
// =============================================================================

/// Domain event categories the agent subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventCategory {
    /// Domain lifecycle transitions (defined, started, resumed, stopped, ...).
    Lifecycle,
    /// One pre-copy iteration of an outgoing migration.
    MigrationIteration,
    /// A domain job finished.
    JobCompleted,
}

impl EventCategory {
    /// All categories, in dispatch order.
    pub const ALL: [EventCategory; 3] = [
        EventCategory::Lifecycle,
        EventCategory::MigrationIteration,
        EventCategory::JobCompleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lifecycle => "lifecycle",
            Self::MigrationIteration => "migration_iteration",
            Self::JobCompleted => "job_completed",
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Typed Parameters
// =============================================================================

/// Value of a daemon typed parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int(i32),
    UInt(u32),
    LLong(i64),
    ULLong(u64),
    Double(f64),
    Boolean(bool),
    String(String),
}

impl ParamValue {
    /// Returns the value as an unsigned counter, if it is a non-negative integer.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Self::Int(v) => u64::try_from(v).ok(),
            Self::UInt(v) => Some(u64::from(v)),
            Self::LLong(v) => u64::try_from(v).ok(),
            Self::ULLong(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the value as a signed integer.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::Int(v) => Some(i64::from(v)),
            Self::UInt(v) => Some(i64::from(v)),
            Self::LLong(v) => Some(v),
            Self::ULLong(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    /// Returns the value as a boolean; integers are true when non-zero.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(v) => Some(*v),
            other => other.as_i64().map(|v| v != 0),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::UInt(v) => write!(f, "{v}"),
            Self::LLong(v) => write!(f, "{v}"),
            Self::ULLong(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::String(v) => f.write_str(v),
        }
    }
}

/// Named typed parameter, as found in job statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedParam {
    pub field: String,
    pub value: ParamValue,
}

impl TypedParam {
    pub fn new(field: impl Into<String>, value: ParamValue) -> Self {
        Self {
            field: field.into(),
            value,
        }
    }

    pub fn int(field: impl Into<String>, value: i32) -> Self {
        Self::new(field, ParamValue::Int(value))
    }

    pub fn ullong(field: impl Into<String>, value: u64) -> Self {
        Self::new(field, ParamValue::ULLong(value))
    }

    pub fn boolean(field: impl Into<String>, value: bool) -> Self {
        Self::new(field, ParamValue::Boolean(value))
    }

    pub fn string(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(field, ParamValue::String(value.into()))
    }
}

// =============================================================================
// Job Statistics
// =============================================================================

/// Job type reported alongside job statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobType {
    /// No job is active.
    None,
    /// Job with a finite completion time.
    Bounded,
    /// Job without a finite completion time.
    Unbounded,
    /// Job has finished, but isn't cleaned up.
    Completed,
    /// Job hit an error, but isn't cleaned up.
    Failed,
    /// Job was aborted, but isn't cleaned up.
    Cancelled,
}

/// Job statistics payload as returned by the daemon.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStats {
    pub job_type: JobType,
    pub params: Vec<TypedParam>,
}

impl JobStats {
    pub fn new(job_type: JobType, params: Vec<TypedParam>) -> Self {
        Self { job_type, params }
    }

    /// The "no job present" answer.
    pub fn none() -> Self {
        Self::new(JobType::None, Vec::new())
    }
}

// =============================================================================
// Raw Events
// =============================================================================

/// Undecoded event payload, as delivered on a subscription channel.
#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload {
    Lifecycle { event: i32, detail: i32 },
    MigrationIteration { iteration: i32 },
    JobCompleted { params: Vec<TypedParam> },
}

impl RawPayload {
    /// The category this payload belongs to.
    pub fn category(&self) -> EventCategory {
        match self {
            Self::Lifecycle { .. } => EventCategory::Lifecycle,
            Self::MigrationIteration { .. } => EventCategory::MigrationIteration,
            Self::JobCompleted { .. } => EventCategory::JobCompleted,
        }
    }
}

/// Undecoded event for one domain.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDomainEvent {
    pub domain: DomainRef,
    pub payload: RawPayload,
}

// =============================================================================
// Decoded Events
// =============================================================================

/// Lifecycle transition of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Defined,
    Undefined,
    Started,
    Suspended,
    Resumed,
    Stopped,
    Shutdown,
    PmSuspended,
    Crashed,
}

impl LifecycleEvent {
    /// Detail code of a `Started` event caused by an incoming migration.
    pub const STARTED_MIGRATED: i32 = 1;

    /// Maps the daemon's lifecycle event code.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Defined),
            1 => Some(Self::Undefined),
            2 => Some(Self::Started),
            3 => Some(Self::Suspended),
            4 => Some(Self::Resumed),
            5 => Some(Self::Stopped),
            6 => Some(Self::Shutdown),
            7 => Some(Self::PmSuspended),
            8 => Some(Self::Crashed),
            _ => None,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::Defined => 0,
            Self::Undefined => 1,
            Self::Started => 2,
            Self::Suspended => 3,
            Self::Resumed => 4,
            Self::Stopped => 5,
            Self::Shutdown => 6,
            Self::PmSuspended => 7,
            Self::Crashed => 8,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Defined => "defined",
            Self::Undefined => "undefined",
            Self::Started => "started",
            Self::Suspended => "suspended",
            Self::Resumed => "resumed",
            Self::Stopped => "stopped",
            Self::Shutdown => "shutdown",
            Self::PmSuspended => "pm_suspended",
            Self::Crashed => "crashed",
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors decoding a raw event.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The payload arrived on a subscription of another category.
    #[error("{payload} payload received on {subscription} subscription")]
    CategoryMismatch {
        subscription: EventCategory,
        payload: EventCategory,
    },

    /// The lifecycle event code is not known.
    #[error("unknown lifecycle event code {0}")]
    UnknownLifecycleEvent(i32),
}

/// Decoded domain event.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    Lifecycle {
        domain: DomainRef,
        event: LifecycleEvent,
        detail: i32,
    },
    MigrationIteration {
        domain: DomainRef,
        iteration: i32,
    },
    JobCompleted {
        domain: DomainRef,
        params: Vec<TypedParam>,
    },
}

impl DomainEvent {
    /// Decode a raw event received on a subscription of `category`.
    pub fn decode(category: EventCategory, raw: RawDomainEvent) -> Result<Self, DecodeError> {
        let payload_category = raw.payload.category();
        if payload_category != category {
            return Err(DecodeError::CategoryMismatch {
                subscription: category,
                payload: payload_category,
            });
        }

        let RawDomainEvent { domain, payload } = raw;
        match payload {
            RawPayload::Lifecycle { event, detail } => {
                let event = LifecycleEvent::from_code(event)
                    .ok_or(DecodeError::UnknownLifecycleEvent(event))?;
                Ok(Self::Lifecycle {
                    domain,
                    event,
                    detail,
                })
            }
            RawPayload::MigrationIteration { iteration } => {
                Ok(Self::MigrationIteration { domain, iteration })
            }
            RawPayload::JobCompleted { params } => Ok(Self::JobCompleted { domain, params }),
        }
    }

    pub fn category(&self) -> EventCategory {
        match self {
            Self::Lifecycle { .. } => EventCategory::Lifecycle,
            Self::MigrationIteration { .. } => EventCategory::MigrationIteration,
            Self::JobCompleted { .. } => EventCategory::JobCompleted,
        }
    }

    pub fn domain(&self) -> &DomainRef {
        match self {
            Self::Lifecycle { domain, .. }
            | Self::MigrationIteration { domain, .. }
            | Self::JobCompleted { domain, .. } => domain,
        }
    }
}
