//! Identifier types for domains and hosts.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::IdError;

// =============================================================================
// Domain UUID
// =============================================================================

/// The UUID the virtualization daemon assigns to a domain.
///
/// This is also the key of the domain's migration record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainUuid(Uuid);

impl DomainUuid {
    /// Creates a domain UUID from the raw 16 bytes sent by the daemon.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Creates a domain UUID from a parsed UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Generates a random domain UUID.
    #[must_use]
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Parses a domain UUID from its textual form.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| IdError::InvalidUuid(e.to_string()))
    }
}

impl fmt::Display for DomainUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for DomainUuid {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for DomainUuid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for DomainUuid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Domain Reference
// =============================================================================

/// Reference to a domain as reported by the daemon (name + UUID).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DomainRef {
    /// Daemon-side domain name (e.g. `instance-0000a1b2`).
    pub name: String,

    /// Daemon-assigned UUID.
    pub uuid: DomainUuid,
}

impl DomainRef {
    /// Creates a new domain reference.
    pub fn new(name: impl Into<String>, uuid: DomainUuid) -> Self {
        Self {
            name: name.into(),
            uuid,
        }
    }
}

impl fmt::Display for DomainRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.uuid)
    }
}

// =============================================================================
// Host Identifier
// =============================================================================

/// Identifier of the local hypervisor host.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostId(String);

impl HostId {
    /// Maximum hostname length per RFC 1035.
    pub const MAX_LEN: usize = 253;

    /// Parses and validates a host identifier.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        if s.len() > Self::MAX_LEN {
            return Err(IdError::InvalidHost {
                value: s.to_string(),
                reason: "longer than 253 characters",
            });
        }

        if s.starts_with(['-', '.']) || s.ends_with(['-', '.']) {
            return Err(IdError::InvalidHost {
                value: s.to_string(),
                reason: "must start and end with an alphanumeric character",
            });
        }

        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        {
            return Err(IdError::InvalidHost {
                value: s.to_string(),
                reason: "only ASCII letters, digits, '-' and '.' are allowed",
            });
        }

        Ok(Self(s.to_ascii_lowercase()))
    }

    /// Returns the host identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for HostId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for HostId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for HostId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================
