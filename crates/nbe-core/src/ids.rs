//! Identifiers used across the engine
//!
//! - `WorksheetId`: owner-scoped worksheet key, rendered as `owner/number`
//! - `CellId`: per-worksheet cell number, never reused
//! - `SessionId`: backend session (ULID for sortability)
//! - `SnapshotId`: revision identifier (ULID, ordered by capture time)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Owner name reserved for published copies
pub const PUBLISHED_OWNER: &str = "pub";

/// Worksheet identifier: `owner/number`
///
/// This is also the worksheet's `filename` and its storage key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorksheetId {
    owner: String,
    number: u64,
}

impl WorksheetId {
    /// Create a worksheet id
    #[inline]
    #[must_use]
    pub fn new(owner: impl Into<String>, number: u64) -> Self {
        Self {
            owner: owner.into(),
            number,
        }
    }

    /// Id of the published copy with the given published id number
    #[inline]
    #[must_use]
    pub fn published(number: u64) -> Self {
        Self::new(PUBLISHED_OWNER, number)
    }

    /// Owning user
    #[inline]
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Number within the owner's namespace
    #[inline]
    #[must_use]
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Whether this id lives in the published namespace
    #[inline]
    #[must_use]
    pub fn is_published_namespace(&self) -> bool {
        self.owner == PUBLISHED_OWNER
    }

    /// The `owner/number` filename
    #[must_use]
    pub fn filename(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for WorksheetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.number)
    }
}

/// Error parsing a worksheet filename
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid worksheet filename: '{0}' (expected owner/number)")]
pub struct InvalidWorksheetId(pub String);

impl FromStr for WorksheetId {
    type Err = InvalidWorksheetId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (owner, number) = s
            .rsplit_once('/')
            .ok_or_else(|| InvalidWorksheetId(s.to_string()))?;
        if owner.is_empty() || owner.contains('/') {
            return Err(InvalidWorksheetId(s.to_string()));
        }
        let number = number
            .parse::<u64>()
            .map_err(|_| InvalidWorksheetId(s.to_string()))?;
        Ok(Self::new(owner, number))
    }
}

/// Cell identifier, unique within its worksheet
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellId(pub u32);

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Backend session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Ulid);

impl SessionId {
    /// Generate new session ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot identifier (sortable by capture time)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotId(pub Ulid);

impl SnapshotId {
    /// Generate new snapshot ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SnapshotId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SnapshotId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}
