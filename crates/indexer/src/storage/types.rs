//! Database types for the cache store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use inferwatch_core::{CategorizedInferences, ParticipantSnapshot};

/// A cached value together with the time it was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cached<T> {
    /// The value.
    pub value: T,

    /// RFC 3339 write time.
    pub cached_at: String,
}

/// All snapshots of one epoch at one height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSet {
    /// Epoch
    pub epoch_id: u64,

    /// Height the snapshots were taken at
    pub height: u64,

    /// Earliest write time among the rows
    pub cached_at: String,

    /// Snapshots ordered by participant id
    pub snapshots: Vec<ParticipantSnapshot>,
}

impl SnapshotSet {
    /// Snapshot of one participant.
    pub fn find(&self, participant_id: &str) -> Option<&ParticipantSnapshot> {
        self.snapshots
            .iter()
            .find(|s| s.participant_id == participant_id)
    }
}

/// Epoch whose final snapshot has been taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochStatus {
    /// Epoch
    pub epoch_id: u64,

    /// Canonical settlement height the epoch was finalized at
    pub finished_height: u64,

    /// When it was marked
    pub marked_at: String,
}

/// Kind of a per-participant auxiliary record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuxiliaryKind {
    /// Warm keys derived from authz grants
    WarmKeys,

    /// Hardware node reports
    HardwareNodes,
}

impl AuxiliaryKind {
    /// Every kind, in warm order.
    pub const ALL: [AuxiliaryKind; 2] = [AuxiliaryKind::WarmKeys, AuxiliaryKind::HardwareNodes];

    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WarmKeys => "warm_keys",
            Self::HardwareNodes => "hardware_nodes",
        }
    }

    /// Human-readable label used in cycle logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::WarmKeys => "Warm keys",
            Self::HardwareNodes => "Hardware nodes",
        }
    }
}

impl fmt::Display for AuxiliaryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuxiliaryKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "warm_keys" => Ok(Self::WarmKeys),
            "hardware_nodes" => Ok(Self::HardwareNodes),
            other => anyhow::bail!("Unknown auxiliary kind: {}", other),
        }
    }
}

/// Work whose completion is recorded separately from its rows, because a
/// completed run may legitimately store none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheMark {
    /// Jail status cycle of an epoch
    JailStatus,

    /// Node health cycle, marked under the probed roster's epoch
    NodeHealth,

    /// Model aggregates of a finished epoch
    ModelAggregates,
}

impl CacheMark {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JailStatus => "jail_status",
            Self::NodeHealth => "node_health",
            Self::ModelAggregates => "model_aggregates",
        }
    }
}

/// Cached inference lists of one participant in one epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachedInferences {
    /// Lists per category; empty lists for categories with no row
    pub inferences: CategorizedInferences,

    /// Most recent write time across categories, `None` when never polled
    pub cached_at: Option<String>,
}
