//! Read service response shapes.

use serde::Serialize;

use inferwatch_core::{HardwareNode, InferenceRecord, ParticipantStats, WarmKey};

use crate::client::{CatalogModel, ModelUsage};

/// Summary of one epoch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochStats {
    pub epoch_id: u64,
    pub height: u64,
    pub participants: Vec<ParticipantStats>,
    pub cached_at: Option<String>,
    pub is_current: bool,
    /// Settled reward total; only reported for past epochs
    pub total_assigned_rewards_gnk: Option<u64>,
}

/// Reward of one participant in one epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RewardInfo {
    pub epoch_id: u64,
    pub assigned_reward_gnk: u64,
    pub claimed: bool,
}

/// Seed a participant submitted for an epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeedInfo {
    pub participant: String,
    pub epoch_index: u64,
    pub signature: String,
}

/// How an auxiliary list in a detail read was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AcquisitionStatus {
    /// Served from the cache
    Cached,
    /// Fetched inline by this read and stored
    Fetched,
    /// Fetch failed; will populate on schedule
    Unavailable,
}

/// Everything known about one participant in one epoch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParticipantDetail {
    pub participant: ParticipantStats,
    /// Newest epoch first
    pub rewards: Vec<RewardInfo>,
    pub seed: Option<SeedInfo>,
    pub warm_keys: Vec<WarmKey>,
    pub warm_keys_status: AcquisitionStatus,
    pub ml_nodes: Vec<HardwareNode>,
    pub ml_nodes_status: AcquisitionStatus,
}

/// Categorized recent inferences of one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParticipantInferences {
    pub epoch_id: u64,
    pub participant_id: String,
    pub successful: Vec<InferenceRecord>,
    pub expired: Vec<InferenceRecord>,
    pub invalidated: Vec<InferenceRecord>,
    /// `None` until the participant has been polled for the epoch
    pub cached_at: Option<String>,
}

/// Reward total of a finished epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EpochRewardTotal {
    pub epoch_id: u64,
    /// `None` while upstream settlement is not yet reflected
    pub total_assigned_rewards_gnk: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockInfo {
    pub height: u64,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimelineEvent {
    pub block_height: u64,
    pub description: String,
    pub occurred: bool,
}

/// Block timing and chain milestones.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Timeline {
    pub current_block: BlockInfo,
    pub reference_block: BlockInfo,
    /// Seconds per block over the reference window, 2 decimals
    pub avg_block_time: f64,
    pub events: Vec<TimelineEvent>,
    pub current_epoch_start: u64,
    pub current_epoch_index: u64,
    pub epoch_length: u64,
}

/// A catalog model with its weight in an epoch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    #[serde(flatten)]
    pub model: CatalogModel,
    pub total_weight: i64,
    pub participant_count: u64,
}

/// Which epoch a models read targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelScope {
    /// Current epoch, height-agnostic
    Current,
    /// A given epoch, optionally at a height
    Epoch { epoch_id: u64, height: Option<u64> },
}

/// Model distribution of an epoch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelsOverview {
    pub epoch_id: u64,
    pub height: u64,
    pub models: Vec<ModelInfo>,
    pub stats: Vec<ModelUsage>,
    pub cached_at: String,
    pub is_current: bool,
}
