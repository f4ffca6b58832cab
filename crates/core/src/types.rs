//! Core types for the inference chain cache.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::constants::{UGNK_PER_GNK, UNSET_JAILED_UNTIL_PREFIX};
use crate::de::{flexible_opt_i64, flexible_opt_u64, flexible_string};

/// Stage heights of an epoch.
///
/// The current epoch's stages may still be refined by the chain; a fully
/// elapsed epoch's stages are fixed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochStages {
    /// Height at which the proof-of-compute phase starts.
    #[serde(default, deserialize_with = "flexible_opt_u64")]
    pub poc_start: Option<u64>,

    /// Last height at which inferences of this epoch may still be validated.
    #[serde(
        default,
        alias = "inference_validation_cutoff",
        deserialize_with = "flexible_opt_u64"
    )]
    pub validation_cutoff: Option<u64>,

    /// Height at which the next validator set takes effect.
    #[serde(default, deserialize_with = "flexible_opt_u64")]
    pub set_new_validators: Option<u64>,

    /// Height at which the next epoch's proof-of-compute phase starts.
    #[serde(default, deserialize_with = "flexible_opt_u64")]
    pub next_poc_start: Option<u64>,
}

/// Epoch metadata as reported by the latest-epoch endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epoch {
    /// Epoch index.
    pub epoch_id: u64,

    /// Height of the epoch's proof-of-compute start.
    pub poc_start_height: u64,

    /// Epoch length in blocks.
    pub epoch_length: u64,

    /// Stage heights.
    pub stages: EpochStages,
}

/// Per-epoch counters as reported by the chain.
///
/// The chain encodes them as decimal strings (coin amounts exceed `u64`);
/// they are kept verbatim and parsed on demand.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochCounters {
    /// Inferences served.
    #[serde(deserialize_with = "flexible_string")]
    pub inference_count: String,
    /// Requests the participant failed to serve.
    #[serde(deserialize_with = "flexible_string")]
    pub missed_requests: String,
    /// Coins earned so far.
    #[serde(deserialize_with = "flexible_string")]
    pub earned_coins: String,
    /// Coins rewarded so far.
    #[serde(deserialize_with = "flexible_string")]
    pub rewarded_coins: String,
    /// Coins burned so far.
    #[serde(deserialize_with = "flexible_string")]
    pub burned_coins: String,
    /// Inferences this participant validated.
    #[serde(deserialize_with = "flexible_string")]
    pub validated_inferences: String,
    /// Inferences of this participant that were invalidated.
    #[serde(deserialize_with = "flexible_string")]
    pub invalidated_inferences: String,
}

fn parse_count(raw: &str) -> u64 {
    raw.trim().parse().unwrap_or(0)
}

fn rounded_ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        return 0.0;
    }
    let ratio = numerator as f64 / denominator as f64;
    (ratio * 10_000.0).round() / 10_000.0
}

impl EpochCounters {
    /// `missed / (missed + inferences)`, rounded to 4 decimals.
    pub fn missed_rate(&self) -> f64 {
        let missed = parse_count(&self.missed_requests);
        let served = parse_count(&self.inference_count);
        rounded_ratio(missed, missed.saturating_add(served))
    }

    /// `invalidated / inferences`, rounded to 4 decimals.
    pub fn invalidation_rate(&self) -> f64 {
        rounded_ratio(
            parse_count(&self.invalidated_inferences),
            parse_count(&self.inference_count),
        )
    }
}

/// Weight contributed by one ML node during proof-of-compute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeWeight {
    /// Node identifier; upstream occasionally omits it.
    #[serde(default)]
    pub node_id: Option<String>,

    /// Proof-of-compute weight; upstream occasionally omits it.
    #[serde(default, deserialize_with = "flexible_opt_i64")]
    pub poc_weight: Option<i64>,
}

/// A model served by a participant together with the nodes backing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelWeights {
    /// Model identifier.
    pub model_id: String,

    /// Nodes serving this model.
    pub node_weights: Vec<NodeWeight>,
}

impl ModelWeights {
    /// Sum of node weights; missing weights count as zero.
    pub fn total_weight(&self) -> i64 {
        self.node_weights
            .iter()
            .map(|n| n.poc_weight.unwrap_or(0))
            .sum()
    }
}

/// One participant's state in one epoch.
///
/// Historical snapshots never change; the current epoch's snapshot is
/// refreshed in place on every poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantSnapshot {
    /// Participant address (the chain calls it `index`).
    pub participant_id: String,

    /// Account address.
    pub address: String,

    /// Epoch weight.
    pub weight: i64,

    /// Validator consensus key registered for the epoch.
    #[serde(default)]
    pub validator_key: Option<String>,

    /// Public inference endpoint.
    #[serde(default)]
    pub inference_url: Option<String>,

    /// Participant status string.
    #[serde(default)]
    pub status: Option<String>,

    /// Models declared for the epoch.
    #[serde(default)]
    pub models: Vec<String>,

    /// Per-model node weights, explicitly paired.
    #[serde(default)]
    pub model_weights: Vec<ModelWeights>,

    /// Raw per-epoch counters.
    pub counters: EpochCounters,

    /// Seed signature submitted for the epoch.
    #[serde(default)]
    pub seed_signature: Option<String>,
}

impl ParticipantSnapshot {
    /// Map of node id to proof-of-compute weight.
    ///
    /// Nodes lacking an id or a weight are skipped; a zero weight is kept.
    pub fn ml_node_weights(&self) -> HashMap<String, i64> {
        let mut map = HashMap::new();
        for group in &self.model_weights {
            for node in &group.node_weights {
                if let (Some(id), Some(weight)) = (node.node_id.as_ref(), node.poc_weight) {
                    if !id.is_empty() {
                        map.insert(id.clone(), weight);
                    }
                }
            }
        }
        map
    }
}

/// Inference status as reported upstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InferenceStatus {
    /// Completed by the executor.
    Finished,
    /// Completed and validated.
    Validated,
    /// Never completed.
    Expired,
    /// Rejected by validators.
    Invalidated,
    /// Any other status (started, voting, ...).
    Other(String),
}

impl InferenceStatus {
    /// Parse an upstream status string (case-insensitive).
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "FINISHED" => Self::Finished,
            "VALIDATED" => Self::Validated,
            "EXPIRED" => Self::Expired,
            "INVALIDATED" => Self::Invalidated,
            _ => Self::Other(raw.to_string()),
        }
    }

    /// Cache category, or `None` when records with this status are not retained.
    pub fn category(&self) -> Option<InferenceCategory> {
        match self {
            Self::Finished | Self::Validated => Some(InferenceCategory::Successful),
            Self::Expired => Some(InferenceCategory::Expired),
            Self::Invalidated => Some(InferenceCategory::Invalidated),
            Self::Other(_) => None,
        }
    }
}

/// Category under which inference records are cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceCategory {
    /// FINISHED or VALIDATED.
    Successful,
    /// EXPIRED.
    Expired,
    /// INVALIDATED.
    Invalidated,
}

impl InferenceCategory {
    /// Every category, in display order.
    pub const ALL: [InferenceCategory; 3] = [
        InferenceCategory::Successful,
        InferenceCategory::Expired,
        InferenceCategory::Invalidated,
    ];

    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Successful => "successful",
            Self::Expired => "expired",
            Self::Invalidated => "invalidated",
        }
    }
}

impl fmt::Display for InferenceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InferenceCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "successful" => Ok(Self::Successful),
            "expired" => Ok(Self::Expired),
            "invalidated" => Ok(Self::Invalidated),
            other => Err(format!("Unknown inference category: {}", other)),
        }
    }
}

/// An inference record as retained in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceRecord {
    /// Inference identifier.
    pub inference_id: String,
    /// Upstream status string.
    pub status: String,
    /// Height at which the inference started.
    pub start_block_height: String,
    /// Timestamp (unix millis) of the start block.
    pub start_block_timestamp: String,
    /// Validators that validated this inference.
    #[serde(default)]
    pub validated_by: Vec<String>,
    /// Hash of the prompt.
    #[serde(default)]
    pub prompt_hash: Option<String>,
    /// Hash of the response.
    #[serde(default)]
    pub response_hash: Option<String>,
    /// Prompt payload.
    #[serde(default)]
    pub prompt_payload: Option<String>,
    /// Response payload.
    #[serde(default)]
    pub response_payload: Option<String>,
    /// Prompt token count.
    #[serde(default)]
    pub prompt_token_count: Option<String>,
    /// Completion token count.
    #[serde(default)]
    pub completion_token_count: Option<String>,
    /// Model that served the inference.
    #[serde(default)]
    pub model: Option<String>,
}

/// Derived per-model aggregate for one epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelAggregate {
    /// Epoch the aggregate belongs to.
    pub epoch_id: u64,
    /// Model identifier.
    pub model_id: String,
    /// Sum of node weights backing the model.
    pub total_weight: i64,
    /// Number of distinct participants serving the model.
    pub participant_count: u64,
}

/// A delegated authorization grantee holding every required permission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmKey {
    /// Grantee address.
    pub grantee_address: String,
    /// Grant expiration as reported upstream.
    pub granted_at: String,
}

/// Hardware entry on an ML node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareInfo {
    /// Hardware kind (e.g. GPU model).
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Number of units.
    #[serde(default)]
    pub count: u64,
}

/// Hardware report of one ML node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareNode {
    /// Node identifier local to the participant.
    #[serde(default)]
    pub local_id: String,
    /// Node status.
    #[serde(default, deserialize_with = "flexible_string")]
    pub status: String,
    /// Models loaded on the node.
    #[serde(default)]
    pub models: Vec<String>,
    /// Hardware inventory.
    #[serde(default)]
    pub hardware: Vec<HardwareInfo>,
    /// Node host.
    #[serde(default, deserialize_with = "flexible_string")]
    pub host: String,
    /// Node port.
    #[serde(default, deserialize_with = "flexible_string")]
    pub port: String,
    /// Weight reported with the node, if any.
    #[serde(default, deserialize_with = "flexible_opt_i64")]
    pub poc_weight: Option<i64>,
}

/// A participant's reward for one settled epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardRecord {
    /// Epoch.
    pub epoch_id: u64,
    /// Participant address.
    pub participant_id: String,
    /// Reward in ugnk, as a decimal string.
    pub rewarded_coins: String,
    /// Whether the reward was claimed.
    pub claimed: bool,
}

impl RewardRecord {
    /// Reward in ugnk; unparsable amounts read as zero.
    pub fn ugnk(&self) -> u128 {
        self.rewarded_coins.trim().parse().unwrap_or(0)
    }

    /// Reward in whole GNK.
    pub fn gnk(&self) -> u64 {
        ugnk_to_gnk(self.ugnk())
    }
}

/// Convert ugnk to whole GNK (integer division).
pub fn ugnk_to_gnk(ugnk: u128) -> u64 {
    u64::try_from(ugnk / UGNK_PER_GNK).unwrap_or(u64::MAX)
}

/// Validator jail state and public metadata for one participant in one epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JailStatus {
    /// Participant address.
    pub participant_id: String,
    /// Whether the validator is jailed.
    pub is_jailed: bool,
    /// Jail release time, if jailed.
    pub jailed_until: Option<String>,
    /// Whether the release time has passed.
    pub ready_to_unjail: bool,
    /// Consensus address.
    pub valcons_address: Option<String>,
    /// Validator moniker.
    pub moniker: Option<String>,
    /// Keybase identity.
    pub identity: Option<String>,
    /// Keybase username.
    pub keybase_username: Option<String>,
    /// Keybase avatar URL.
    pub keybase_picture_url: Option<String>,
    /// Validator website.
    pub website: Option<String>,
    /// Consensus key registered on the staking module.
    pub validator_consensus_key: Option<String>,
    /// Whether the staking key differs from the epoch's validator key.
    pub consensus_key_mismatch: Option<bool>,
}

impl JailStatus {
    /// Filter the slashing module's "never jailed" sentinel.
    pub fn meaningful_jailed_until(raw: Option<&str>) -> Option<String> {
        raw.filter(|s| !s.is_empty() && !s.contains(UNSET_JAILED_UNTIL_PREFIX))
            .map(str::to_string)
    }
}

/// Last health probe of a participant's inference endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHealth {
    /// Participant address.
    pub participant_id: String,
    /// Whether `/health` answered 200.
    pub is_healthy: bool,
    /// Failure description.
    pub error_message: Option<String>,
    /// Round-trip time in milliseconds, when a response arrived.
    pub response_time_ms: Option<u64>,
    /// Probe time (RFC 3339).
    pub checked_at: String,
}

/// Participant row of an epoch summary: snapshot plus derived and merged fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantStats {
    /// Participant address.
    pub index: String,
    /// Account address.
    pub address: String,
    /// Epoch weight.
    pub weight: i64,
    /// Validator key registered for the epoch.
    pub validator_key: Option<String>,
    /// Inference endpoint.
    pub inference_url: Option<String>,
    /// Participant status.
    pub status: Option<String>,
    /// Models served.
    pub models: Vec<String>,
    /// Raw counters.
    pub current_epoch_stats: EpochCounters,
    /// Missed request rate.
    pub missed_rate: f64,
    /// Invalidation rate.
    pub invalidation_rate: f64,
    /// Jailed flag (absent until jail status is known).
    pub is_jailed: Option<bool>,
    /// Jail release time.
    pub jailed_until: Option<String>,
    /// Whether the validator may unjail.
    pub ready_to_unjail: Option<bool>,
    /// Endpoint health.
    pub node_healthy: Option<bool>,
    /// Health probe time.
    pub node_health_checked_at: Option<String>,
    /// Validator moniker.
    pub moniker: Option<String>,
    /// Keybase identity.
    pub identity: Option<String>,
    /// Keybase username.
    pub keybase_username: Option<String>,
    /// Keybase avatar.
    pub keybase_picture_url: Option<String>,
    /// Website.
    pub website: Option<String>,
    /// Staking consensus key.
    pub validator_consensus_key: Option<String>,
    /// Consensus key mismatch flag.
    pub consensus_key_mismatch: Option<bool>,
}

impl From<&ParticipantSnapshot> for ParticipantStats {
    fn from(s: &ParticipantSnapshot) -> Self {
        Self {
            index: s.participant_id.clone(),
            address: s.address.clone(),
            weight: s.weight,
            validator_key: s.validator_key.clone(),
            inference_url: s.inference_url.clone(),
            status: s.status.clone(),
            models: s.models.clone(),
            missed_rate: s.counters.missed_rate(),
            invalidation_rate: s.counters.invalidation_rate(),
            current_epoch_stats: s.counters.clone(),
            is_jailed: None,
            jailed_until: None,
            ready_to_unjail: None,
            node_healthy: None,
            node_health_checked_at: None,
            moniker: None,
            identity: None,
            keybase_username: None,
            keybase_picture_url: None,
            website: None,
            validator_consensus_key: None,
            consensus_key_mismatch: None,
        }
    }
}

impl ParticipantStats {
    /// Merge validator jail state and metadata.
    pub fn apply_jail(&mut self, jail: &JailStatus) {
        self.is_jailed = Some(jail.is_jailed);
        self.jailed_until = jail.jailed_until.clone();
        self.ready_to_unjail = Some(jail.ready_to_unjail);
        self.moniker = jail.moniker.clone();
        self.identity = jail.identity.clone();
        self.keybase_username = jail.keybase_username.clone();
        self.keybase_picture_url = jail.keybase_picture_url.clone();
        self.website = jail.website.clone();
        self.validator_consensus_key = jail.validator_consensus_key.clone();
        self.consensus_key_mismatch = jail.consensus_key_mismatch;
    }

    /// Merge the endpoint health probe.
    pub fn apply_health(&mut self, health: &NodeHealth) {
        self.node_healthy = Some(health.is_healthy);
        self.node_health_checked_at = Some(health.checked_at.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(inferences: &str, missed: &str, invalidated: &str) -> EpochCounters {
        EpochCounters {
            inference_count: inferences.to_string(),
            missed_requests: missed.to_string(),
            invalidated_inferences: invalidated.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_rates() {
        let c = counters("97", "3", "1");
        assert_eq!(c.missed_rate(), 0.03);
        assert_eq!(c.invalidation_rate(), 0.0103);

        let idle = counters("0", "0", "0");
        assert_eq!(idle.missed_rate(), 0.0);
        assert_eq!(idle.invalidation_rate(), 0.0);

        let all_missed = counters("0", "5", "0");
        assert_eq!(all_missed.missed_rate(), 1.0);
        assert_eq!(all_missed.invalidation_rate(), 0.0);
    }

    #[test]
    fn test_ml_node_weights_skip_incomplete_entries() {
        let snapshot = ParticipantSnapshot {
            participant_id: "p1".into(),
            address: "p1".into(),
            weight: 10,
            validator_key: None,
            inference_url: None,
            status: None,
            models: vec!["m".into()],
            model_weights: vec![ModelWeights {
                model_id: "m".into(),
                node_weights: vec![
                    NodeWeight {
                        node_id: Some("node1".into()),
                        poc_weight: Some(1000),
                    },
                    NodeWeight {
                        node_id: None,
                        poc_weight: Some(500),
                    },
                    NodeWeight {
                        node_id: Some("node2".into()),
                        poc_weight: None,
                    },
                    NodeWeight {
                        node_id: Some("node3".into()),
                        poc_weight: Some(0),
                    },
                ],
            }],
            counters: EpochCounters::default(),
            seed_signature: None,
        };

        let map = snapshot.ml_node_weights();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("node1"), Some(&1000));
        assert_eq!(map.get("node3"), Some(&0));
        assert_eq!(snapshot.model_weights[0].total_weight(), 1500);
    }

    #[test]
    fn test_inference_status_categories() {
        assert_eq!(
            InferenceStatus::parse("FINISHED").category(),
            Some(InferenceCategory::Successful)
        );
        assert_eq!(
            InferenceStatus::parse("validated").category(),
            Some(InferenceCategory::Successful)
        );
        assert_eq!(
            InferenceStatus::parse("EXPIRED").category(),
            Some(InferenceCategory::Expired)
        );
        assert_eq!(
            InferenceStatus::parse("INVALIDATED").category(),
            Some(InferenceCategory::Invalidated)
        );
        assert_eq!(InferenceStatus::parse("STARTED").category(), None);
    }

    #[test]
    fn test_category_round_trip() {
        for category in InferenceCategory::ALL {
            assert_eq!(category.as_str().parse::<InferenceCategory>(), Ok(category));
        }
        assert!("pending".parse::<InferenceCategory>().is_err());
    }

    #[test]
    fn test_reward_units() {
        let reward = RewardRecord {
            epoch_id: 57,
            participant_id: "p1".into(),
            rewarded_coins: "2500000000000".into(),
            claimed: false,
        };
        assert_eq!(reward.gnk(), 2500);
        assert_eq!(ugnk_to_gnk(999_999_999), 0);
    }

    #[test]
    fn test_jailed_until_sentinel() {
        assert_eq!(
            JailStatus::meaningful_jailed_until(Some("1970-01-01T00:00:00Z")),
            None
        );
        assert_eq!(
            JailStatus::meaningful_jailed_until(Some("2025-03-01T10:00:00Z")),
            Some("2025-03-01T10:00:00Z".to_string())
        );
        assert_eq!(JailStatus::meaningful_jailed_until(None), None);
    }
}
