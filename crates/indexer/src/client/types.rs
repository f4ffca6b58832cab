//! Upstream response shapes.
//!
//! Only the fields the cache uses are modeled. Numeric fields go through the
//! lenient deserializers because gateways encode 64-bit values as strings.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use inferwatch_core::de::{flexible_i64, flexible_opt_u64, flexible_string, flexible_u64};
use inferwatch_core::{EpochStages, NodeWeight};

/// Raw shape of `/v1/epochs/latest`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct LatestEpochResponse {
    pub latest_epoch: LatestEpochInfo,
    pub epoch_params: EpochParams,
    #[serde(default)]
    pub epoch_stages: EpochStages,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct LatestEpochInfo {
    #[serde(deserialize_with = "flexible_u64")]
    pub index: u64,
    #[serde(deserialize_with = "flexible_u64")]
    pub poc_start_block_height: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct EpochParams {
    #[serde(deserialize_with = "flexible_u64")]
    pub epoch_length: u64,
}

/// Seed submitted by a participant for an epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seed {
    /// Seed signature
    #[serde(default)]
    pub signature: Option<String>,
}

/// One group of ML nodes backing one declared model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MlNodeGroup {
    /// Nodes in the group
    #[serde(default)]
    pub ml_nodes: Vec<NodeWeight>,
}

/// A participant entry of an epoch roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    /// Participant address
    pub index: String,

    /// Validator consensus key
    #[serde(default)]
    pub validator_key: Option<String>,

    /// Epoch weight
    #[serde(default, deserialize_with = "flexible_i64")]
    pub weight: i64,

    /// Inference endpoint
    #[serde(default)]
    pub inference_url: Option<String>,

    /// Declared models, parallel to `ml_nodes`
    #[serde(default)]
    pub models: Vec<String>,

    /// Seed
    #[serde(default)]
    pub seed: Option<Seed>,

    /// Node groups, parallel to `models`
    #[serde(default)]
    pub ml_nodes: Vec<MlNodeGroup>,
}

/// Active participants of an epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochRoster {
    /// Epoch id (the chain calls it `epoch_group_id`)
    #[serde(rename = "epoch_group_id", deserialize_with = "flexible_u64")]
    pub epoch_id: u64,

    /// Height at which the epoch took effect
    #[serde(deserialize_with = "flexible_u64")]
    pub effective_block_height: u64,

    /// Proof-of-compute start height
    #[serde(default, deserialize_with = "flexible_opt_u64")]
    pub poc_start_block_height: Option<u64>,

    /// Participants
    #[serde(default)]
    pub participants: Vec<RosterEntry>,
}

impl EpochRoster {
    /// Participant addresses.
    pub fn participant_ids(&self) -> Vec<String> {
        self.participants.iter().map(|p| p.index.clone()).collect()
    }

    /// Roster entry of one participant.
    pub fn find(&self, participant_id: &str) -> Option<&RosterEntry> {
        self.participants.iter().find(|p| p.index == participant_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RosterResponse {
    pub active_participants: EpochRoster,
}

/// Participant record from the height-pinned participant list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ParticipantRecord {
    /// Participant address
    pub index: String,

    /// Account address
    pub address: String,

    /// Inference endpoint
    #[serde(default)]
    pub inference_url: Option<String>,

    /// Status
    #[serde(default)]
    pub status: Option<String>,

    /// Per-epoch counters
    pub current_epoch_stats: inferwatch_core::EpochCounters,
}

/// One page of the bulk inference collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferencePage {
    /// Raw inference objects; parsed per record so one defect skips one record
    pub records: Vec<Value>,

    /// Continuation cursor, `None` on the last page
    pub next_key: Option<String>,
}

/// Consensus public key of a validator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ConsensusPubkey {
    /// Base64 key (amino JSON)
    #[serde(default)]
    pub key: Option<String>,

    /// Base64 key (legacy shape)
    #[serde(default)]
    pub value: Option<String>,
}

/// Validator description.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ValidatorDescription {
    /// Moniker
    #[serde(default)]
    pub moniker: String,

    /// Keybase identity
    #[serde(default)]
    pub identity: String,

    /// Website
    #[serde(default)]
    pub website: String,
}

/// A staking validator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Validator {
    /// Operator address
    #[serde(default)]
    pub operator_address: String,

    /// Consensus public key
    #[serde(default)]
    pub consensus_pubkey: Option<ConsensusPubkey>,

    /// Jailed flag
    #[serde(default)]
    pub jailed: bool,

    /// Bonded tokens
    #[serde(default, deserialize_with = "flexible_string")]
    pub tokens: String,

    /// Description
    #[serde(default)]
    pub description: ValidatorDescription,
}

impl Validator {
    /// Base64 consensus key, whichever shape carries it.
    pub fn consensus_key(&self) -> Option<&str> {
        let pubkey = self.consensus_pubkey.as_ref()?;
        pubkey
            .key
            .as_deref()
            .or(pubkey.value.as_deref())
            .filter(|k| !k.is_empty())
    }

    /// Whether the validator has bonded tokens.
    pub fn has_tokens(&self) -> bool {
        self.tokens.trim().parse::<u128>().map_or(false, |t| t > 0)
    }
}

/// One page of validators.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidatorPage {
    /// Validators
    pub validators: Vec<Validator>,

    /// Continuation cursor
    pub next_key: Option<String>,
}

/// Slashing signing info of a validator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SigningInfo {
    /// Jail release time
    #[serde(default)]
    pub jailed_until: Option<String>,
}

/// A participant's performance summary for one epoch.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PerformanceSummary {
    /// Reward in ugnk
    #[serde(default = "zero_coins", deserialize_with = "flexible_string")]
    pub rewarded_coins: String,

    /// Whether the reward was claimed
    #[serde(default)]
    pub claimed: bool,
}

impl Default for PerformanceSummary {
    fn default() -> Self {
        Self {
            rewarded_coins: zero_coins(),
            claimed: false,
        }
    }
}

fn zero_coins() -> String {
    "0".to_string()
}

/// Governance-registered model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogModel {
    /// Model id
    pub id: String,

    /// Proposer
    #[serde(default, deserialize_with = "flexible_string")]
    pub proposed_by: String,

    /// VRAM requirement
    #[serde(default, deserialize_with = "flexible_string")]
    pub v_ram: String,

    /// Throughput per nonce
    #[serde(default, deserialize_with = "flexible_string")]
    pub throughput_per_nonce: String,

    /// Compute units per token
    #[serde(default, deserialize_with = "flexible_string")]
    pub units_of_compute_per_token: String,

    /// Hugging Face repository
    #[serde(default, deserialize_with = "flexible_string")]
    pub hf_repo: String,

    /// Hugging Face commit
    #[serde(default, deserialize_with = "flexible_string")]
    pub hf_commit: String,

    /// Serving arguments
    #[serde(default)]
    pub model_args: Vec<String>,

    /// Validation threshold, passed through as reported
    #[serde(default)]
    pub validation_threshold: Value,
}

/// Usage statistics of one model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelUsage {
    /// Model id
    #[serde(default)]
    pub model: String,

    /// Tokens served
    #[serde(default = "zero_coins", deserialize_with = "flexible_string")]
    pub ai_tokens: String,

    /// Inferences served
    #[serde(default, deserialize_with = "flexible_u64")]
    pub inferences: u64,
}

/// Keybase profile of a validator identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeybaseProfile {
    /// Username
    pub username: String,

    /// Avatar URL
    pub picture_url: String,
}

/// Result of probing an inference endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthProbe {
    /// Whether `/health` answered 200
    pub is_healthy: bool,

    /// Failure description
    pub error_message: Option<String>,

    /// Round trip, when a response arrived
    pub response_time_ms: Option<u64>,
}

impl HealthProbe {
    /// Probe result for a participant without an endpoint.
    pub fn no_url() -> Self {
        Self {
            is_healthy: false,
            error_message: Some("No inference URL".to_string()),
            response_time_ms: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_roster_parses_chain_shape() {
        let raw = json!({
            "active_participants": {
                "epoch_group_id": "65",
                "effective_block_height": 1_000_000,
                "poc_start_block_height": "999990",
                "participants": [{
                    "index": "gonka1abc",
                    "validator_key": "a2V5",
                    "weight": "1200",
                    "inference_url": "http://node:8080",
                    "models": ["Qwen/Qwen2.5-7B-Instruct"],
                    "seed": {"signature": "deadbeef"},
                    "ml_nodes": [{"ml_nodes": [{"node_id": "n1", "poc_weight": 1200}]}]
                }]
            }
        });

        let parsed: RosterResponse = serde_json::from_value(raw).unwrap();
        let roster = parsed.active_participants;
        assert_eq!(roster.epoch_id, 65);
        assert_eq!(roster.effective_block_height, 1_000_000);
        assert_eq!(roster.participant_ids(), vec!["gonka1abc".to_string()]);

        let entry = roster.find("gonka1abc").unwrap();
        assert_eq!(entry.weight, 1200);
        assert_eq!(entry.ml_nodes[0].ml_nodes[0].poc_weight, Some(1200));
        assert_eq!(entry.seed.as_ref().unwrap().signature.as_deref(), Some("deadbeef"));
    }

    #[test]
    fn test_validator_helpers() {
        let v: Validator = serde_json::from_value(json!({
            "operator_address": "gonkavaloper1xyz",
            "consensus_pubkey": {"@type": "/cosmos.crypto.ed25519.PubKey", "key": "AAAA"},
            "jailed": true,
            "tokens": "1000",
            "description": {"moniker": "m"}
        }))
        .unwrap();
        assert_eq!(v.consensus_key(), Some("AAAA"));
        assert!(v.has_tokens());

        let empty = Validator::default();
        assert_eq!(empty.consensus_key(), None);
        assert!(!empty.has_tokens());
    }

    #[test]
    fn test_performance_summary_defaults() {
        let s: PerformanceSummary = serde_json::from_value(json!({})).unwrap();
        assert_eq!(s.rewarded_coins, "0");
        assert!(!s.claimed);
    }
}
