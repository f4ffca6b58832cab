//! In-process chain for engine, service and HTTP tests.
//!
//! [`MockChain`] keeps rosters, participants, rewards and the other upstream
//! collections in memory, counts calls per endpoint and can inject failures
//! (per endpoint or per `endpoint:key`) and latency.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use inferwatch_core::{Epoch, EpochStages, Grant, HardwareNode, NodeWeight, WARM_KEY_REQUIRED_PERMISSIONS};

use crate::client::{
    CatalogModel, ChainApi, EpochRoster, HealthProbe, InferencePage, KeybaseProfile, MlNodeGroup,
    ModelUsage, PerformanceSummary, RosterEntry, Seed, SigningInfo, Validator, ValidatorPage,
    AUTHZ_PAGE_SIZE,
};

/// Model every participant of [`MockChain::with_current_epoch`] serves.
pub const DEFAULT_MODEL: &str = "Qwen/Qwen2.5-7B-Instruct";

/// Seconds between blocks in [`MockChain`] block times.
pub const BLOCK_SECONDS: i64 = 6;

const GENESIS_UNIX: i64 = 1_767_225_600;

/// Roster entry with one node per model, each carrying `weight`.
pub fn roster_entry(participant_id: &str, weight: i64, models: &[&str]) -> RosterEntry {
    RosterEntry {
        index: participant_id.to_string(),
        validator_key: Some(format!("key-{participant_id}")),
        weight,
        inference_url: Some(format!("http://{participant_id}.node:8080")),
        models: models.iter().map(|m| m.to_string()).collect(),
        seed: Some(Seed {
            signature: Some(format!("seed-{participant_id}")),
        }),
        ml_nodes: (0..models.len())
            .map(|i| MlNodeGroup {
                ml_nodes: vec![NodeWeight {
                    node_id: Some(format!("{participant_id}-node{i}")),
                    poc_weight: Some(weight),
                }],
            })
            .collect(),
    }
}

/// Participant record as the height-pinned participant list returns it.
pub fn participant_json(participant_id: &str) -> Value {
    json!({
        "index": participant_id,
        "address": participant_id,
        "inference_url": format!("http://{participant_id}.node:8080"),
        "status": "ACTIVE",
        "current_epoch_stats": {
            "inference_count": "90",
            "missed_requests": "10",
            "earned_coins": "1000",
            "rewarded_coins": "0",
            "burned_coins": "0",
            "validated_inferences": "40",
            "invalidated_inferences": "9"
        }
    })
}

/// Raw inference object.
pub fn inference_json(
    inference_id: &str,
    executed_by: &str,
    status: &str,
    epoch_id: u64,
    start_block_height: u64,
    start_block_timestamp: i64,
) -> Value {
    json!({
        "inference_id": inference_id,
        "executed_by": executed_by,
        "status": status,
        "epoch_id": epoch_id.to_string(),
        "start_block_height": start_block_height.to_string(),
        "start_block_timestamp": start_block_timestamp.to_string(),
        "model": DEFAULT_MODEL,
        "prompt_token_count": "12",
        "completion_token_count": "34"
    })
}

/// Grants that make `grantee` a warm key.
pub fn warm_grants(grantee: &str) -> Vec<Grant> {
    WARM_KEY_REQUIRED_PERMISSIONS
        .iter()
        .map(|msg| Grant {
            grantee: grantee.to_string(),
            authorization: inferwatch_core::authz::Authorization {
                msg: format!("/inference.inference.{msg}"),
            },
            expiration: Some("2027-01-01T00:00:00Z".to_string()),
        })
        .collect()
}

fn block_time_of(height: u64) -> String {
    let secs = GENESIS_UNIX + height as i64 * BLOCK_SECONDS;
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default()
}

#[derive(Default)]
struct MockState {
    current_epoch: u64,
    epoch_length: u64,
    height: u64,
    next_poc_start: Option<u64>,
    rosters: BTreeMap<u64, EpochRoster>,
    participants: Option<Vec<Value>>,
    inferences: Vec<Value>,
    inference_page_size: usize,
    validators: Vec<Validator>,
    signing_infos: HashMap<String, SigningInfo>,
    rewards: HashMap<(u64, String), PerformanceSummary>,
    rewards_settled_at: HashMap<u64, u64>,
    grants: HashMap<String, Vec<Grant>>,
    hardware: HashMap<String, Vec<HardwareNode>>,
    keybase: HashMap<String, KeybaseProfile>,
    unhealthy: HashMap<String, String>,
    catalog: Vec<CatalogModel>,
    usage: Vec<ModelUsage>,
    restriction_end_block: u64,
    failures: HashSet<String>,
    calls: HashMap<String, usize>,
    latency: Duration,
}

/// In-memory [`ChainApi`].
#[derive(Default)]
pub struct MockChain {
    state: Mutex<MockState>,
}

impl MockChain {
    /// Chain whose current epoch `epoch_id` took effect at `effective_height`
    /// with the given participants, each serving [`DEFAULT_MODEL`] at weight 100.
    pub fn with_current_epoch(
        epoch_id: u64,
        effective_height: u64,
        epoch_length: u64,
        participants: &[&str],
    ) -> Self {
        let chain = Self::default();
        {
            let mut state = chain.state();
            state.epoch_length = epoch_length;
            state.inference_page_size = 100;
            state.restriction_end_block = 1_500_000;
        }
        chain.advance_epoch(epoch_id, effective_height, participants);
        chain
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn enter(&self, endpoint: &str, key: Option<&str>) -> Result<()> {
        let latency = {
            let mut state = self.state();
            *state.calls.entry(endpoint.to_string()).or_default() += 1;
            state.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let state = self.state();
        if state.failures.contains(endpoint) {
            bail!("{} unavailable", endpoint);
        }
        if let Some(key) = key {
            if state.failures.contains(&format!("{endpoint}:{key}")) {
                bail!("{} unavailable for {}", endpoint, key);
            }
        }
        Ok(())
    }

    /// Roster with default participants.
    fn default_roster(epoch_id: u64, effective_height: u64, participants: &[&str]) -> EpochRoster {
        EpochRoster {
            epoch_id,
            effective_block_height: effective_height,
            poc_start_block_height: Some(effective_height.saturating_sub(10)),
            participants: participants
                .iter()
                .map(|p| roster_entry(p, 100, &[DEFAULT_MODEL]))
                .collect(),
        }
    }

    /// Add a roster for a past (or future) epoch.
    pub fn add_roster(&self, epoch_id: u64, effective_height: u64, participants: &[&str]) {
        self.set_roster(Self::default_roster(epoch_id, effective_height, participants));
    }

    /// Insert or replace a roster.
    pub fn set_roster(&self, roster: EpochRoster) {
        self.state().rosters.insert(roster.epoch_id, roster);
    }

    /// Move to a new current epoch; the height moves 100 blocks past its start.
    pub fn advance_epoch(&self, epoch_id: u64, effective_height: u64, participants: &[&str]) {
        self.add_roster(epoch_id, effective_height, participants);
        let mut state = self.state();
        state.current_epoch = epoch_id;
        state.height = effective_height + 100;
    }

    /// Roster of an epoch.
    pub fn roster(&self, epoch_id: u64) -> Option<EpochRoster> {
        self.state().rosters.get(&epoch_id).cloned()
    }

    /// Latest height.
    pub fn set_height(&self, height: u64) {
        self.state().height = height;
    }

    /// Next proof-of-compute start reported by the latest epoch.
    pub fn set_next_poc_start(&self, height: u64) {
        self.state().next_poc_start = Some(height);
    }

    /// Override the participant list (defaults to every roster member).
    pub fn set_participants(&self, participants: Vec<Value>) {
        self.state().participants = Some(participants);
    }

    /// Inference collection.
    pub fn set_inferences(&self, records: Vec<Value>) {
        self.state().inferences = records;
    }

    /// Records per inference page.
    pub fn set_inference_page_size(&self, size: usize) {
        self.state().inference_page_size = size.max(1);
    }

    /// Staking validators.
    pub fn set_validators(&self, validators: Vec<Validator>) {
        self.state().validators = validators;
    }

    /// Signing info of a consensus address.
    pub fn set_signing_info(&self, valcons: &str, info: SigningInfo) {
        self.state().signing_infos.insert(valcons.to_string(), info);
    }

    /// Performance summary of a participant in an epoch.
    pub fn set_reward(&self, participant_id: &str, epoch_id: u64, ugnk: &str, claimed: bool) {
        self.state().rewards.insert(
            (epoch_id, participant_id.to_string()),
            PerformanceSummary {
                rewarded_coins: ugnk.to_string(),
                claimed,
            },
        );
    }

    /// Rewards of an epoch read zero at heights below `height`.
    pub fn set_rewards_settled_at(&self, epoch_id: u64, height: u64) {
        self.state().rewards_settled_at.insert(epoch_id, height);
    }

    /// Authz grants issued by a participant.
    pub fn set_grants(&self, granter: &str, grants: Vec<Grant>) {
        self.state().grants.insert(granter.to_string(), grants);
    }

    /// Hardware nodes of a participant.
    pub fn set_hardware(&self, participant_id: &str, nodes: Vec<HardwareNode>) {
        self.state().hardware.insert(participant_id.to_string(), nodes);
    }

    /// Keybase profile of an identity.
    pub fn set_keybase(&self, identity: &str, username: &str, picture_url: &str) {
        self.state().keybase.insert(
            identity.to_string(),
            KeybaseProfile {
                username: username.to_string(),
                picture_url: picture_url.to_string(),
            },
        );
    }

    /// Make an inference endpoint report unhealthy.
    pub fn set_unhealthy(&self, inference_url: &str, message: &str) {
        self.state()
            .unhealthy
            .insert(inference_url.to_string(), message.to_string());
    }

    /// Governance model catalog.
    pub fn set_catalog(&self, models: Vec<CatalogModel>) {
        self.state().catalog = models;
    }

    /// Model usage statistics.
    pub fn set_usage(&self, usage: Vec<ModelUsage>) {
        self.state().usage = usage;
    }

    /// Restriction end height.
    pub fn set_restriction_end(&self, height: u64) {
        self.state().restriction_end_block = height;
    }

    /// Fail every call of an endpoint.
    pub fn fail(&self, endpoint: &str) {
        self.state().failures.insert(endpoint.to_string());
    }

    /// Fail calls of an endpoint for one key (participant, height or identity).
    pub fn fail_key(&self, endpoint: &str, key: &str) {
        self.state().failures.insert(format!("{endpoint}:{key}"));
    }

    /// Remove every injected failure.
    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// Delay applied to every call.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Calls made to an endpoint.
    pub fn calls(&self, endpoint: &str) -> usize {
        self.state().calls.get(endpoint).copied().unwrap_or(0)
    }

    /// Reset call counters.
    pub fn reset_calls(&self) {
        self.state().calls.clear();
    }
}

#[async_trait]
impl ChainApi for MockChain {
    async fn latest_height(&self) -> Result<u64> {
        self.enter("latest_height", None).await?;
        Ok(self.state().height)
    }

    async fn latest_epoch(&self) -> Result<Epoch> {
        self.enter("latest_epoch", None).await?;
        let state = self.state();
        let poc_start_height = state
            .rosters
            .get(&state.current_epoch)
            .map(|r| r.effective_block_height)
            .unwrap_or_default();
        Ok(Epoch {
            epoch_id: state.current_epoch,
            poc_start_height,
            epoch_length: state.epoch_length,
            stages: EpochStages {
                next_poc_start: state.next_poc_start,
                ..Default::default()
            },
        })
    }

    async fn current_epoch_roster(&self) -> Result<EpochRoster> {
        self.enter("current_epoch_roster", None).await?;
        let state = self.state();
        match state.rosters.get(&state.current_epoch) {
            Some(roster) => Ok(roster.clone()),
            None => bail!("No current roster"),
        }
    }

    async fn epoch_roster(&self, epoch_id: u64) -> Result<EpochRoster> {
        self.enter("epoch_roster", Some(&epoch_id.to_string())).await?;
        match self.state().rosters.get(&epoch_id) {
            Some(roster) => Ok(roster.clone()),
            None => bail!("Roster of epoch {} not found", epoch_id),
        }
    }

    async fn participants(&self, height: u64) -> Result<Vec<Value>> {
        self.enter("participants", Some(&height.to_string())).await?;
        let state = self.state();
        if let Some(participants) = &state.participants {
            return Ok(participants.clone());
        }
        let mut seen = HashSet::new();
        Ok(state
            .rosters
            .values()
            .flat_map(|r| r.participants.iter())
            .filter(|p| seen.insert(p.index.clone()))
            .map(|p| participant_json(&p.index))
            .collect())
    }

    async fn inference_page(&self, cursor: Option<&str>) -> Result<InferencePage> {
        self.enter("inference_page", cursor).await?;
        let state = self.state();
        let start: usize = match cursor {
            Some(c) => c.parse()?,
            None => 0,
        };
        let end = (start + state.inference_page_size).min(state.inferences.len());
        let records = state.inferences.get(start..end).unwrap_or_default().to_vec();
        let next_key = (end < state.inferences.len()).then(|| end.to_string());
        Ok(InferencePage { records, next_key })
    }

    async fn validators_page(&self, height: u64, _cursor: Option<&str>) -> Result<ValidatorPage> {
        self.enter("validators_page", Some(&height.to_string())).await?;
        Ok(ValidatorPage {
            validators: self.state().validators.clone(),
            next_key: None,
        })
    }

    async fn signing_info(&self, valcons: &str, _height: u64) -> Result<Option<SigningInfo>> {
        self.enter("signing_info", Some(valcons)).await?;
        Ok(self.state().signing_infos.get(valcons).cloned())
    }

    async fn performance_summary(
        &self,
        epoch_id: u64,
        participant_id: &str,
        height: Option<u64>,
    ) -> Result<PerformanceSummary> {
        self.enter("performance_summary", Some(participant_id)).await?;
        let state = self.state();
        let read_at = height.unwrap_or(state.height);
        if state
            .rewards_settled_at
            .get(&epoch_id)
            .is_some_and(|settled| read_at < *settled)
        {
            return Ok(PerformanceSummary {
                rewarded_coins: "0".to_string(),
                claimed: false,
            });
        }
        Ok(state
            .rewards
            .get(&(epoch_id, participant_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn authz_grants_page(&self, granter: &str, offset: usize) -> Result<Vec<Grant>> {
        self.enter("authz_grants_page", Some(granter)).await?;
        let state = self.state();
        let grants = state.grants.get(granter).map(Vec::as_slice).unwrap_or_default();
        let end = (offset + AUTHZ_PAGE_SIZE).min(grants.len());
        Ok(grants.get(offset..end).unwrap_or_default().to_vec())
    }

    async fn hardware_nodes(&self, participant_id: &str) -> Result<Vec<HardwareNode>> {
        self.enter("hardware_nodes", Some(participant_id)).await?;
        Ok(self
            .state()
            .hardware
            .get(participant_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn block_time(&self, height: u64) -> Result<String> {
        self.enter("block_time", Some(&height.to_string())).await?;
        Ok(block_time_of(height))
    }

    async fn restriction_end_block(&self) -> Result<u64> {
        self.enter("restriction_end_block", None).await?;
        Ok(self.state().restriction_end_block)
    }

    async fn models_catalog(&self) -> Result<Vec<CatalogModel>> {
        self.enter("models_catalog", None).await?;
        Ok(self.state().catalog.clone())
    }

    async fn model_usage_stats(&self) -> Result<Vec<ModelUsage>> {
        self.enter("model_usage_stats", None).await?;
        Ok(self.state().usage.clone())
    }

    async fn keybase_lookup(&self, identity: &str) -> Result<Option<KeybaseProfile>> {
        self.enter("keybase_lookup", Some(identity)).await?;
        Ok(self.state().keybase.get(identity).cloned())
    }

    async fn node_health(&self, inference_url: &str) -> HealthProbe {
        if let Err(e) = self.enter("node_health", Some(inference_url)).await {
            return HealthProbe {
                is_healthy: false,
                error_message: Some(e.to_string()),
                response_time_ms: None,
            };
        }
        match self.state().unhealthy.get(inference_url) {
            Some(message) => HealthProbe {
                is_healthy: false,
                error_message: Some(message.clone()),
                response_time_ms: Some(5),
            },
            None => HealthProbe {
                is_healthy: true,
                error_message: None,
                response_time_ms: Some(5),
            },
        }
    }
}
