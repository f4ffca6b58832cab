//! Read service: cached and derived views for the HTTP surface.
//!
//! The service never writes entities itself. It reads the cache, asks the
//! engine for inline fetches on a miss and triggers the proactive warm after a
//! current-epoch read and the epoch fill after a historical one. The only other side effect is the reward total
//! self-heal, which also runs through the engine.

use chrono::DateTime;
use serde::de::DeserializeOwned;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use inferwatch_core::{
    aggregate_models, HardwareNode, InferenceCategory, JailStatus, ModelAggregate, NodeHealth,
    ParticipantSnapshot, ParticipantStats, WarmKey, TIMELINE_REFERENCE_DISTANCE,
};

use crate::client::{CatalogModel, EpochRoster};
use crate::error::{ResultExt, ServiceError, ServiceResult};
use crate::storage::{AuxiliaryKind, CacheMark, SnapshotSet};
use crate::sync::{CurrentEpoch, FetchOutcome, SyncEngine};

pub mod types;

pub use types::*;

/// Description of the restriction end milestone.
pub const TRANSFER_ENABLED_EVENT: &str = "Money Transfer Enabled";

/// Read-only view over the cache.
pub struct ReadService {
    engine: Arc<SyncEngine>,
    current_epoch_max_age: Duration,
}

/// A past epoch resolved to the height it is read at.
struct HistoricalRead {
    roster: EpochRoster,
    snapshots: SnapshotSet,
}

impl ReadService {
    /// Create a service over an engine.
    pub fn new(engine: Arc<SyncEngine>, current_epoch_max_age: Duration) -> Self {
        Self {
            engine,
            current_epoch_max_age,
        }
    }

    /// The engine behind the service.
    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// The current epoch index: reused while fresh, refreshed otherwise.
    ///
    /// Without an index the latest cached rows of the current epoch are
    /// served; upstream is only asked for snapshots when none are cached. A
    /// failed refresh falls back to a stale index when one exists.
    async fn current_index(&self, reload: bool) -> ServiceResult<Arc<CurrentEpoch>> {
        let existing = self.engine.current_epoch().await;
        match &existing {
            Some(index) if !reload && index.age() < self.current_epoch_max_age => {
                debug!(
                    "Serving current epoch {} from memory (age {:?})",
                    index.epoch_id(),
                    index.age()
                );
                return Ok(Arc::clone(index));
            }
            None if !reload => match self.engine.restore_current_epoch().await {
                Ok(Some(index)) => return Ok(index),
                Ok(None) => debug!("No cached rows of the current epoch"),
                Err(ServiceError::Storage(e)) => return Err(ServiceError::Storage(e)),
                Err(e) => warn!("Current epoch not restorable from cache: {}", e),
            },
            _ => {}
        }

        match self.engine.refresh_current_epoch().await {
            Ok(index) => Ok(index),
            Err(e) => match existing {
                Some(stale) => {
                    warn!("Current epoch refresh failed, serving stale data: {}", e);
                    Ok(stale)
                }
                None => Err(e),
            },
        }
    }

    /// Id of the current epoch.
    async fn current_epoch_id(&self) -> ServiceResult<u64> {
        let existing = self.engine.current_epoch().await;
        if let Some(index) = &existing {
            if index.age() < self.current_epoch_max_age {
                return Ok(index.epoch_id());
            }
        }
        match self.engine.chain().latest_epoch().await {
            Ok(latest) => Ok(latest.epoch_id),
            Err(e) => match existing {
                Some(stale) => {
                    warn!("Latest epoch unavailable, assuming epoch {}: {:#}", stale.epoch_id(), e);
                    Ok(stale.epoch_id())
                }
                None => Err(ServiceError::Upstream(e)),
            },
        }
    }

    /// Participant stats with jail status and node health merged in.
    ///
    /// Jail status or node health that was never polled is filled inline; a
    /// failing inline fetch leaves the fields unset. A completed cycle that
    /// stored no rows is served as is.
    async fn merge_validator_data(
        &self,
        epoch_id: u64,
        height: u64,
        roster: &EpochRoster,
        snapshots: &[ParticipantSnapshot],
    ) -> ServiceResult<Vec<ParticipantStats>> {
        let storage = self.engine.storage();

        let mut jail = storage.get_jail_statuses(epoch_id).await.storage()?;
        if jail.is_empty()
            && storage
                .done_at(CacheMark::JailStatus, epoch_id)
                .await
                .storage()?
                .is_none()
        {
            info!("Jail statuses of epoch {} never polled, fetching inline", epoch_id);
            match self.engine.refresh_jail_statuses(epoch_id, height, roster).await {
                Ok(fetched) => jail = fetched,
                Err(e) => warn!("Inline jail status fetch failed: {}", e),
            }
        }

        let mut health = storage.get_node_health().await.storage()?;
        if health.is_empty()
            && storage
                .last_done(CacheMark::NodeHealth)
                .await
                .storage()?
                .is_none()
        {
            info!("No cached node health, probing inline");
            match self.engine.refresh_node_health(roster).await {
                Ok(fetched) => health = fetched,
                Err(e) => warn!("Inline node health probe failed: {}", e),
            }
        }

        let jail: HashMap<&str, &JailStatus> =
            jail.iter().map(|j| (j.participant_id.as_str(), j)).collect();
        let health: HashMap<&str, &NodeHealth> =
            health.iter().map(|h| (h.participant_id.as_str(), h)).collect();

        Ok(snapshots
            .iter()
            .map(|snapshot| {
                let mut stats = ParticipantStats::from(snapshot);
                if let Some(status) = jail.get(snapshot.participant_id.as_str()) {
                    stats.apply_jail(status);
                }
                if let Some(probe) = health.get(snapshot.participant_id.as_str()) {
                    stats.apply_health(probe);
                }
                stats
            })
            .collect())
    }

    /// Resolve a past epoch at its canonical height, or at a requested height
    /// within the epoch (clamped to canonical).
    async fn historical(&self, epoch_id: u64, height: Option<u64>) -> ServiceResult<HistoricalRead> {
        let roster = self.engine.chain().epoch_roster(epoch_id).await.upstream()?;
        let finished = self
            .engine
            .storage()
            .is_epoch_finished(epoch_id)
            .await
            .storage()?;
        let canonical = self.engine.canonical_height(epoch_id).await?;

        let target = match height {
            None => canonical,
            Some(h) if h < roster.effective_block_height => {
                return Err(ServiceError::InvalidRequest(format!(
                    "Height {} is before epoch {} start (effective height {})",
                    h, epoch_id, roster.effective_block_height
                )));
            }
            Some(h) if h >= canonical => {
                debug!(
                    "Height {} is past epoch {} end, clamping to {}",
                    h, epoch_id, canonical
                );
                canonical
            }
            Some(h) => h,
        };

        let snapshots = self.engine.snapshots_at(epoch_id, target, &roster).await?;

        if height.is_none() && !finished {
            self.engine
                .storage()
                .mark_epoch_finished(epoch_id, target)
                .await
                .storage()?;
        }

        Ok(HistoricalRead { roster, snapshots })
    }

    /// Summary of the current epoch.
    pub async fn current_epoch_stats(&self, reload: bool) -> ServiceResult<EpochStats> {
        let index = self.current_index(reload).await?;
        let participants = self
            .merge_validator_data(
                index.epoch_id(),
                index.height(),
                &index.roster,
                &index.snapshots.snapshots,
            )
            .await?;

        if self
            .engine
            .maybe_warm(index.epoch_id(), index.roster.participant_ids())
            .is_some()
        {
            debug!("Proactive warm started for epoch {}", index.epoch_id());
        }

        Ok(EpochStats {
            epoch_id: index.epoch_id(),
            height: index.height(),
            participants,
            cached_at: Some(index.snapshots.cached_at.clone()),
            is_current: true,
            total_assigned_rewards_gnk: None,
        })
    }

    /// Summary of any epoch. The current epoch is height-agnostic; a past epoch
    /// is read at its canonical height unless a height inside it is requested.
    pub async fn epoch_stats(&self, epoch_id: u64, height: Option<u64>) -> ServiceResult<EpochStats> {
        let current = self.current_epoch_id().await?;
        if epoch_id > current {
            return Err(ServiceError::NotFound(format!(
                "Epoch {} has not started (current epoch is {})",
                epoch_id, current
            )));
        }
        if epoch_id == current {
            return self.current_epoch_stats(false).await;
        }

        let read = self.historical(epoch_id, height).await?;
        let participants = self
            .merge_validator_data(
                epoch_id,
                read.snapshots.height,
                &read.roster,
                &read.snapshots.snapshots,
            )
            .await?;
        self.engine.warm_epoch(epoch_id, read.roster.participant_ids());

        let total = match self.engine.reward_total(epoch_id).await {
            Ok(total) => total,
            Err(e) => {
                warn!("Reward total of epoch {} unavailable: {}", epoch_id, e);
                None
            }
        };

        Ok(EpochStats {
            epoch_id,
            height: read.snapshots.height,
            participants,
            cached_at: Some(read.snapshots.cached_at),
            is_current: false,
            total_assigned_rewards_gnk: total,
        })
    }

    /// Rewards of a participant over the detail window, newest first.
    ///
    /// Epochs without a cached reward are fetched inline; failures are skipped.
    async fn reward_history(
        &self,
        participant_id: &str,
        epoch_ids: &[u64],
    ) -> ServiceResult<Vec<RewardInfo>> {
        let mut records = self
            .engine
            .storage()
            .get_rewards_for_participant(participant_id, epoch_ids)
            .await
            .storage()?;

        let cached: BTreeSet<u64> = records.iter().map(|r| r.epoch_id).collect();
        for &epoch_id in epoch_ids.iter().filter(|e| !cached.contains(e)) {
            match self.engine.fetch_reward(epoch_id, participant_id, None).await {
                Ok(record) => records.push(record),
                Err(e) => debug!(
                    "Reward of {} in epoch {} unavailable: {}",
                    participant_id, epoch_id, e
                ),
            }
        }

        let mut rewards: Vec<RewardInfo> = records
            .iter()
            .map(|r| RewardInfo {
                epoch_id: r.epoch_id,
                assigned_reward_gnk: r.gnk(),
                claimed: r.claimed,
            })
            .collect();
        rewards.sort_by(|a, b| b.epoch_id.cmp(&a.epoch_id));
        Ok(rewards)
    }

    /// Cached auxiliary list, fetched inline on a miss.
    async fn auxiliary<T: DeserializeOwned>(
        &self,
        epoch_id: u64,
        participant_id: &str,
        kind: AuxiliaryKind,
    ) -> ServiceResult<(Vec<T>, AcquisitionStatus)> {
        let storage = self.engine.storage();
        if let Some(cached) = storage
            .get_auxiliary::<T>(epoch_id, participant_id, kind)
            .await
            .storage()?
        {
            return Ok((cached.value, AcquisitionStatus::Cached));
        }

        info!("Fetching {} inline for {}", kind, participant_id);
        match self
            .engine
            .ensure_auxiliary(epoch_id, participant_id, kind)
            .await
        {
            Ok(outcome) => {
                let stored = storage
                    .get_auxiliary::<T>(epoch_id, participant_id, kind)
                    .await
                    .storage()?;
                Ok(match stored {
                    Some(cached) if outcome == FetchOutcome::Fetched => {
                        (cached.value, AcquisitionStatus::Fetched)
                    }
                    Some(cached) => (cached.value, AcquisitionStatus::Cached),
                    None => (Vec::new(), AcquisitionStatus::Unavailable),
                })
            }
            Err(ServiceError::Storage(e)) => Err(ServiceError::Storage(e)),
            Err(e) => {
                warn!("Inline {} fetch for {} failed: {}", kind, participant_id, e);
                Ok((Vec::new(), AcquisitionStatus::Unavailable))
            }
        }
    }

    /// Snapshot, rewards, seed, warm keys and ML nodes of one participant.
    pub async fn participant_detail(
        &self,
        participant_id: &str,
        epoch_id: u64,
        height: Option<u64>,
    ) -> ServiceResult<ParticipantDetail> {
        let current = self.current_epoch_id().await?;
        if epoch_id > current {
            return Err(ServiceError::NotFound(format!(
                "Epoch {} has not started (current epoch is {})",
                epoch_id, current
            )));
        }

        let (snapshot, roster, read_height) = if epoch_id == current {
            let index = self.current_index(false).await?;
            let snapshot = index.snapshots.find(participant_id).cloned();
            (snapshot, index.roster.clone(), index.height())
        } else {
            let read = self.historical(epoch_id, height).await?;
            let snapshot = read.snapshots.find(participant_id).cloned();
            (snapshot, read.roster, read.snapshots.height)
        };
        let snapshot = snapshot.ok_or_else(|| {
            ServiceError::NotFound(format!(
                "Participant {} not found in epoch {}",
                participant_id, epoch_id
            ))
        })?;

        let participant = self
            .merge_validator_data(epoch_id, read_height, &roster, std::slice::from_ref(&snapshot))
            .await?
            .pop()
            .unwrap_or_else(|| ParticipantStats::from(&snapshot));

        let history = self.engine.settings().rewards.history_epochs;
        let epoch_ids: Vec<u64> = if epoch_id == current {
            (1..=history).filter(|i| *i < epoch_id).map(|i| epoch_id - i).collect()
        } else {
            (0..=history).filter(|i| *i < epoch_id).map(|i| epoch_id - i).collect()
        };
        let rewards = self.reward_history(participant_id, &epoch_ids).await?;

        let seed = snapshot.seed_signature.clone().map(|signature| SeedInfo {
            participant: participant_id.to_string(),
            epoch_index: epoch_id,
            signature,
        });

        let (warm_keys, warm_keys_status) = self
            .auxiliary::<WarmKey>(epoch_id, participant_id, AuxiliaryKind::WarmKeys)
            .await?;
        let (mut ml_nodes, ml_nodes_status) = self
            .auxiliary::<HardwareNode>(epoch_id, participant_id, AuxiliaryKind::HardwareNodes)
            .await?;

        let weights = snapshot.ml_node_weights();
        for node in &mut ml_nodes {
            if let Some(weight) = weights.get(&node.local_id) {
                node.poc_weight = Some(*weight);
            }
        }

        Ok(ParticipantDetail {
            participant,
            rewards,
            seed,
            warm_keys,
            warm_keys_status,
            ml_nodes,
            ml_nodes_status,
        })
    }

    /// Categorized inference lists; cache only.
    pub async fn participant_inferences(
        &self,
        participant_id: &str,
        epoch_id: u64,
    ) -> ServiceResult<ParticipantInferences> {
        let cached = self
            .engine
            .storage()
            .get_participant_inferences(epoch_id, participant_id)
            .await
            .storage()?;
        let lists = cached.inferences;

        Ok(ParticipantInferences {
            epoch_id,
            participant_id: participant_id.to_string(),
            successful: lists.get(InferenceCategory::Successful).to_vec(),
            expired: lists.get(InferenceCategory::Expired).to_vec(),
            invalidated: lists.get(InferenceCategory::Invalidated).to_vec(),
            cached_at: cached.cached_at,
        })
    }

    /// Reward total of a finished epoch, self-healing a cached zero.
    pub async fn epoch_reward_total(&self, epoch_id: u64) -> ServiceResult<EpochRewardTotal> {
        let current = self.current_epoch_id().await?;
        if epoch_id >= current {
            return Err(ServiceError::InvalidRequest(format!(
                "Epoch {} has not finished (current epoch is {})",
                epoch_id, current
            )));
        }

        let total = self.engine.reward_total(epoch_id).await?;
        Ok(EpochRewardTotal {
            epoch_id,
            total_assigned_rewards_gnk: total,
        })
    }

    /// Block timing over the last 10,000 blocks and chain milestones.
    pub async fn timeline(&self) -> ServiceResult<Timeline> {
        let chain = self.engine.chain();
        let height = chain.latest_height().await.upstream()?;
        let reference = height.saturating_sub(TIMELINE_REFERENCE_DISTANCE);

        let current_time = chain.block_time(height).await.upstream()?;
        let reference_time = chain.block_time(reference).await.upstream()?;
        let avg_block_time = average_block_time(&reference_time, &current_time, height - reference)?;

        let restriction_end = chain.restriction_end_block().await.upstream()?;
        let latest = chain.latest_epoch().await.upstream()?;

        Ok(Timeline {
            current_block: BlockInfo {
                height,
                timestamp: current_time,
            },
            reference_block: BlockInfo {
                height: reference,
                timestamp: reference_time,
            },
            avg_block_time,
            events: vec![TimelineEvent {
                block_height: restriction_end,
                description: TRANSFER_ENABLED_EVENT.to_string(),
                occurred: height >= restriction_end,
            }],
            current_epoch_start: latest.poc_start_height,
            current_epoch_index: latest.epoch_id,
            epoch_length: latest.epoch_length,
        })
    }

    /// Model distribution of the current or a past epoch, merged with the
    /// governance catalog and usage statistics.
    pub async fn models(&self, scope: ModelScope) -> ServiceResult<ModelsOverview> {
        let current = self.current_epoch_id().await?;

        let (epoch_id, height, aggregates, cached_at, is_current) = match scope {
            ModelScope::Epoch { epoch_id, .. } if epoch_id > current => {
                return Err(ServiceError::NotFound(format!(
                    "Epoch {} has not started (current epoch is {})",
                    epoch_id, current
                )));
            }
            ModelScope::Epoch { epoch_id, height } if epoch_id < current => {
                let read = self.historical(epoch_id, height).await?;
                let aggregates = self
                    .engine
                    .historical_model_aggregates(epoch_id, &read.snapshots)
                    .await?;
                (
                    epoch_id,
                    read.snapshots.height,
                    aggregates,
                    read.snapshots.cached_at,
                    false,
                )
            }
            _ => {
                let index = self.current_index(false).await?;
                let mut aggregates = self
                    .engine
                    .storage()
                    .get_model_aggregates(index.epoch_id())
                    .await
                    .storage()?;
                if aggregates.is_empty() {
                    aggregates = aggregate_models(index.epoch_id(), &index.snapshots.snapshots);
                }
                (
                    index.epoch_id(),
                    index.height(),
                    aggregates,
                    index.snapshots.cached_at.clone(),
                    true,
                )
            }
        };

        let chain = self.engine.chain();
        let catalog = chain.models_catalog().await.upstream()?;
        let stats = chain.model_usage_stats().await.upstream()?;

        Ok(ModelsOverview {
            epoch_id,
            height,
            models: merge_catalog(catalog, &aggregates),
            stats,
            cached_at,
            is_current,
        })
    }
}

/// Catalog entries with their aggregate; models without one weigh zero.
fn merge_catalog(catalog: Vec<CatalogModel>, aggregates: &[ModelAggregate]) -> Vec<ModelInfo> {
    let by_id: HashMap<&str, &ModelAggregate> =
        aggregates.iter().map(|a| (a.model_id.as_str(), a)).collect();

    catalog
        .into_iter()
        .map(|model| {
            let (total_weight, participant_count) = by_id
                .get(model.id.as_str())
                .map_or((0, 0), |a| (a.total_weight, a.participant_count));
            ModelInfo {
                model,
                total_weight,
                participant_count,
            }
        })
        .collect()
}

/// Seconds per block between two RFC 3339 block times, rounded to 2 decimals.
fn average_block_time(from: &str, to: &str, blocks: u64) -> ServiceResult<f64> {
    if blocks == 0 {
        return Ok(0.0);
    }
    let parse = |raw: &str| {
        DateTime::parse_from_rfc3339(raw).map_err(|e| {
            ServiceError::Upstream(anyhow::anyhow!("Invalid block time {:?}: {}", raw, e))
        })
    };
    let elapsed = parse(to)? - parse(from)?;
    let seconds = elapsed.num_milliseconds() as f64 / 1000.0;
    Ok((seconds / blocks as f64 * 100.0).round() / 100.0)
}

#[cfg(test)]
mod tests;
