//! Participant rewards and self-healing epoch reward totals.

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use std::fmt;
use tracing::{debug, info, warn};

use inferwatch_core::{ugnk_to_gnk, RewardRecord};

use super::batch::{cached_batch_fetch, BatchReport, CachedFetch, SingleFlight};
use super::SyncEngine;
use crate::config::PollKind;
use crate::error::{ResultExt, ServiceError, ServiceResult};

/// Key of one participant reward row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RewardKey {
    /// Epoch
    pub epoch_id: u64,
    /// Participant address
    pub participant_id: String,
}

impl fmt::Display for RewardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.participant_id, self.epoch_id)
    }
}

/// Reward rows. Scheduled polls only count a claimed row as cached so the
/// claim flag keeps updating; read-triggered warms accept any row.
struct RewardSource<'a> {
    engine: &'a SyncEngine,
    claimed_only: bool,
}

#[async_trait]
impl CachedFetch for RewardSource<'_> {
    type Key = RewardKey;

    async fn is_cached(&self, key: &RewardKey) -> Result<bool> {
        let cached = self
            .engine
            .storage()
            .get_reward(key.epoch_id, &key.participant_id)
            .await?;
        Ok(cached.is_some_and(|r| r.claimed || !self.claimed_only))
    }

    async fn fetch_and_store(&self, key: &RewardKey) -> Result<()> {
        let summary = self
            .engine
            .chain()
            .performance_summary(key.epoch_id, &key.participant_id, None)
            .await?;
        let record = RewardRecord {
            epoch_id: key.epoch_id,
            participant_id: key.participant_id.clone(),
            rewarded_coins: summary.rewarded_coins,
            claimed: summary.claimed,
        };
        self.engine.storage().save_rewards(&[record]).await
    }

    fn single_flight(&self) -> Option<&SingleFlight> {
        Some(self.engine.flights())
    }

    fn flight_key(&self, key: &RewardKey) -> String {
        format!("reward:{}", key)
    }
}

/// Outcome of one reward total sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewardSweep {
    /// Epochs whose cached total was plausible
    pub valid: usize,
    /// Epochs (re)computed to a cached total
    pub computed: usize,
    /// Epochs still without a settled total
    pub pending: usize,
}

impl SyncEngine {
    /// Scheduled cycle: rewards of every roster participant over the lookback window.
    pub async fn poll_rewards(&self) -> ServiceResult<BatchReport> {
        let roster = self.current_roster().await?;
        let current = roster.epoch_id;
        let lookback = self.settings().rewards.lookback_epochs;

        let keys: Vec<RewardKey> = (1..=lookback)
            .filter(|offset| *offset < current)
            .flat_map(|offset| {
                roster.participants.iter().map(move |p| RewardKey {
                    epoch_id: current - offset,
                    participant_id: p.index.clone(),
                })
            })
            .collect();

        let batch_size = self.settings().schedule(PollKind::Rewards).batch_size;
        let source = RewardSource {
            engine: self,
            claimed_only: true,
        };
        let report = cached_batch_fetch(&source, &keys, batch_size)
            .await
            .map_err(ServiceError::classify)?;

        info!(
            "Rewards cycle complete: {} fetched, {} cached",
            report.fetched, report.cached
        );
        Ok(report)
    }

    /// Rewards of the given participants in one epoch, fetched where no row is cached.
    pub async fn warm_rewards(
        &self,
        epoch_id: u64,
        participant_ids: &[String],
    ) -> ServiceResult<BatchReport> {
        let keys: Vec<RewardKey> = participant_ids
            .iter()
            .map(|participant_id| RewardKey {
                epoch_id,
                participant_id: participant_id.clone(),
            })
            .collect();
        let source = RewardSource {
            engine: self,
            claimed_only: false,
        };
        let batch_size = self.settings().schedule(PollKind::Rewards).batch_size;
        cached_batch_fetch(&source, &keys, batch_size)
            .await
            .map_err(ServiceError::classify)
    }

    /// Fetch and store one participant reward.
    pub async fn fetch_reward(
        &self,
        epoch_id: u64,
        participant_id: &str,
        height: Option<u64>,
    ) -> ServiceResult<RewardRecord> {
        let summary = self
            .chain()
            .performance_summary(epoch_id, participant_id, height)
            .await
            .upstream()?;
        let record = RewardRecord {
            epoch_id,
            participant_id: participant_id.to_string(),
            rewarded_coins: summary.rewarded_coins,
            claimed: summary.claimed,
        };
        self.storage()
            .save_rewards(std::slice::from_ref(&record))
            .await
            .storage()?;
        Ok(record)
    }

    /// Performance summaries of the given participants read at `height`
    /// (latest when `None`). Failed reads are logged and left out.
    async fn read_summaries(
        &self,
        epoch_id: u64,
        participant_ids: &[String],
        height: Option<u64>,
    ) -> Vec<RewardRecord> {
        let batch_size = self.settings().schedule(PollKind::RewardTotals).batch_size.max(1);
        let mut records = Vec::with_capacity(participant_ids.len());

        for batch in participant_ids.chunks(batch_size) {
            let results = join_all(batch.iter().map(|pid| async move {
                (
                    pid,
                    self.chain().performance_summary(epoch_id, pid, height).await,
                )
            }))
            .await;

            for (pid, result) in results {
                match result {
                    Ok(summary) => records.push(RewardRecord {
                        epoch_id,
                        participant_id: pid.clone(),
                        rewarded_coins: summary.rewarded_coins,
                        claimed: summary.claimed,
                    }),
                    Err(e) => warn!("Reward of {} in epoch {} failed: {:#}", pid, epoch_id, e),
                }
            }
        }

        records
    }

    /// Compute an epoch's reward total from upstream and cache it when plausible.
    ///
    /// Summaries are read at the settlement height first; a zero sum there is
    /// re-read at the latest height, since settlement may land later.
    /// Returns `Some(0)` (cached) for an epoch without participants and `None`
    /// (not cached) when participants exist but every reward reads zero.
    pub async fn compute_reward_total(&self, epoch_id: u64) -> ServiceResult<Option<u64>> {
        let roster = self.chain().epoch_roster(epoch_id).await.upstream()?;
        if roster.participants.is_empty() {
            self.storage()
                .save_epoch_reward_total(epoch_id, 0)
                .await
                .storage()?;
            return Ok(Some(0));
        }

        let height = match self.canonical_height(epoch_id).await {
            Ok(height) => Some(height),
            Err(e) => {
                debug!("Summaries of epoch {} read at latest height: {}", epoch_id, e);
                None
            }
        };

        let ids = roster.participant_ids();
        let ugnk = |records: &[RewardRecord]| -> u128 { records.iter().map(RewardRecord::ugnk).sum() };

        let mut records = self.read_summaries(epoch_id, &ids, height).await;
        if let Some(height) = height {
            if !records.is_empty() && ugnk(&records) == 0 {
                info!(
                    "Epoch {} rewards read zero at height {}, retrying at latest height",
                    epoch_id, height
                );
                let latest = self.read_summaries(epoch_id, &ids, None).await;
                if !latest.is_empty() {
                    records = latest;
                }
            }
        }

        if records.is_empty() {
            return Err(ServiceError::Upstream(anyhow::anyhow!(
                "No performance summaries retrieved for epoch {}",
                epoch_id
            )));
        }

        self.storage().save_rewards(&records).await.storage()?;

        let total = ugnk_to_gnk(ugnk(&records));
        if total == 0 {
            warn!(
                "Epoch {} rewards read zero for {} participants; not caching",
                epoch_id,
                records.len()
            );
            return Ok(None);
        }

        self.storage()
            .save_epoch_reward_total(epoch_id, total)
            .await
            .storage()?;
        Ok(Some(total))
    }

    /// Cached reward total of an epoch; a cached zero is deleted and recomputed.
    pub async fn reward_total(&self, epoch_id: u64) -> ServiceResult<Option<u64>> {
        match self
            .storage()
            .get_epoch_reward_total(epoch_id)
            .await
            .storage()?
        {
            Some(0) => {
                info!("Epoch {} has a zero reward total; recomputing", epoch_id);
                self.storage()
                    .delete_epoch_reward_total(epoch_id)
                    .await
                    .storage()?;
                self.compute_reward_total(epoch_id).await
            }
            Some(total) => Ok(Some(total)),
            None => self.compute_reward_total(epoch_id).await,
        }
    }

    /// Re-check the reward totals of the most recent finished epochs.
    pub async fn sweep_reward_totals(&self) -> ServiceResult<RewardSweep> {
        let current = match self.current_epoch().await {
            Some(index) => index.epoch_id(),
            None => self.current_roster().await?.epoch_id,
        };

        let mut sweep = RewardSweep::default();
        for offset in 1..=self.settings().rewards.sweep_epochs {
            if offset >= current {
                break;
            }
            let epoch_id = current - offset;

            let cached = self
                .storage()
                .get_epoch_reward_total(epoch_id)
                .await
                .storage()?;
            if cached.is_some_and(|total| total > 0) {
                sweep.valid += 1;
                continue;
            }

            match self.reward_total(epoch_id).await {
                Ok(Some(_)) => sweep.computed += 1,
                Ok(None) => sweep.pending += 1,
                Err(e) => {
                    warn!("Reward total of epoch {} failed: {}", epoch_id, e);
                    sweep.pending += 1;
                }
            }
        }

        info!(
            "Reward total sweep complete: {} valid, {} computed, {} pending",
            sweep.valid, sweep.computed, sweep.pending
        );
        Ok(sweep)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::engine_with;
    use crate::testing::MockChain;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_zero_total_self_heals() {
        let chain = Arc::new(MockChain::with_current_epoch(65, 1_000_000, 10_000, &["p1", "p2"]));
        chain.add_roster(64, 990_000, &["p1", "p2"]);
        chain.set_reward("p1", 64, "2500000000000", true);
        chain.set_reward("p2", 64, "1500000000000", false);
        let (engine, _temp_db) = engine_with(chain.clone()).await;

        engine.storage().save_epoch_reward_total(64, 0).await.unwrap();

        assert_eq!(engine.reward_total(64).await.unwrap(), Some(4000));
        assert_eq!(engine.storage().get_epoch_reward_total(64).await.unwrap(), Some(4000));

        // A plausible total is served without upstream calls.
        chain.reset_calls();
        assert_eq!(engine.reward_total(64).await.unwrap(), Some(4000));
        assert_eq!(chain.calls("performance_summary"), 0);
    }

    #[tokio::test]
    async fn test_ambiguous_zero_not_cached() {
        let chain = Arc::new(MockChain::with_current_epoch(65, 1_000_000, 10_000, &["p1", "p2"]));
        chain.add_roster(64, 990_000, &["p1", "p2"]);
        let (engine, _temp_db) = engine_with(chain.clone()).await;

        assert_eq!(engine.reward_total(64).await.unwrap(), None);
        assert_eq!(engine.storage().get_epoch_reward_total(64).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_zero_at_canonical_height_retries_latest() {
        let chain = Arc::new(MockChain::with_current_epoch(65, 1_000_000, 10_000, &["p1"]));
        chain.add_roster(64, 990_000, &["p1"]);
        chain.set_reward("p1", 64, "2000000000000", false);
        // Canonical height of epoch 64 is 999_990; the latest height is 1_000_100.
        chain.set_rewards_settled_at(64, 1_000_050);
        let (engine, _temp_db) = engine_with(chain.clone()).await;
        chain.reset_calls();

        assert_eq!(engine.compute_reward_total(64).await.unwrap(), Some(2000));
        assert_eq!(chain.calls("performance_summary"), 2);
        assert_eq!(engine.storage().get_epoch_reward_total(64).await.unwrap(), Some(2000));
    }

    #[tokio::test]
    async fn test_empty_epoch_total_is_cached_zero() {
        let chain = Arc::new(MockChain::with_current_epoch(65, 1_000_000, 10_000, &["p1"]));
        chain.add_roster(64, 990_000, &[]);
        let (engine, _temp_db) = engine_with(chain.clone()).await;

        assert_eq!(engine.reward_total(64).await.unwrap(), Some(0));
        assert_eq!(engine.storage().get_epoch_reward_total(64).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_all_summaries_failing_is_upstream_error() {
        let chain = Arc::new(MockChain::with_current_epoch(65, 1_000_000, 10_000, &["p1"]));
        chain.add_roster(64, 990_000, &["p1"]);
        chain.fail("performance_summary");
        let (engine, _temp_db) = engine_with(chain.clone()).await;

        let err = engine.compute_reward_total(64).await.unwrap_err();
        assert!(matches!(err, crate::error::ServiceError::Upstream(_)));
    }

    #[tokio::test]
    async fn test_poll_rewards_skips_claimed() {
        let chain = Arc::new(MockChain::with_current_epoch(4, 40_000, 10_000, &["p1", "p2"]));
        chain.set_reward("p1", 3, "1000000000", true);
        let (engine, _temp_db) = engine_with(chain.clone()).await;

        // Epochs 3, 2, 1 for two participants.
        let first = engine.poll_rewards().await.unwrap();
        assert_eq!(first.fetched, 6);

        let second = engine.poll_rewards().await.unwrap();
        assert_eq!(second.cached, 1);
        assert_eq!(second.fetched, 5);
    }

    #[tokio::test]
    async fn test_sweep_counts_epochs() {
        let chain = Arc::new(MockChain::with_current_epoch(3, 30_000, 10_000, &["p1"]));
        chain.add_roster(2, 20_000, &["p1"]);
        chain.add_roster(1, 10_000, &["p1"]);
        chain.set_reward("p1", 2, "7000000000", true);
        let (engine, _temp_db) = engine_with(chain.clone()).await;
        engine.storage().save_epoch_reward_total(1, 0).await.unwrap();

        let sweep = engine.sweep_reward_totals().await.unwrap();
        assert_eq!(sweep.computed, 1);
        assert_eq!(sweep.pending, 1);
        assert_eq!(engine.storage().get_epoch_reward_total(2).await.unwrap(), Some(7));

        let again = engine.sweep_reward_totals().await.unwrap();
        assert_eq!(again.valid, 1);
    }
}
