//! Per-participant auxiliary records: warm keys and hardware nodes.
//!
//! All three triggers (scheduled poll, proactive warm, inline fallback) go
//! through [`AuxiliarySource`] and therefore share one cache-check rule and
//! one per-key lock.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use inferwatch_core::derive_warm_keys;

use super::batch::{cached_batch_fetch, ensure_cached, BatchReport, CachedFetch, FetchOutcome, SingleFlight};
use super::SyncEngine;
use crate::client::collect_grants;
use crate::config::PollKind;
use crate::error::{ServiceError, ServiceResult};
use crate::storage::AuxiliaryKind;

/// Poll kind (and so the schedule) of an auxiliary kind.
pub fn poll_kind(kind: AuxiliaryKind) -> PollKind {
    match kind {
        AuxiliaryKind::WarmKeys => PollKind::WarmKeys,
        AuxiliaryKind::HardwareNodes => PollKind::HardwareNodes,
    }
}

/// Auxiliary rows of one kind in one epoch, keyed by participant id.
pub struct AuxiliarySource<'a> {
    engine: &'a SyncEngine,
    epoch_id: u64,
    kind: AuxiliaryKind,
}

impl<'a> AuxiliarySource<'a> {
    /// Source over `kind` rows of `epoch_id`.
    pub fn new(engine: &'a SyncEngine, epoch_id: u64, kind: AuxiliaryKind) -> Self {
        Self {
            engine,
            epoch_id,
            kind,
        }
    }
}

#[async_trait]
impl CachedFetch for AuxiliarySource<'_> {
    type Key = String;

    async fn is_cached(&self, participant_id: &String) -> Result<bool> {
        self.engine
            .storage()
            .has_auxiliary(self.epoch_id, participant_id, self.kind)
            .await
    }

    async fn fetch_and_store(&self, participant_id: &String) -> Result<()> {
        let storage = self.engine.storage();
        let chain = self.engine.chain();

        match self.kind {
            AuxiliaryKind::WarmKeys => {
                let grants = collect_grants(chain, participant_id).await?;
                let keys = derive_warm_keys(&grants);
                debug!(
                    "{}: {} grants, {} warm keys",
                    participant_id,
                    grants.len(),
                    keys.len()
                );
                storage
                    .save_auxiliary(self.epoch_id, participant_id, self.kind, &keys)
                    .await
            }
            AuxiliaryKind::HardwareNodes => {
                let nodes = chain.hardware_nodes(participant_id).await?;
                storage
                    .save_auxiliary(self.epoch_id, participant_id, self.kind, &nodes)
                    .await
            }
        }
    }

    fn single_flight(&self) -> Option<&SingleFlight> {
        Some(self.engine.flights())
    }

    fn flight_key(&self, participant_id: &String) -> String {
        format!("aux:{}:{}:{}", self.kind, self.epoch_id, participant_id)
    }
}

impl SyncEngine {
    /// Batched, cache-aware fetch of one auxiliary kind for the given participants.
    pub async fn warm_auxiliary(
        &self,
        epoch_id: u64,
        kind: AuxiliaryKind,
        participant_ids: &[String],
    ) -> ServiceResult<BatchReport> {
        let schedule = self.settings().schedule(poll_kind(kind));
        let source = AuxiliarySource::new(self, epoch_id, kind);
        cached_batch_fetch(&source, participant_ids, schedule.batch_size)
            .await
            .map_err(ServiceError::classify)
    }

    /// Scheduled cycle of one auxiliary kind over the current roster.
    pub async fn poll_auxiliary(&self, kind: AuxiliaryKind) -> ServiceResult<BatchReport> {
        let roster = self.current_roster().await?;
        let ids = roster.participant_ids();

        let report = self.warm_auxiliary(roster.epoch_id, kind, &ids).await?;
        info!(
            "{} cycle complete: {} fetched, {} cached",
            kind.label(),
            report.fetched,
            report.cached
        );
        if report.failed > 0 {
            warn!("{} cycle: {} participants failed", kind.label(), report.failed);
        }
        Ok(report)
    }

    /// Inline fallback for one participant: fetch and store on a cache miss.
    pub async fn ensure_auxiliary(
        &self,
        epoch_id: u64,
        participant_id: &str,
        kind: AuxiliaryKind,
    ) -> ServiceResult<FetchOutcome> {
        let source = AuxiliarySource::new(self, epoch_id, kind);
        ensure_cached(&source, &participant_id.to_string())
            .await
            .map_err(ServiceError::classify)
    }

    /// Proactive warm after a current-epoch read.
    ///
    /// Returns the spawned task, or `None` when a run is in flight or the
    /// cooldown has not elapsed. The permit is held for the whole run.
    pub fn maybe_warm(self: &Arc<Self>, epoch_id: u64, participant_ids: Vec<String>) -> Option<JoinHandle<()>> {
        let permit = self.warm_scheduler().try_begin()?;
        let engine = Arc::clone(self);

        Some(tokio::spawn(async move {
            let _permit = permit;
            debug!(
                "Warm run started for epoch {} ({} participants)",
                epoch_id,
                participant_ids.len()
            );
            for kind in AuxiliaryKind::ALL {
                match engine.warm_auxiliary(epoch_id, kind, &participant_ids).await {
                    Ok(report) => info!(
                        "{} warm complete: {} fetched, {} cached",
                        kind.label(),
                        report.fetched,
                        report.cached
                    ),
                    Err(e) => warn!("{} warm failed: {}", kind.label(), e),
                }
            }
        }))
    }

    /// Background fill after a historical-epoch read: rewards, warm keys and
    /// hardware nodes of every participant of that epoch, cache first.
    ///
    /// Unlike [`SyncEngine::maybe_warm`] this is not rate limited; once the
    /// epoch is filled a run only checks the cache.
    pub fn warm_epoch(self: &Arc<Self>, epoch_id: u64, participant_ids: Vec<String>) -> JoinHandle<()> {
        let engine = Arc::clone(self);

        tokio::spawn(async move {
            debug!(
                "Epoch {} cache fill started ({} participants)",
                epoch_id,
                participant_ids.len()
            );
            match engine.warm_rewards(epoch_id, &participant_ids).await {
                Ok(report) => info!(
                    "Epoch {} rewards fill complete: {} fetched, {} cached",
                    epoch_id, report.fetched, report.cached
                ),
                Err(e) => warn!("Epoch {} rewards fill failed: {}", epoch_id, e),
            }
            for kind in AuxiliaryKind::ALL {
                match engine.warm_auxiliary(epoch_id, kind, &participant_ids).await {
                    Ok(report) => info!(
                        "Epoch {} {} fill complete: {} fetched, {} cached",
                        epoch_id,
                        kind,
                        report.fetched,
                        report.cached
                    ),
                    Err(e) => warn!("Epoch {} {} fill failed: {}", epoch_id, kind, e),
                }
            }
        })
    }
}
