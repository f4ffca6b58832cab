//! Sync engine: the only writer of the cache.
//!
//! The engine decides what to fetch and when. Three triggers feed the same
//! cache rows and all of them go through the cache-aware primitive in
//! [`batch`]:
//!
//! - scheduled pollers ([`poller`]), one per data kind
//! - proactive warm after a current-epoch read ([`SyncEngine::maybe_warm`])
//! - inline fallback from the read path ([`SyncEngine::ensure_auxiliary`])
//!
//! The current epoch is additionally held in memory as a [`CurrentEpoch`]
//! index, replaced on every refresh.

use anyhow::Context;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use inferwatch_core::{
    aggregate_models, pair_model_weights, settlement_height, ModelAggregate, ParticipantSnapshot,
};

use crate::client::{ChainApi, EpochRoster, HttpChainClient, ParticipantRecord};
use crate::config::{Config, PollKind, PollingConfig, RewardsConfig, Schedule};
use crate::error::{ResultExt, ServiceError, ServiceResult};
use crate::storage::{now_rfc3339, CacheMark, SnapshotSet, Storage};

pub mod auxiliary;
pub mod batch;
pub mod inferences;
pub mod poller;
pub mod rewards;
pub mod validators;
pub mod warm;

pub use batch::{cached_batch_fetch, ensure_cached, BatchReport, CachedFetch, FetchOutcome, SingleFlight};
pub use inferences::InferenceCycle;
pub use poller::spawn_pollers;
pub use rewards::RewardSweep;
pub use warm::{WarmPermit, WarmScheduler};

/// Engine settings resolved from the configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Per-kind schedules
    pub polling: PollingConfig,

    /// Reward windows
    pub rewards: RewardsConfig,

    /// Minimum time between warm runs
    pub warm_cooldown: Duration,
}

impl EngineSettings {
    /// Settings of a loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            polling: config.polling.clone(),
            rewards: config.rewards.clone(),
            warm_cooldown: Duration::from_secs(config.warm.cooldown_secs),
        }
    }

    /// Schedule of one kind.
    pub fn schedule(&self, kind: PollKind) -> Schedule {
        self.polling.schedule(kind)
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            polling: PollingConfig::default(),
            rewards: RewardsConfig::default(),
            warm_cooldown: Duration::from_secs(60),
        }
    }
}

/// In-memory index of the current epoch.
#[derive(Debug, Clone)]
pub struct CurrentEpoch {
    /// Roster of the epoch
    pub roster: EpochRoster,

    /// Snapshots taken at the refresh height
    pub snapshots: SnapshotSet,

    /// When the index was built
    pub refreshed_at: Instant,
}

impl CurrentEpoch {
    /// Epoch id.
    pub fn epoch_id(&self) -> u64 {
        self.snapshots.epoch_id
    }

    /// Height of the refresh.
    pub fn height(&self) -> u64 {
        self.snapshots.height
    }

    /// Age of the index.
    pub fn age(&self) -> Duration {
        self.refreshed_at.elapsed()
    }
}

/// Build participant snapshots from a roster and a height-pinned participant list.
///
/// Only roster members are kept. A participant whose record does not parse is
/// skipped with a warning.
pub fn build_snapshots(roster: &EpochRoster, participants: Vec<Value>) -> Vec<ParticipantSnapshot> {
    let mut snapshots = Vec::with_capacity(roster.participants.len());

    for raw in participants {
        let record: ParticipantRecord = match serde_json::from_value(raw) {
            Ok(record) => record,
            Err(e) => {
                warn!("Skipping malformed participant record: {}", e);
                continue;
            }
        };

        let Some(entry) = roster.find(&record.index) else {
            continue;
        };

        let groups = entry
            .ml_nodes
            .iter()
            .map(|group| group.ml_nodes.clone())
            .collect();
        let pairing = pair_model_weights(&entry.models, groups);
        if pairing.length_mismatch {
            warn!(
                "Participant {} declares {} models but {} node groups; unpaired entries ignored",
                entry.index,
                entry.models.len(),
                entry.ml_nodes.len()
            );
        }

        snapshots.push(ParticipantSnapshot {
            participant_id: record.index,
            address: record.address,
            weight: entry.weight,
            validator_key: entry.validator_key.clone(),
            inference_url: record.inference_url.or_else(|| entry.inference_url.clone()),
            status: record.status,
            models: entry.models.clone(),
            model_weights: pairing.model_weights,
            counters: record.current_epoch_stats,
            seed_signature: entry.seed.as_ref().and_then(|s| s.signature.clone()),
        });
    }

    snapshots
}

/// Synchronization engine over one store and one upstream.
pub struct SyncEngine {
    storage: Storage,
    chain: Arc<dyn ChainApi>,
    settings: EngineSettings,
    warm: Arc<WarmScheduler>,
    flights: SingleFlight,
    current: RwLock<Option<Arc<CurrentEpoch>>>,
}

impl SyncEngine {
    /// Create an engine.
    pub fn new(storage: Storage, chain: Arc<dyn ChainApi>, settings: EngineSettings) -> Self {
        let warm = Arc::new(WarmScheduler::new(settings.warm_cooldown));
        Self {
            storage,
            chain,
            settings,
            warm,
            flights: SingleFlight::new(),
            current: RwLock::new(None),
        }
    }

    /// Open the store, apply migrations and connect the upstream client.
    pub async fn connect(config: &Config) -> anyhow::Result<Self> {
        let storage = Storage::new(
            &config.database.url,
            Some(config.database.max_connections),
            Some(config.database.min_connections),
        )
        .await
        .context("Failed to connect to database")?;
        storage
            .run_migrations()
            .await
            .context("Failed to run migrations")?;

        let chain = HttpChainClient::new(&config.upstream).context("Failed to build upstream client")?;
        info!(
            "Upstream client ready ({} base URLs)",
            config.upstream.base_urls.len()
        );

        Ok(Self::new(
            storage,
            Arc::new(chain),
            EngineSettings::from_config(config),
        ))
    }

    /// Cache store.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Upstream API.
    pub fn chain(&self) -> &dyn ChainApi {
        self.chain.as_ref()
    }

    /// Settings.
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Warm scheduler state.
    pub fn warm_scheduler(&self) -> &Arc<WarmScheduler> {
        &self.warm
    }

    pub(crate) fn flights(&self) -> &SingleFlight {
        &self.flights
    }

    /// Current in-memory index, if any refresh has succeeded.
    pub async fn current_epoch(&self) -> Option<Arc<CurrentEpoch>> {
        self.current.read().await.clone()
    }

    /// Roster of the current epoch, straight from upstream.
    pub async fn current_roster(&self) -> ServiceResult<EpochRoster> {
        self.chain.current_epoch_roster().await.upstream()
    }

    /// Refresh the current epoch: snapshots, aggregates and the in-memory index.
    ///
    /// When the epoch id moved past the last indexed epoch, the previous epoch
    /// is finalized. Finalization failures are logged; the refresh still
    /// succeeds.
    pub async fn refresh_current_epoch(&self) -> ServiceResult<Arc<CurrentEpoch>> {
        let height = self.chain.latest_height().await.upstream()?;
        let roster = self.chain.current_epoch_roster().await.upstream()?;
        let epoch_id = roster.epoch_id;

        let previous = match self.current_epoch().await {
            Some(index) => Some(index.epoch_id()),
            None => self.storage.latest_cached_epoch().await.storage()?,
        };

        let participants = self.chain.participants(height).await.upstream()?;
        let snapshots = build_snapshots(&roster, participants);

        self.storage
            .save_snapshots(epoch_id, height, &snapshots)
            .await
            .storage()?;
        self.storage.save_roster(&roster).await.storage()?;
        let pruned = self
            .storage
            .prune_snapshots_below(epoch_id, height)
            .await
            .storage()?;
        if pruned > 0 {
            debug!("Pruned {} stale snapshot rows of epoch {}", pruned, epoch_id);
        }

        let aggregates = aggregate_models(epoch_id, &snapshots);
        self.storage
            .replace_model_aggregates(epoch_id, &aggregates)
            .await
            .storage()?;

        if let Some(previous) = previous.filter(|p| *p < epoch_id) {
            match self.storage.is_epoch_finished(previous).await {
                Ok(true) => {}
                Ok(false) => {
                    info!("Epoch transition detected: {} -> {}", previous, epoch_id);
                    if let Err(e) = self.finalize_epoch(previous).await {
                        error!("Failed to finalize epoch {}: {}", previous, e);
                    }
                }
                Err(e) => error!("Failed to check epoch {} status: {:#}", previous, e),
            }
        }

        let index = Arc::new(CurrentEpoch {
            roster,
            snapshots: SnapshotSet {
                epoch_id,
                height,
                cached_at: now_rfc3339(),
                snapshots,
            },
            refreshed_at: Instant::now(),
        });
        *self.current.write().await = Some(Arc::clone(&index));

        info!(
            "Refreshed current epoch {} at height {}: {} participants, {} models",
            epoch_id,
            height,
            index.snapshots.snapshots.len(),
            aggregates.len()
        );
        Ok(index)
    }

    /// Rebuild the in-memory index from the latest cached row set of the
    /// current epoch, whatever height it was taken at.
    ///
    /// Only the current epoch id is asked upstream; when that fails the newest
    /// cached epoch is assumed. Returns `None` when the epoch has no cached
    /// rows, and the existing index when a refresh got there first.
    pub async fn restore_current_epoch(&self) -> ServiceResult<Option<Arc<CurrentEpoch>>> {
        let epoch_id = match self.chain.latest_epoch().await {
            Ok(latest) => latest.epoch_id,
            Err(e) => match self.storage.latest_cached_epoch().await.storage()? {
                Some(epoch_id) => {
                    warn!(
                        "Latest epoch unavailable ({:#}), assuming cached epoch {}",
                        e, epoch_id
                    );
                    epoch_id
                }
                None => return Err(ServiceError::Upstream(e)),
            },
        };

        let Some(snapshots) = self
            .storage
            .get_latest_snapshots(epoch_id)
            .await
            .storage()?
        else {
            return Ok(None);
        };

        let roster = match self.storage.get_roster(epoch_id).await.storage()? {
            Some(roster) => roster,
            None => {
                let roster = self.chain.epoch_roster(epoch_id).await.upstream()?;
                self.storage.save_roster(&roster).await.storage()?;
                roster
            }
        };

        let mut current = self.current.write().await;
        if let Some(existing) = current.as_ref() {
            return Ok(Some(Arc::clone(existing)));
        }
        let index = Arc::new(CurrentEpoch {
            roster,
            snapshots,
            refreshed_at: Instant::now(),
        });
        *current = Some(Arc::clone(&index));

        info!(
            "Restored current epoch {} from cache at height {} ({} participants)",
            epoch_id,
            index.height(),
            index.snapshots.snapshots.len()
        );
        Ok(Some(index))
    }

    /// Canonical settlement height of a past epoch.
    ///
    /// The recorded finish height wins; otherwise it is derived from the next
    /// epoch's effective height, falling back to the latest epoch's next
    /// proof-of-compute start.
    pub async fn canonical_height(&self, epoch_id: u64) -> ServiceResult<u64> {
        if let Some(status) = self.storage.get_epoch_status(epoch_id).await.storage()? {
            return Ok(status.finished_height);
        }

        match self.chain.epoch_roster(epoch_id + 1).await {
            Ok(next) => Ok(settlement_height(next.effective_block_height)),
            Err(e) => {
                debug!(
                    "Next roster of epoch {} unavailable ({:#}), using latest epoch stages",
                    epoch_id, e
                );
                let latest = self.chain.latest_epoch().await.upstream()?;
                latest
                    .stages
                    .next_poc_start
                    .map(settlement_height)
                    .ok_or_else(|| {
                        ServiceError::Upstream(anyhow::anyhow!(
                            "No settlement height known for epoch {}",
                            epoch_id
                        ))
                    })
            }
        }
    }

    /// Snapshots of an epoch at exactly `height`: cached rows, or fetched and stored.
    pub async fn snapshots_at(
        &self,
        epoch_id: u64,
        height: u64,
        roster: &EpochRoster,
    ) -> ServiceResult<SnapshotSet> {
        if let Some(set) = self
            .storage
            .get_snapshots_at(epoch_id, height)
            .await
            .storage()?
        {
            debug!("Snapshots of epoch {} at height {} served from cache", epoch_id, height);
            return Ok(set);
        }

        info!("Fetching snapshots of epoch {} at height {}", epoch_id, height);
        let participants = self.chain.participants(height).await.upstream()?;
        let snapshots = build_snapshots(roster, participants);
        self.storage
            .save_snapshots(epoch_id, height, &snapshots)
            .await
            .storage()?;

        Ok(SnapshotSet {
            epoch_id,
            height,
            cached_at: now_rfc3339(),
            snapshots,
        })
    }

    /// Model aggregates of a past epoch; computed once from its snapshots.
    ///
    /// An epoch without any model is marked so the empty set is not recomputed.
    pub async fn historical_model_aggregates(
        &self,
        epoch_id: u64,
        snapshots: &SnapshotSet,
    ) -> ServiceResult<Vec<ModelAggregate>> {
        let cached = self
            .storage
            .get_model_aggregates(epoch_id)
            .await
            .storage()?;
        if !cached.is_empty()
            || self
                .storage
                .done_at(CacheMark::ModelAggregates, epoch_id)
                .await
                .storage()?
                .is_some()
        {
            return Ok(cached);
        }

        let aggregates = aggregate_models(epoch_id, &snapshots.snapshots);
        self.storage
            .insert_model_aggregates_if_absent(epoch_id, &aggregates)
            .await
            .storage()?;
        self.storage
            .mark_done(CacheMark::ModelAggregates, epoch_id)
            .await
            .storage()?;
        self.storage
            .get_model_aggregates(epoch_id)
            .await
            .storage()
    }

    /// Take the final snapshot of an epoch, mark it finished and compute its
    /// reward total. Returns the settlement height.
    pub async fn finalize_epoch(&self, epoch_id: u64) -> ServiceResult<u64> {
        let height = self.canonical_height(epoch_id).await?;
        let roster = self.chain.epoch_roster(epoch_id).await.upstream()?;

        let snapshots = self.snapshots_at(epoch_id, height, &roster).await?;
        self.historical_model_aggregates(epoch_id, &snapshots).await?;
        self.storage
            .mark_epoch_finished(epoch_id, height)
            .await
            .storage()?;

        match self.compute_reward_total(epoch_id).await {
            Ok(Some(total)) => info!("Epoch {} finalized: {} GNK rewarded", epoch_id, total),
            Ok(None) => warn!("Epoch {} finalized; reward total not yet settled", epoch_id),
            Err(e) => warn!("Epoch {} finalized; reward total failed: {}", epoch_id, e),
        }

        Ok(height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::setup_storage;
    use crate::testing::{participant_json, roster_entry, MockChain};

    pub(crate) async fn engine_with(chain: Arc<MockChain>) -> (Arc<SyncEngine>, tempfile::NamedTempFile) {
        engine_with_settings(chain, EngineSettings::default()).await
    }

    pub(crate) async fn engine_with_settings(
        chain: Arc<MockChain>,
        settings: EngineSettings,
    ) -> (Arc<SyncEngine>, tempfile::NamedTempFile) {
        let (storage, temp_db) = setup_storage().await;
        let engine = SyncEngine::new(storage, chain, settings);
        (Arc::new(engine), temp_db)
    }

    #[test]
    fn test_build_snapshots_filters_to_roster() {
        let roster = EpochRoster {
            epoch_id: 65,
            effective_block_height: 1_000_000,
            poc_start_block_height: None,
            participants: vec![roster_entry("p1", 100, &["m1", "m2"])],
        };
        let mut bad = participant_json("p3");
        bad["current_epoch_stats"] = Value::Null;

        let snapshots = build_snapshots(
            &roster,
            vec![participant_json("p1"), participant_json("p2"), bad],
        );

        assert_eq!(snapshots.len(), 1);
        let p1 = &snapshots[0];
        assert_eq!(p1.weight, 100);
        assert_eq!(p1.models, vec!["m1".to_string(), "m2".to_string()]);
        assert_eq!(p1.model_weights.len(), 2);
        assert_eq!(p1.seed_signature.as_deref(), Some("seed-p1"));
    }

    #[tokio::test]
    async fn test_refresh_builds_index_and_aggregates() {
        let chain = Arc::new(MockChain::with_current_epoch(65, 1_000_000, 1_000, &["p1", "p2"]));
        chain.set_height(1_025_320);
        let (engine, _temp_db) = engine_with(chain.clone()).await;

        let index = engine.refresh_current_epoch().await.unwrap();
        assert_eq!(index.epoch_id(), 65);
        assert_eq!(index.height(), 1_025_320);
        assert_eq!(index.snapshots.snapshots.len(), 2);

        let cached = engine.storage().get_latest_snapshots(65).await.unwrap().unwrap();
        assert_eq!(cached.height, 1_025_320);

        let aggregates = engine.storage().get_model_aggregates(65).await.unwrap();
        assert_eq!(aggregates.len(), 1);
        assert_eq!(aggregates[0].participant_count, 2);

        // A later refresh replaces the row set in place.
        chain.set_height(1_025_327);
        engine.refresh_current_epoch().await.unwrap();
        let latest = engine.storage().get_latest_snapshots(65).await.unwrap().unwrap();
        assert_eq!(latest.height, 1_025_327);
        assert!(engine
            .storage()
            .get_snapshots_at(65, 1_025_320)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_restore_serves_latest_cached_rows() {
        let chain = Arc::new(MockChain::with_current_epoch(65, 1_000_000, 1_000, &["p1", "p2"]));
        chain.set_height(1_025_320);
        let (engine, temp_db) = engine_with(chain.clone()).await;
        assert!(engine.restore_current_epoch().await.unwrap().is_none());
        engine.refresh_current_epoch().await.unwrap();

        // A new process on the same store, with the chain moved on.
        let storage = Storage::new_with_path(temp_db.path(), None, None).await.unwrap();
        let restarted = SyncEngine::new(storage, chain.clone(), EngineSettings::default());
        chain.set_height(1_025_327);
        chain.fail("participants");
        chain.reset_calls();

        let index = restarted.restore_current_epoch().await.unwrap().unwrap();
        assert_eq!(index.epoch_id(), 65);
        assert_eq!(index.height(), 1_025_320);
        assert_eq!(index.roster.participants.len(), 2);
        assert_eq!(chain.calls("participants"), 0);
        assert_eq!(chain.calls("epoch_roster"), 0);
        assert!(restarted.current_epoch().await.is_some());

        // With upstream down entirely, the newest cached epoch is assumed.
        let storage = Storage::new_with_path(temp_db.path(), None, None).await.unwrap();
        let offline = SyncEngine::new(storage, chain.clone(), EngineSettings::default());
        chain.fail("latest_epoch");
        let index = offline.restore_current_epoch().await.unwrap().unwrap();
        assert_eq!(index.epoch_id(), 65);
    }

    #[tokio::test]
    async fn test_epoch_transition_finalizes_previous_epoch() {
        let chain = Arc::new(MockChain::with_current_epoch(64, 990_000, 10_000, &["p1", "p2"]));
        chain.set_reward("p1", 64, "3000000000000", false);
        chain.set_reward("p2", 64, "1000000000000", false);
        let (engine, _temp_db) = engine_with(chain.clone()).await;
        engine.refresh_current_epoch().await.unwrap();

        chain.advance_epoch(65, 1_000_000, &["p1", "p2"]);
        engine.refresh_current_epoch().await.unwrap();

        let status = engine.storage().get_epoch_status(64).await.unwrap().unwrap();
        assert_eq!(status.finished_height, 999_990);
        assert!(engine
            .storage()
            .get_snapshots_at(64, 999_990)
            .await
            .unwrap()
            .is_some());
        assert_eq!(engine.storage().get_epoch_reward_total(64).await.unwrap(), Some(4000));
    }

    #[tokio::test]
    async fn test_canonical_height_fallback_to_latest_stages() {
        let chain = Arc::new(MockChain::with_current_epoch(65, 1_000_000, 1_000, &["p1"]));
        chain.set_next_poc_start(1_001_000);
        let (engine, _temp_db) = engine_with(chain.clone()).await;

        // No roster for 66 exists upstream yet.
        assert_eq!(engine.canonical_height(65).await.unwrap(), 1_000_990);

        chain.add_roster(64, 990_000, &["p1"]);
        assert_eq!(engine.canonical_height(64).await.unwrap(), 999_990);

        // A recorded finish height wins over upstream.
        engine.storage().mark_epoch_finished(64, 999_000).await.unwrap();
        assert_eq!(engine.canonical_height(64).await.unwrap(), 999_000);
    }

    #[tokio::test]
    async fn test_empty_historical_aggregates_computed_once() {
        let chain = Arc::new(MockChain::with_current_epoch(65, 1_000_000, 1_000, &["p1"]));
        let (engine, _temp_db) = engine_with(chain.clone()).await;
        let empty = SnapshotSet {
            epoch_id: 64,
            height: 999_990,
            cached_at: now_rfc3339(),
            snapshots: Vec::new(),
        };

        assert!(engine.historical_model_aggregates(64, &empty).await.unwrap().is_empty());
        assert!(engine
            .storage()
            .done_at(CacheMark::ModelAggregates, 64)
            .await
            .unwrap()
            .is_some());

        // Snapshots arriving later do not change a computed historical epoch.
        let late = SnapshotSet {
            snapshots: vec![build_snapshots(
                &chain.roster(65).unwrap(),
                vec![participant_json("p1")],
            )
            .remove(0)],
            ..empty
        };
        assert!(engine.historical_model_aggregates(64, &late).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_snapshots_at_is_cache_first() {
        let chain = Arc::new(MockChain::with_current_epoch(65, 1_000_000, 1_000, &["p1"]));
        chain.add_roster(58, 900_000, &["p1"]);
        let (engine, _temp_db) = engine_with(chain.clone()).await;
        let roster = chain.roster(58).unwrap();

        engine.snapshots_at(58, 909_990, &roster).await.unwrap();
        engine.snapshots_at(58, 909_990, &roster).await.unwrap();
        assert_eq!(chain.calls("participants"), 1);

        // A different height is a miss for a historical epoch.
        engine.snapshots_at(58, 909_000, &roster).await.unwrap();
        assert_eq!(chain.calls("participants"), 2);
    }
}
