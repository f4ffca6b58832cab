//! Upstream chain API client.
//!
//! [`ChainApi`] is the seam between the sync engine and the network. The
//! production implementation is [`HttpChainClient`]; tests use an in-process
//! mock.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;

use inferwatch_core::{Epoch, Grant, HardwareNode};

pub mod http;
pub mod types;

pub use http::HttpChainClient;
pub use types::*;

/// Grants requested per authz page.
pub const AUTHZ_PAGE_SIZE: usize = 100;

/// Queries the cache needs from the chain.
///
/// Every method is one upstream round trip (one page for paginated
/// collections).
#[async_trait]
pub trait ChainApi: Send + Sync {
    /// Latest block height.
    async fn latest_height(&self) -> Result<u64>;

    /// Latest epoch metadata and stage heights.
    async fn latest_epoch(&self) -> Result<Epoch>;

    /// Roster of the current epoch.
    async fn current_epoch_roster(&self) -> Result<EpochRoster>;

    /// Roster of a given epoch.
    async fn epoch_roster(&self, epoch_id: u64) -> Result<EpochRoster>;

    /// Participant list pinned at a height, as raw objects.
    async fn participants(&self, height: u64) -> Result<Vec<Value>>;

    /// One page of the inference collection.
    async fn inference_page(&self, cursor: Option<&str>) -> Result<InferencePage>;

    /// One page of staking validators pinned at a height.
    async fn validators_page(&self, height: u64, cursor: Option<&str>) -> Result<ValidatorPage>;

    /// Slashing signing info of a consensus address.
    async fn signing_info(&self, valcons: &str, height: u64) -> Result<Option<SigningInfo>>;

    /// Performance summary of a participant in an epoch.
    async fn performance_summary(
        &self,
        epoch_id: u64,
        participant_id: &str,
        height: Option<u64>,
    ) -> Result<PerformanceSummary>;

    /// One page (at most [`AUTHZ_PAGE_SIZE`] grants) of grants issued by a participant.
    async fn authz_grants_page(&self, granter: &str, offset: usize) -> Result<Vec<Grant>>;

    /// Hardware node reports of a participant.
    async fn hardware_nodes(&self, participant_id: &str) -> Result<Vec<HardwareNode>>;

    /// Header time of a block (RFC 3339).
    async fn block_time(&self, height: u64) -> Result<String>;

    /// Height at which transfer restrictions end.
    async fn restriction_end_block(&self) -> Result<u64>;

    /// Governance-registered models.
    async fn models_catalog(&self) -> Result<Vec<CatalogModel>>;

    /// Usage statistics per model.
    async fn model_usage_stats(&self) -> Result<Vec<ModelUsage>>;

    /// Keybase profile of an identity, `None` when unknown.
    async fn keybase_lookup(&self, identity: &str) -> Result<Option<KeybaseProfile>>;

    /// Probe an inference endpoint. Never fails; failures are in the probe.
    async fn node_health(&self, inference_url: &str) -> HealthProbe;
}

/// Follow inference cursors to exhaustion.
///
/// A cursor seen twice aborts the walk instead of looping forever.
pub async fn collect_inferences(api: &dyn ChainApi) -> Result<(Vec<Value>, usize)> {
    let mut records = Vec::new();
    let mut seen = HashSet::new();
    let mut cursor: Option<String> = None;
    let mut pages = 0;

    loop {
        let page = api.inference_page(cursor.as_deref()).await?;
        pages += 1;
        records.extend(page.records);

        match page.next_key.filter(|k| !k.is_empty()) {
            Some(next) => {
                if !seen.insert(next.clone()) {
                    anyhow::bail!("Inference pagination repeated cursor after {} pages", pages);
                }
                cursor = Some(next);
            }
            None => break,
        }
    }

    debug!("Fetched {} inference records in {} pages", records.len(), pages);
    Ok((records, pages))
}

/// All validators at a height.
pub async fn collect_validators(api: &dyn ChainApi, height: u64) -> Result<Vec<Validator>> {
    let mut validators = Vec::new();
    let mut seen = HashSet::new();
    let mut cursor: Option<String> = None;

    loop {
        let page = api.validators_page(height, cursor.as_deref()).await?;
        validators.extend(page.validators);

        match page.next_key.filter(|k| !k.is_empty()) {
            Some(next) => {
                if !seen.insert(next.clone()) {
                    anyhow::bail!("Validator pagination repeated cursor");
                }
                cursor = Some(next);
            }
            None => break,
        }
    }

    debug!("Fetched {} validators at height {}", validators.len(), height);
    Ok(validators)
}

/// All grants issued by a participant; stops at the first short page.
pub async fn collect_grants(api: &dyn ChainApi, granter: &str) -> Result<Vec<Grant>> {
    let mut grants = Vec::new();
    let mut offset = 0;

    loop {
        let page = api.authz_grants_page(granter, offset).await?;
        let len = page.len();
        grants.extend(page);
        if len < AUTHZ_PAGE_SIZE {
            break;
        }
        offset += AUTHZ_PAGE_SIZE;
    }

    Ok(grants)
}
