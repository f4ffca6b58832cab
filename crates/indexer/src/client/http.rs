//! `reqwest` implementation of [`ChainApi`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use inferwatch_core::de::{string_from_value, u64_from_value};
use inferwatch_core::{Epoch, Grant, HardwareNode};

use super::types::{LatestEpochResponse, RosterResponse};
use super::{
    CatalogModel, ChainApi, EpochRoster, HealthProbe, InferencePage, KeybaseProfile, ModelUsage,
    PerformanceSummary, SigningInfo, Validator, ValidatorPage, AUTHZ_PAGE_SIZE,
};
use crate::config::UpstreamConfig;

/// Header pinning a chain-api query to a block height.
const HEIGHT_HEADER: &str = "X-Cosmos-Block-Height";

const PARTICIPANT_PAGE_LIMIT: &str = "10000";
const VALIDATOR_PAGE_LIMIT: &str = "200";

/// HTTP client for the chain's public query API.
///
/// Requests go to the current base URL; a failure rotates to the next one and
/// retries until every URL has been tried once.
pub struct HttpChainClient {
    client: Client,
    base_urls: Vec<String>,
    current: AtomicUsize,
    request_timeout: Duration,
    bulk_timeout: Duration,
    health_timeout: Duration,
    keybase_url: String,
    inference_page_size: u32,
}

impl HttpChainClient {
    /// Build a client from the upstream configuration.
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        if config.base_urls.is_empty() {
            anyhow::bail!("At least one upstream base URL is required");
        }

        let client = Client::builder()
            .user_agent("inferwatch-indexer")
            .build()
            .context("Failed to build upstream HTTP client")?;

        Ok(Self {
            client,
            base_urls: config
                .base_urls
                .iter()
                .map(|u| u.trim_end_matches('/').to_string())
                .collect(),
            current: AtomicUsize::new(0),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            bulk_timeout: Duration::from_secs(config.bulk_timeout_secs),
            health_timeout: Duration::from_secs(config.health_timeout_secs),
            keybase_url: config.keybase_url.trim_end_matches('/').to_string(),
            inference_page_size: config.inference_page_size,
        })
    }

    fn rotate(&self, from: usize) {
        let next = (from + 1) % self.base_urls.len();
        // Only the first task to observe the failure moves the cursor.
        if self
            .current
            .compare_exchange(from, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            info!("Rotated upstream to {}", self.base_urls[next]);
        }
    }

    /// GET a path against the base URLs in rotation.
    async fn get_json(
        &self,
        path: &str,
        query: &[(&str, String)],
        height: Option<u64>,
        timeout: Duration,
    ) -> Result<Value> {
        let mut last_error = None;

        for _ in 0..self.base_urls.len() {
            let index = self.current.load(Ordering::Acquire) % self.base_urls.len();
            let url = format!("{}{}", self.base_urls[index], path);

            let mut request = self.client.get(&url).query(query).timeout(timeout);
            if let Some(height) = height {
                request = request.header(HEIGHT_HEADER, height.to_string());
            }

            debug!("GET {} (height {:?})", url, height);
            let outcome = async {
                let response = request.send().await?.error_for_status()?;
                response.json::<Value>().await
            }
            .await;

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("Request to {} failed: {}", url, e);
                    last_error = Some(e);
                    self.rotate(index);
                }
            }
        }

        match last_error {
            Some(e) => Err(anyhow::Error::new(e)
                .context(format!("All upstream URLs failed for {}", path))),
            None => anyhow::bail!("No upstream URLs configured"),
        }
    }

    async fn get_typed<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        height: Option<u64>,
        timeout: Duration,
    ) -> Result<T> {
        let value = self.get_json(path, query, height, timeout).await?;
        serde_json::from_value(value).with_context(|| format!("Malformed response from {}", path))
    }
}

/// Array at a JSON pointer; absent means empty.
fn array_at(value: &Value, pointer: &str) -> Vec<Value> {
    value
        .pointer(pointer)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn typed_array_at<T: DeserializeOwned>(value: &Value, pointer: &str) -> Result<Vec<T>> {
    array_at(value, pointer)
        .into_iter()
        .map(|item| serde_json::from_value(item).context("Malformed array entry"))
        .collect()
}

fn next_key(value: &Value) -> Option<String> {
    value
        .pointer("/pagination/next_key")
        .and_then(Value::as_str)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
}

fn parse_latest_height(value: &Value) -> Result<u64> {
    value
        .pointer("/result/sync_info/latest_block_height")
        .and_then(u64_from_value)
        .context("Status response lacks result.sync_info.latest_block_height")
}

fn parse_latest_epoch(value: Value) -> Result<Epoch> {
    let raw: LatestEpochResponse =
        serde_json::from_value(value).context("Malformed latest epoch response")?;
    Ok(Epoch {
        epoch_id: raw.latest_epoch.index,
        poc_start_height: raw.latest_epoch.poc_start_block_height,
        epoch_length: raw.epoch_params.epoch_length,
        stages: raw.epoch_stages,
    })
}

fn parse_keybase(value: &Value, keybase_url: &str) -> Option<KeybaseProfile> {
    let code = value.pointer("/status/code").and_then(Value::as_i64);
    if code != Some(0) {
        return None;
    }
    let username = value
        .pointer("/them/0/basics/username")
        .and_then(Value::as_str)
        .filter(|u| !u.is_empty())?;
    Some(KeybaseProfile {
        username: username.to_string(),
        picture_url: format!("{}/{}/picture?size=96", keybase_url, username),
    })
}

#[async_trait]
impl ChainApi for HttpChainClient {
    async fn latest_height(&self) -> Result<u64> {
        let value = self
            .get_json("/chain-rpc/status", &[], None, self.request_timeout)
            .await?;
        parse_latest_height(&value)
    }

    async fn latest_epoch(&self) -> Result<Epoch> {
        let value = self
            .get_json("/v1/epochs/latest", &[], None, self.request_timeout)
            .await?;
        parse_latest_epoch(value)
    }

    async fn current_epoch_roster(&self) -> Result<EpochRoster> {
        let raw: RosterResponse = self
            .get_typed("/v1/epochs/current/participants", &[], None, self.bulk_timeout)
            .await?;
        Ok(raw.active_participants)
    }

    async fn epoch_roster(&self, epoch_id: u64) -> Result<EpochRoster> {
        let path = format!("/v1/epochs/{}/participants", epoch_id);
        let raw: RosterResponse = self.get_typed(&path, &[], None, self.bulk_timeout).await?;
        Ok(raw.active_participants)
    }

    async fn participants(&self, height: u64) -> Result<Vec<Value>> {
        let value = self
            .get_json(
                "/chain-api/productscience/inference/inference/participant",
                &[("pagination.limit", PARTICIPANT_PAGE_LIMIT.to_string())],
                Some(height),
                self.bulk_timeout,
            )
            .await?;
        Ok(array_at(&value, "/participant"))
    }

    async fn inference_page(&self, cursor: Option<&str>) -> Result<InferencePage> {
        let mut query = vec![("pagination.limit", self.inference_page_size.to_string())];
        if let Some(cursor) = cursor {
            query.push(("pagination.key", cursor.to_string()));
        }
        let value = self
            .get_json(
                "/chain-api/productscience/inference/inference/inference",
                &query,
                None,
                self.bulk_timeout,
            )
            .await?;
        Ok(InferencePage {
            records: array_at(&value, "/inference"),
            next_key: next_key(&value),
        })
    }

    async fn validators_page(&self, height: u64, cursor: Option<&str>) -> Result<ValidatorPage> {
        let mut query = vec![("pagination.limit", VALIDATOR_PAGE_LIMIT.to_string())];
        if let Some(cursor) = cursor {
            query.push(("pagination.key", cursor.to_string()));
        }
        let value = self
            .get_json(
                "/chain-api/cosmos/staking/v1beta1/validators",
                &query,
                Some(height),
                self.bulk_timeout,
            )
            .await?;
        Ok(ValidatorPage {
            validators: typed_array_at::<Validator>(&value, "/validators")?,
            next_key: next_key(&value),
        })
    }

    async fn signing_info(&self, valcons: &str, height: u64) -> Result<Option<SigningInfo>> {
        let path = format!("/chain-api/cosmos/slashing/v1beta1/signing_infos/{}", valcons);
        let value = self
            .get_json(&path, &[], Some(height), self.request_timeout)
            .await?;
        match value.get("val_signing_info") {
            Some(info) if !info.is_null() => Ok(Some(
                serde_json::from_value(info.clone()).context("Malformed signing info")?,
            )),
            _ => Ok(None),
        }
    }

    async fn performance_summary(
        &self,
        epoch_id: u64,
        participant_id: &str,
        height: Option<u64>,
    ) -> Result<PerformanceSummary> {
        let path = format!(
            "/chain-api/productscience/inference/inference/epoch_performance_summary/{}/{}",
            epoch_id, participant_id
        );
        let value = self
            .get_json(&path, &[], height, self.request_timeout)
            .await?;
        match value.get("epochPerformanceSummary") {
            Some(summary) if !summary.is_null() => serde_json::from_value(summary.clone())
                .context("Malformed performance summary"),
            _ => Ok(PerformanceSummary::default()),
        }
    }

    async fn authz_grants_page(&self, granter: &str, offset: usize) -> Result<Vec<Grant>> {
        let path = format!("/chain-api/cosmos/authz/v1beta1/grants/granter/{}", granter);
        let value = self
            .get_json(
                &path,
                &[
                    ("pagination.limit", AUTHZ_PAGE_SIZE.to_string()),
                    ("pagination.offset", offset.to_string()),
                ],
                None,
                self.request_timeout,
            )
            .await?;
        typed_array_at(&value, "/grants")
    }

    async fn hardware_nodes(&self, participant_id: &str) -> Result<Vec<HardwareNode>> {
        let path = format!(
            "/chain-api/productscience/inference/inference/hardware_nodes/{}",
            participant_id
        );
        let value = self
            .get_json(&path, &[], None, self.request_timeout)
            .await?;
        typed_array_at(&value, "/nodes/hardware_nodes")
    }

    async fn block_time(&self, height: u64) -> Result<String> {
        let value = self
            .get_json(
                "/chain-rpc/block",
                &[("height", height.to_string())],
                None,
                self.request_timeout,
            )
            .await?;
        value
            .pointer("/result/block/header/time")
            .and_then(string_from_value)
            .with_context(|| format!("Block {} response lacks header time", height))
    }

    async fn restriction_end_block(&self) -> Result<u64> {
        let value = self
            .get_json(
                "/chain-api/productscience/inference/restrictions/params",
                &[],
                None,
                self.request_timeout,
            )
            .await?;
        value
            .pointer("/params/restriction_end_block")
            .and_then(u64_from_value)
            .context("Restrictions response lacks params.restriction_end_block")
    }

    async fn models_catalog(&self) -> Result<Vec<CatalogModel>> {
        let value = self
            .get_json(
                "/chain-api/productscience/inference/inference/models_all",
                &[],
                None,
                self.request_timeout,
            )
            .await?;
        typed_array_at(&value, "/model")
    }

    async fn model_usage_stats(&self) -> Result<Vec<ModelUsage>> {
        let value = self
            .get_json(
                "/chain-api/productscience/inference/inference/models_stats_by_time",
                &[],
                None,
                self.request_timeout,
            )
            .await?;
        typed_array_at(&value, "/stats_models")
    }

    async fn keybase_lookup(&self, identity: &str) -> Result<Option<KeybaseProfile>> {
        let url = format!("{}/_/api/1.0/user/lookup.json", self.keybase_url);
        let value: Value = self
            .client
            .get(&url)
            .query(&[("key_suffix", identity)])
            .timeout(self.request_timeout)
            .send()
            .await
            .context("Keybase lookup failed")?
            .error_for_status()
            .context("Keybase lookup failed")?
            .json()
            .await
            .context("Malformed keybase response")?;
        Ok(parse_keybase(&value, &self.keybase_url))
    }

    async fn node_health(&self, inference_url: &str) -> HealthProbe {
        if inference_url.trim().is_empty() {
            return HealthProbe::no_url();
        }

        let url = format!("{}/health", inference_url.trim_end_matches('/'));
        let started = Instant::now();
        match self
            .client
            .get(&url)
            .timeout(self.health_timeout)
            .send()
            .await
        {
            Ok(response) => {
                let elapsed = started.elapsed().as_millis() as u64;
                let status = response.status();
                if status == reqwest::StatusCode::OK {
                    HealthProbe {
                        is_healthy: true,
                        error_message: None,
                        response_time_ms: Some(elapsed),
                    }
                } else {
                    HealthProbe {
                        is_healthy: false,
                        error_message: Some(format!("HTTP {}", status.as_u16())),
                        response_time_ms: Some(elapsed),
                    }
                }
            }
            Err(e) => HealthProbe {
                is_healthy: false,
                error_message: Some(e.to_string()),
                response_time_ms: None,
            },
        }
    }
}
