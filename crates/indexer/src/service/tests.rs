use super::*;
use crate::storage::test_support::setup_storage;
use crate::storage::Storage;
use crate::sync::EngineSettings;
use crate::testing::{warm_grants, MockChain, DEFAULT_MODEL};

async fn service_with(chain: Arc<MockChain>) -> (ReadService, tempfile::NamedTempFile) {
    let (storage, temp_db) = setup_storage().await;
    let engine = Arc::new(SyncEngine::new(storage, chain, EngineSettings::default()));
    (ReadService::new(engine, Duration::from_secs(30)), temp_db)
}

/// Current epoch 65 at 1_000_000 with a settled epoch 64 at 990_000.
fn two_epoch_chain() -> Arc<MockChain> {
    let chain = Arc::new(MockChain::with_current_epoch(65, 1_000_000, 1_000, &["p1", "p2"]));
    chain.add_roster(64, 990_000, &["p1", "p2"]);
    chain.set_reward("p1", 64, "3000000000000", false);
    chain.set_reward("p2", 64, "1000000000000", true);
    chain
}

fn hardware_node(local_id: &str) -> HardwareNode {
    HardwareNode {
        local_id: local_id.to_string(),
        status: "INFERENCE".to_string(),
        models: vec![DEFAULT_MODEL.to_string()],
        hardware: vec![],
        host: "10.0.0.1".to_string(),
        port: "8080".to_string(),
        poc_weight: None,
    }
}

#[tokio::test]
async fn test_current_epoch_stats_merges_validator_data() {
    let chain = two_epoch_chain();
    chain.set_unhealthy("http://p2.node:8080", "HTTP 503");
    let (service, _temp_db) = service_with(chain.clone()).await;

    let stats = service.current_epoch_stats(false).await.unwrap();
    assert_eq!(stats.epoch_id, 65);
    assert_eq!(stats.height, 1_000_100);
    assert!(stats.is_current);
    assert!(stats.cached_at.is_some());
    assert_eq!(stats.total_assigned_rewards_gnk, None);
    assert_eq!(stats.participants.len(), 2);

    let p2 = stats.participants.iter().find(|p| p.index == "p2").unwrap();
    assert_eq!(p2.node_healthy, Some(false));
    // No staked validators upstream, so jail fields stay unset.
    assert_eq!(p2.is_jailed, None);

    // The read triggered a warm run, which blocks another until the cooldown.
    assert!(service.engine().warm_scheduler().try_begin().is_none());
}

#[tokio::test]
async fn test_current_index_reused_while_fresh() {
    let chain = two_epoch_chain();
    let (service, _temp_db) = service_with(chain.clone()).await;

    service.current_epoch_stats(false).await.unwrap();
    service.current_epoch_stats(false).await.unwrap();
    assert_eq!(chain.calls("current_epoch_roster"), 1);

    service.current_epoch_stats(true).await.unwrap();
    assert_eq!(chain.calls("current_epoch_roster"), 2);
}

#[tokio::test]
async fn test_failed_reload_serves_stale_index() {
    let chain = two_epoch_chain();
    let (service, _temp_db) = service_with(chain.clone()).await;
    service.current_epoch_stats(false).await.unwrap();

    chain.fail("latest_height");
    let stats = service.current_epoch_stats(true).await.unwrap();
    assert_eq!(stats.epoch_id, 65);
    assert_eq!(stats.height, 1_000_100);
}

#[tokio::test]
async fn test_no_index_and_upstream_down_is_upstream_error() {
    let chain = two_epoch_chain();
    chain.fail("latest_height");
    let (service, _temp_db) = service_with(chain).await;

    let err = service.current_epoch_stats(false).await.unwrap_err();
    assert!(matches!(err, ServiceError::Upstream(_)));
}

#[tokio::test]
async fn test_restart_serves_cached_current_epoch() {
    let chain = two_epoch_chain();
    chain.set_height(1_025_320);
    let (service, temp_db) = service_with(chain.clone()).await;
    service.current_epoch_stats(false).await.unwrap();

    // A new process on the same store; the chain moved on and the
    // participant list is unreachable.
    let storage = Storage::new_with_path(temp_db.path(), None, None).await.unwrap();
    let engine = Arc::new(SyncEngine::new(storage, chain.clone(), EngineSettings::default()));
    let restarted = ReadService::new(engine, Duration::from_secs(30));
    chain.set_height(1_025_327);
    chain.fail("participants");

    let stats = restarted.current_epoch_stats(false).await.unwrap();
    assert_eq!(stats.epoch_id, 65);
    assert_eq!(stats.height, 1_025_320);
    assert_eq!(stats.participants.len(), 2);

    let detail = restarted.participant_detail("p1", 65, None).await.unwrap();
    assert_eq!(detail.participant.index, "p1");
    assert_eq!(chain.calls("participants"), 1);
}

#[tokio::test]
async fn test_polled_empty_jail_status_not_refetched() {
    let chain = two_epoch_chain();
    let (service, _temp_db) = service_with(chain.clone()).await;

    service.epoch_stats(64, None).await.unwrap();
    assert_eq!(chain.calls("validators_page"), 1);
    let health_calls = chain.calls("node_health");

    service.epoch_stats(64, None).await.unwrap();
    service.epoch_stats(64, None).await.unwrap();
    assert_eq!(chain.calls("validators_page"), 1);
    assert_eq!(chain.calls("node_health"), health_calls);
}

#[tokio::test]
async fn test_past_epoch_read_fills_participant_caches() {
    let chain = two_epoch_chain();
    chain.set_grants("p1", warm_grants("warm1"));
    let (service, _temp_db) = service_with(chain.clone()).await;

    service.epoch_stats(64, None).await.unwrap();

    let storage = service.engine().storage();
    let mut filled = false;
    for _ in 0..100 {
        let mut all = true;
        for pid in ["p1", "p2"] {
            for kind in AuxiliaryKind::ALL {
                all &= storage.has_auxiliary(64, pid, kind).await.unwrap();
            }
            all &= storage.get_reward(64, pid).await.unwrap().is_some();
        }
        if all {
            filled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(filled);

    let warm = storage
        .get_auxiliary::<WarmKey>(64, "p1", AuxiliaryKind::WarmKeys)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(warm.value[0].grantee_address, "warm1");
}

#[tokio::test]
async fn test_future_epoch_is_not_found() {
    let (service, _temp_db) = service_with(two_epoch_chain()).await;
    let err = service.epoch_stats(66, None).await.unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
}

#[tokio::test]
async fn test_current_epoch_via_epoch_stats_ignores_height() {
    let (service, _temp_db) = service_with(two_epoch_chain()).await;
    let stats = service.epoch_stats(65, Some(1_000_050)).await.unwrap();
    assert!(stats.is_current);
    assert_eq!(stats.height, 1_000_100);
}

#[tokio::test]
async fn test_past_epoch_at_canonical_height() {
    let chain = two_epoch_chain();
    let (service, _temp_db) = service_with(chain.clone()).await;

    let stats = service.epoch_stats(64, None).await.unwrap();
    assert!(!stats.is_current);
    assert_eq!(stats.height, 999_990);
    assert_eq!(stats.participants.len(), 2);
    assert_eq!(stats.total_assigned_rewards_gnk, Some(4000));

    let storage = service.engine().storage();
    let status = storage.get_epoch_status(64).await.unwrap().unwrap();
    assert_eq!(status.finished_height, 999_990);

    // Served from cache the second time.
    let before = chain.calls("participants");
    service.epoch_stats(64, None).await.unwrap();
    assert_eq!(chain.calls("participants"), before);
}

#[tokio::test]
async fn test_past_epoch_height_resolution() {
    let chain = two_epoch_chain();
    let (service, _temp_db) = service_with(chain).await;

    let err = service.epoch_stats(64, Some(989_999)).await.unwrap_err();
    assert!(matches!(err, ServiceError::InvalidRequest(_)));

    let mid = service.epoch_stats(64, Some(995_000)).await.unwrap();
    assert_eq!(mid.height, 995_000);
    // A height-specific read does not finalize the epoch.
    assert!(!service
        .engine()
        .storage()
        .is_epoch_finished(64)
        .await
        .unwrap());

    let clamped = service.epoch_stats(64, Some(1_000_500)).await.unwrap();
    assert_eq!(clamped.height, 999_990);
}

#[tokio::test]
async fn test_participant_detail_current_epoch() {
    let chain = two_epoch_chain();
    chain.set_grants("p1", warm_grants("warm1"));
    chain.set_hardware("p1", vec![hardware_node("p1-node0"), hardware_node("spare")]);
    let (service, _temp_db) = service_with(chain.clone()).await;

    let detail = service.participant_detail("p1", 65, None).await.unwrap();
    assert_eq!(detail.participant.index, "p1");

    // Epochs 64 down to 60, newest first.
    assert_eq!(detail.rewards.len(), 5);
    assert_eq!(
        detail.rewards[0],
        RewardInfo {
            epoch_id: 64,
            assigned_reward_gnk: 3000,
            claimed: false
        }
    );
    assert!(detail.rewards.windows(2).all(|w| w[0].epoch_id > w[1].epoch_id));

    let seed = detail.seed.unwrap();
    assert_eq!(seed.signature, "seed-p1");
    assert_eq!(seed.epoch_index, 65);

    assert_eq!(detail.warm_keys_status, AcquisitionStatus::Fetched);
    assert_eq!(detail.warm_keys.len(), 1);
    assert_eq!(detail.warm_keys[0].grantee_address, "warm1");

    assert_eq!(detail.ml_nodes_status, AcquisitionStatus::Fetched);
    assert_eq!(detail.ml_nodes[0].poc_weight, Some(100));
    assert_eq!(detail.ml_nodes[1].poc_weight, None);

    // Everything is cached now.
    let summaries = chain.calls("performance_summary");
    let again = service.participant_detail("p1", 65, None).await.unwrap();
    assert_eq!(again.warm_keys_status, AcquisitionStatus::Cached);
    assert_eq!(again.ml_nodes_status, AcquisitionStatus::Cached);
    assert_eq!(chain.calls("performance_summary"), summaries);
}

#[tokio::test]
async fn test_participant_detail_failed_fetch_is_unavailable() {
    let chain = two_epoch_chain();
    chain.fail_key("hardware_nodes", "p2");
    let (service, _temp_db) = service_with(chain).await;

    let detail = service.participant_detail("p2", 65, None).await.unwrap();
    assert_eq!(detail.ml_nodes_status, AcquisitionStatus::Unavailable);
    assert!(detail.ml_nodes.is_empty());
    assert_eq!(detail.warm_keys_status, AcquisitionStatus::Fetched);
}

#[tokio::test]
async fn test_participant_detail_past_epoch_window() {
    let (service, _temp_db) = service_with(two_epoch_chain()).await;

    let detail = service.participant_detail("p2", 64, None).await.unwrap();
    // Epochs 64 down to 59.
    assert_eq!(detail.rewards.len(), 6);
    assert_eq!(detail.rewards[0].epoch_id, 64);
    assert_eq!(detail.rewards[0].assigned_reward_gnk, 1000);
    assert!(detail.rewards[0].claimed);
}

#[tokio::test]
async fn test_participant_detail_unknown_participant() {
    let (service, _temp_db) = service_with(two_epoch_chain()).await;
    let err = service.participant_detail("ghost", 65, None).await.unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
}

#[tokio::test]
async fn test_participant_inferences_unpolled() {
    let (service, _temp_db) = service_with(two_epoch_chain()).await;
    let lists = service.participant_inferences("p1", 65).await.unwrap();
    assert!(lists.successful.is_empty());
    assert!(lists.expired.is_empty());
    assert!(lists.invalidated.is_empty());
    assert_eq!(lists.cached_at, None);
}

#[tokio::test]
async fn test_epoch_reward_total() {
    let (service, _temp_db) = service_with(two_epoch_chain()).await;

    let err = service.epoch_reward_total(65).await.unwrap_err();
    assert!(matches!(err, ServiceError::InvalidRequest(_)));

    let total = service.epoch_reward_total(64).await.unwrap();
    assert_eq!(total.total_assigned_rewards_gnk, Some(4000));
}

#[tokio::test]
async fn test_timeline() {
    let (service, _temp_db) = service_with(two_epoch_chain()).await;

    let timeline = service.timeline().await.unwrap();
    assert_eq!(timeline.current_block.height, 1_000_100);
    assert_eq!(timeline.reference_block.height, 990_100);
    assert_eq!(timeline.avg_block_time, 6.0);
    assert_eq!(timeline.events.len(), 1);
    assert_eq!(timeline.events[0].description, TRANSFER_ENABLED_EVENT);
    assert_eq!(timeline.events[0].block_height, 1_500_000);
    assert!(!timeline.events[0].occurred);
    assert_eq!(timeline.current_epoch_index, 65);
    assert_eq!(timeline.current_epoch_start, 1_000_000);
    assert_eq!(timeline.epoch_length, 1_000);
}

#[test]
fn test_average_block_time_rounding() {
    let avg = average_block_time("2026-01-01T00:00:00Z", "2026-01-01T00:00:10Z", 3).unwrap();
    assert_eq!(avg, 3.33);
    assert_eq!(average_block_time("x", "y", 0).unwrap(), 0.0);
    assert!(average_block_time("x", "y", 1).is_err());
}

#[tokio::test]
async fn test_models_merge_catalog() {
    let chain = two_epoch_chain();
    chain.set_catalog(vec![
        CatalogModel {
            id: DEFAULT_MODEL.to_string(),
            ..Default::default()
        },
        CatalogModel {
            id: "Qwen/QwQ-32B".to_string(),
            ..Default::default()
        },
    ]);
    let (service, _temp_db) = service_with(chain).await;

    let current = service.models(ModelScope::Current).await.unwrap();
    assert!(current.is_current);
    assert_eq!(current.epoch_id, 65);
    assert_eq!(current.models.len(), 2);
    assert_eq!(current.models[0].total_weight, 200);
    assert_eq!(current.models[0].participant_count, 2);
    assert_eq!(current.models[1].total_weight, 0);
    assert_eq!(current.models[1].participant_count, 0);

    let past = service
        .models(ModelScope::Epoch {
            epoch_id: 64,
            height: None,
        })
        .await
        .unwrap();
    assert!(!past.is_current);
    assert_eq!(past.height, 999_990);
    assert_eq!(past.models[0].participant_count, 2);

    let err = service
        .models(ModelScope::Epoch {
            epoch_id: 70,
            height: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
}
