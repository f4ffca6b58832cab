//! Scheduled pollers, one long-lived task per data kind.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::SyncEngine;
use crate::config::PollKind;
use crate::error::ServiceResult;
use crate::storage::AuxiliaryKind;

/// Run one cycle of a kind.
pub async fn run_cycle(engine: &SyncEngine, kind: PollKind) -> ServiceResult<()> {
    match kind {
        PollKind::CurrentEpoch => engine.refresh_current_epoch().await.map(|_| ()),
        PollKind::JailStatus => engine.poll_jail_status().await.map(|_| ()),
        PollKind::NodeHealth => engine.poll_node_health().await.map(|_| ()),
        PollKind::Rewards => engine.poll_rewards().await.map(|_| ()),
        PollKind::WarmKeys => engine.poll_auxiliary(AuxiliaryKind::WarmKeys).await.map(|_| ()),
        PollKind::HardwareNodes => engine
            .poll_auxiliary(AuxiliaryKind::HardwareNodes)
            .await
            .map(|_| ()),
        PollKind::RewardTotals => engine.sweep_reward_totals().await.map(|_| ()),
        PollKind::Inferences => engine.poll_inferences().await.map(|_| ()),
    }
}

/// Poll one kind until cancelled.
///
/// The first cycle runs after the startup delay, then once per interval.
/// A failed cycle is logged and retried on the next tick.
pub async fn run_poller(engine: Arc<SyncEngine>, kind: PollKind, token: CancellationToken) {
    let schedule = engine.settings().schedule(kind);
    info!(
        "{} poller starting: interval {:?}, batch size {}, delay {:?}",
        kind, schedule.interval, schedule.batch_size, schedule.startup_delay
    );

    tokio::select! {
        _ = token.cancelled() => return,
        _ = tokio::time::sleep(schedule.startup_delay) => {}
    }

    if let Err(e) = run_cycle(&engine, kind).await {
        warn!("Initial {} cycle failed: {}", kind, e);
    }

    let mut interval = tokio::time::interval(schedule.interval);
    interval.tick().await; // First tick completes immediately, skip it

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = run_cycle(&engine, kind).await {
                    warn!("{} cycle failed: {}", kind, e);
                }
            }
        }
    }

    debug!("{} poller stopped", kind);
}

/// Spawn a poller for every kind.
pub fn spawn_pollers(engine: Arc<SyncEngine>, token: CancellationToken) -> Vec<JoinHandle<()>> {
    PollKind::ALL
        .into_iter()
        .map(|kind| tokio::spawn(run_poller(Arc::clone(&engine), kind, token.clone())))
        .collect()
}
