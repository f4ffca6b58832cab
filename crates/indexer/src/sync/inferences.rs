//! Bulk inference retrieval, epoch repair and categorized grouping.

use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

use inferwatch_core::{group_inferences, parse_inference, EpochWindow};

use super::SyncEngine;
use crate::client::collect_inferences;
use crate::error::{ResultExt, ServiceError, ServiceResult};

/// Summary of one inference cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InferenceCycle {
    /// Pages followed
    pub pages: usize,
    /// Raw records received
    pub records: usize,
    /// Records skipped as malformed
    pub malformed: usize,
    /// Records outside the target epochs
    pub outside_window: usize,
    /// Records with a status outside every category
    pub uncategorized: usize,
    /// (epoch, participant) groups written
    pub groups: usize,
    /// Cache rows written
    pub rows: usize,
}

impl SyncEngine {
    /// Scheduled cycle: walk the whole inference collection once and rewrite
    /// the categorized lists of the current and previous epoch.
    pub async fn poll_inferences(&self) -> ServiceResult<InferenceCycle> {
        let roster = self.current_roster().await?;
        let latest = self.chain().latest_epoch().await.upstream()?;
        let window = EpochWindow::new(
            roster.epoch_id,
            roster.effective_block_height,
            latest.epoch_length,
        )
        .map_err(|e| ServiceError::Upstream(e.into()))?;

        let mut rosters: BTreeMap<u64, BTreeSet<String>> = BTreeMap::new();
        rosters.insert(
            roster.epoch_id,
            roster.participants.iter().map(|p| p.index.clone()).collect(),
        );
        if roster.epoch_id > 0 {
            let previous = roster.epoch_id - 1;
            match self.chain().epoch_roster(previous).await {
                Ok(prev) => {
                    rosters.insert(
                        previous,
                        prev.participants.into_iter().map(|p| p.index).collect(),
                    );
                }
                Err(e) => warn!(
                    "Roster of epoch {} unavailable; only participants with records get rows: {:#}",
                    previous, e
                ),
            }
        }

        let (raw, pages) = collect_inferences(self.chain()).await.upstream()?;
        let mut cycle = InferenceCycle {
            pages,
            records: raw.len(),
            ..Default::default()
        };

        let mut parsed = Vec::with_capacity(raw.len());
        for value in &raw {
            match parse_inference(value) {
                Ok(item) => parsed.push(item),
                Err(e) => {
                    cycle.malformed += 1;
                    let id = value
                        .get("inference_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or("<unknown>");
                    warn!("Skipping malformed inference {}: {}", id, e);
                }
            }
        }

        let grouping = group_inferences(parsed, &window, &rosters);
        cycle.outside_window = grouping.outside_window;
        cycle.uncategorized = grouping.uncategorized;
        cycle.groups = grouping.groups.len();
        cycle.rows = self
            .storage()
            .save_inference_groups(&grouping.groups)
            .await
            .storage()?;

        info!(
            "Inference cycle complete: {} records in {} pages, {} groups, {} malformed",
            cycle.records, cycle.pages, cycle.groups, cycle.malformed
        );
        Ok(cycle)
    }
}
