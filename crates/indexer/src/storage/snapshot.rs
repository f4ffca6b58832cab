//! Participant snapshot and epoch status storage.
//!
//! Two lookup modes exist: the exact `(epoch, height)` row set, used for
//! historical epochs pinned to their settlement height, and the latest row
//! set of an epoch, used for the current epoch whose height moves every block.

use super::{now_rfc3339, EpochStatus, SnapshotSet, Storage};
use crate::client::EpochRoster;
use anyhow::{Context, Result};
use inferwatch_core::ParticipantSnapshot;
use sqlx::Row;

impl Storage {
    /// Store the snapshots of one epoch at one height, replacing any existing
    /// rows for the same participants.
    pub async fn save_snapshots(
        &self,
        epoch_id: u64,
        height: u64,
        snapshots: &[ParticipantSnapshot],
    ) -> Result<()> {
        let cached_at = now_rfc3339();
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        for snapshot in snapshots {
            let json = serde_json::to_string(snapshot).context("Failed to encode snapshot")?;
            sqlx::query(
                r#"
                INSERT INTO participant_snapshots (
                    epoch_id, height, participant_id, snapshot_json, seed_signature, cached_at
                )
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(epoch_id, height, participant_id) DO UPDATE SET
                    snapshot_json = excluded.snapshot_json,
                    seed_signature = excluded.seed_signature,
                    cached_at = excluded.cached_at
                "#,
            )
            .bind(epoch_id as i64)
            .bind(height as i64)
            .bind(&snapshot.participant_id)
            .bind(json)
            .bind(snapshot.seed_signature.as_deref())
            .bind(&cached_at)
            .execute(&mut *tx)
            .await
            .with_context(|| {
                format!(
                    "Failed to save snapshot for {} in epoch {}",
                    snapshot.participant_id, epoch_id
                )
            })?;
        }

        tx.commit().await.context("Failed to commit snapshots")?;
        Ok(())
    }

    /// Snapshots of an epoch at exactly the given height.
    pub async fn get_snapshots_at(&self, epoch_id: u64, height: u64) -> Result<Option<SnapshotSet>> {
        let rows = sqlx::query(
            r#"
            SELECT participant_id, snapshot_json, cached_at
            FROM participant_snapshots
            WHERE epoch_id = ? AND height = ?
            ORDER BY participant_id ASC
            "#,
        )
        .bind(epoch_id as i64)
        .bind(height as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load snapshots")?;

        Self::rows_to_snapshot_set(epoch_id, height, rows)
    }

    /// Snapshots of an epoch at the highest cached height, whatever it is.
    pub async fn get_latest_snapshots(&self, epoch_id: u64) -> Result<Option<SnapshotSet>> {
        let height: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(height) FROM participant_snapshots WHERE epoch_id = ?",
        )
        .bind(epoch_id as i64)
        .fetch_one(&self.pool)
        .await
        .context("Failed to find latest snapshot height")?;

        match height {
            Some(height) => self.get_snapshots_at(epoch_id, height as u64).await,
            None => Ok(None),
        }
    }

    /// Drop an epoch's snapshot rows below a height.
    ///
    /// Used after a current-epoch refresh so the epoch keeps a single row set.
    pub async fn prune_snapshots_below(&self, epoch_id: u64, height: u64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM participant_snapshots WHERE epoch_id = ? AND height < ?",
        )
        .bind(epoch_id as i64)
        .bind(height as i64)
        .execute(&self.pool)
        .await
        .context("Failed to prune snapshots")?;

        Ok(result.rows_affected())
    }

    /// Highest epoch with cached snapshots.
    pub async fn latest_cached_epoch(&self) -> Result<Option<u64>> {
        let epoch: Option<i64> = sqlx::query_scalar("SELECT MAX(epoch_id) FROM participant_snapshots")
            .fetch_one(&self.pool)
            .await
            .context("Failed to find latest cached epoch")?;
        Ok(epoch.map(|e| e as u64))
    }

    /// Store the roster of an epoch, replacing any earlier copy.
    pub async fn save_roster(&self, roster: &EpochRoster) -> Result<()> {
        let json = serde_json::to_string(roster).context("Failed to encode roster")?;
        sqlx::query(
            r#"
            INSERT INTO epoch_rosters (epoch_id, roster_json, cached_at)
            VALUES (?, ?, ?)
            ON CONFLICT(epoch_id) DO UPDATE SET
                roster_json = excluded.roster_json,
                cached_at = excluded.cached_at
            "#,
        )
        .bind(roster.epoch_id as i64)
        .bind(json)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save roster of epoch {}", roster.epoch_id))?;

        Ok(())
    }

    /// Cached roster of an epoch.
    pub async fn get_roster(&self, epoch_id: u64) -> Result<Option<EpochRoster>> {
        let json: Option<String> =
            sqlx::query_scalar("SELECT roster_json FROM epoch_rosters WHERE epoch_id = ?")
                .bind(epoch_id as i64)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to load roster")?;

        json.map(|json| {
            serde_json::from_str(&json)
                .with_context(|| format!("Corrupt roster of epoch {}", epoch_id))
        })
        .transpose()
    }

    /// Record that an epoch's final snapshot was taken at its settlement height.
    ///
    /// The first mark wins.
    pub async fn mark_epoch_finished(&self, epoch_id: u64, finished_height: u64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO epoch_status (epoch_id, finished_height, marked_at)
            VALUES (?, ?, ?)
            ON CONFLICT(epoch_id) DO NOTHING
            "#,
        )
        .bind(epoch_id as i64)
        .bind(finished_height as i64)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to mark epoch finished")?;

        Ok(())
    }

    /// Finished status of an epoch.
    pub async fn get_epoch_status(&self, epoch_id: u64) -> Result<Option<EpochStatus>> {
        let row = sqlx::query(
            r#"
            SELECT epoch_id, finished_height, marked_at
            FROM epoch_status
            WHERE epoch_id = ?
            "#,
        )
        .bind(epoch_id as i64)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load epoch status")?;

        Ok(row.map(|row| EpochStatus {
            epoch_id: row.get::<i64, _>("epoch_id") as u64,
            finished_height: row.get::<i64, _>("finished_height") as u64,
            marked_at: row.get("marked_at"),
        }))
    }

    /// Whether an epoch has been marked finished.
    pub async fn is_epoch_finished(&self, epoch_id: u64) -> Result<bool> {
        Ok(self.get_epoch_status(epoch_id).await?.is_some())
    }

    fn rows_to_snapshot_set(
        epoch_id: u64,
        height: u64,
        rows: Vec<sqlx::sqlite::SqliteRow>,
    ) -> Result<Option<SnapshotSet>> {
        if rows.is_empty() {
            return Ok(None);
        }

        let mut cached_at: Option<String> = None;
        let mut snapshots = Vec::with_capacity(rows.len());
        for row in rows {
            let participant_id: String = row.get("participant_id");
            let json: String = row.get("snapshot_json");
            let row_cached_at: String = row.get("cached_at");

            let snapshot: ParticipantSnapshot = serde_json::from_str(&json).with_context(|| {
                format!("Corrupt snapshot for {} in epoch {}", participant_id, epoch_id)
            })?;
            snapshots.push(snapshot);

            if cached_at.as_deref().map_or(true, |c| row_cached_at.as_str() < c) {
                cached_at = Some(row_cached_at);
            }
        }

        Ok(Some(SnapshotSet {
            epoch_id,
            height,
            cached_at: cached_at.unwrap_or_default(),
            snapshots,
        }))
    }
}
