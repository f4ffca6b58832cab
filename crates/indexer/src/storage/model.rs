//! Model aggregate storage.

use super::{now_rfc3339, Storage};
use anyhow::{Context, Result};
use inferwatch_core::ModelAggregate;
use sqlx::Row;

impl Storage {
    /// Replace every aggregate of an epoch (current epoch refresh).
    pub async fn replace_model_aggregates(
        &self,
        epoch_id: u64,
        aggregates: &[ModelAggregate],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query("DELETE FROM model_aggregates WHERE epoch_id = ?")
            .bind(epoch_id as i64)
            .execute(&mut *tx)
            .await
            .context("Failed to clear model aggregates")?;

        let cached_at = now_rfc3339();
        for aggregate in aggregates {
            sqlx::query(
                r#"
                INSERT INTO model_aggregates (
                    epoch_id, model_id, total_weight, participant_count, cached_at
                )
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(epoch_id as i64)
            .bind(&aggregate.model_id)
            .bind(aggregate.total_weight)
            .bind(aggregate.participant_count as i64)
            .bind(&cached_at)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to save aggregate for {}", aggregate.model_id))?;
        }

        tx.commit().await.context("Failed to commit model aggregates")?;
        Ok(())
    }

    /// Store an epoch's aggregates unless some are already stored.
    ///
    /// Returns whether anything was written; historical aggregates never change
    /// once present.
    pub async fn insert_model_aggregates_if_absent(
        &self,
        epoch_id: u64,
        aggregates: &[ModelAggregate],
    ) -> Result<bool> {
        let existing: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM model_aggregates WHERE epoch_id = ?")
                .bind(epoch_id as i64)
                .fetch_one(&self.pool)
                .await
                .context("Failed to check model aggregates")?;

        if existing > 0 || aggregates.is_empty() {
            return Ok(false);
        }

        self.replace_model_aggregates(epoch_id, aggregates).await?;
        Ok(true)
    }

    /// Aggregates of an epoch, ordered by model id.
    pub async fn get_model_aggregates(&self, epoch_id: u64) -> Result<Vec<ModelAggregate>> {
        let rows = sqlx::query(
            r#"
            SELECT epoch_id, model_id, total_weight, participant_count
            FROM model_aggregates
            WHERE epoch_id = ?
            ORDER BY model_id ASC
            "#,
        )
        .bind(epoch_id as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load model aggregates")?;

        Ok(rows
            .into_iter()
            .map(|row| ModelAggregate {
                epoch_id: row.get::<i64, _>("epoch_id") as u64,
                model_id: row.get("model_id"),
                total_weight: row.get("total_weight"),
                participant_count: row.get::<i64, _>("participant_count") as u64,
            })
            .collect())
    }
}
