//! Categorized inference list storage.

use super::{now_rfc3339, CachedInferences, Storage};
use anyhow::{Context, Result};
use inferwatch_core::{CategorizedInferences, InferenceCategory, InferenceRecord};
use sqlx::Row;
use std::collections::BTreeMap;

impl Storage {
    /// Store grouped inference lists: one row per (epoch, participant, category).
    ///
    /// Every group writes all three categories, so a participant with no
    /// records still gets rows (with empty lists) and a timestamp.
    pub async fn save_inference_groups(
        &self,
        groups: &BTreeMap<(u64, String), CategorizedInferences>,
    ) -> Result<usize> {
        let cached_at = now_rfc3339();
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        let mut rows = 0;

        for ((epoch_id, participant_id), lists) in groups {
            for category in InferenceCategory::ALL {
                let json = serde_json::to_string(lists.get(category))
                    .context("Failed to encode inference records")?;
                sqlx::query(
                    r#"
                    INSERT INTO participant_inferences (
                        epoch_id, participant_id, category, records_json, cached_at
                    )
                    VALUES (?, ?, ?, ?, ?)
                    ON CONFLICT(epoch_id, participant_id, category) DO UPDATE SET
                        records_json = excluded.records_json,
                        cached_at = excluded.cached_at
                    "#,
                )
                .bind(*epoch_id as i64)
                .bind(participant_id)
                .bind(category.as_str())
                .bind(json)
                .bind(&cached_at)
                .execute(&mut *tx)
                .await
                .with_context(|| {
                    format!(
                        "Failed to save {} inferences for {} in epoch {}",
                        category, participant_id, epoch_id
                    )
                })?;
                rows += 1;
            }
        }

        tx.commit().await.context("Failed to commit inference lists")?;
        Ok(rows)
    }

    /// Cached inference lists of one participant in one epoch.
    ///
    /// `cached_at` is `None` only when no row exists at all.
    pub async fn get_participant_inferences(
        &self,
        epoch_id: u64,
        participant_id: &str,
    ) -> Result<CachedInferences> {
        let rows = sqlx::query(
            r#"
            SELECT category, records_json, cached_at
            FROM participant_inferences
            WHERE epoch_id = ? AND participant_id = ?
            "#,
        )
        .bind(epoch_id as i64)
        .bind(participant_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load inference lists")?;

        let mut cached = CachedInferences::default();
        for row in rows {
            let category_raw: String = row.get("category");
            let category: InferenceCategory = category_raw
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?;
            let json: String = row.get("records_json");
            let records: Vec<InferenceRecord> = serde_json::from_str(&json).with_context(|| {
                format!("Corrupt {} inferences for {}", category, participant_id)
            })?;
            cached.inferences.set(category, records);

            let row_cached_at: String = row.get("cached_at");
            if cached
                .cached_at
                .as_deref()
                .map_or(true, |c| row_cached_at.as_str() > c)
            {
                cached.cached_at = Some(row_cached_at);
            }
        }

        Ok(cached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::setup_storage;

    fn record(id: &str) -> InferenceRecord {
        InferenceRecord {
            inference_id: id.to_string(),
            status: "FINISHED".to_string(),
            start_block_height: "1000100".to_string(),
            start_block_timestamp: "1700000000000".to_string(),
            validated_by: vec![],
            prompt_hash: None,
            response_hash: None,
            prompt_payload: None,
            response_payload: None,
            prompt_token_count: Some("12".to_string()),
            completion_token_count: None,
            model: None,
        }
    }

    #[tokio::test]
    async fn test_unpolled_versus_polled_empty() {
        let (storage, _temp_db) = setup_storage().await;

        let unpolled = storage.get_participant_inferences(65, "p2").await.unwrap();
        assert!(unpolled.cached_at.is_none());
        assert!(unpolled.inferences.is_empty());

        let mut groups = BTreeMap::new();
        groups.insert((65, "p2".to_string()), CategorizedInferences::default());
        let mut with_records = CategorizedInferences::default();
        with_records.successful = vec![record("a"), record("b")];
        groups.insert((65, "p1".to_string()), with_records);

        assert_eq!(storage.save_inference_groups(&groups).await.unwrap(), 6);

        let empty = storage.get_participant_inferences(65, "p2").await.unwrap();
        assert!(empty.cached_at.is_some());
        assert!(empty.inferences.is_empty());

        let full = storage.get_participant_inferences(65, "p1").await.unwrap();
        assert_eq!(full.inferences.successful.len(), 2);
        assert_eq!(full.inferences.successful[0].inference_id, "a");
        assert!(full.inferences.expired.is_empty());

        storage.close().await;
    }

    #[tokio::test]
    async fn test_regroup_replaces_lists() {
        let (storage, _temp_db) = setup_storage().await;

        let mut first = CategorizedInferences::default();
        first.expired = vec![record("old")];
        let mut groups = BTreeMap::new();
        groups.insert((64, "p1".to_string()), first);
        storage.save_inference_groups(&groups).await.unwrap();

        groups.insert((64, "p1".to_string()), CategorizedInferences::default());
        storage.save_inference_groups(&groups).await.unwrap();

        let cached = storage.get_participant_inferences(64, "p1").await.unwrap();
        assert!(cached.inferences.expired.is_empty());

        storage.close().await;
    }
}
