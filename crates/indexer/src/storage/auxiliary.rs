//! Auxiliary record storage (warm keys, hardware nodes).
//!
//! A stored empty list means the participant was polled and has nothing; an
//! absent row means it has not been polled for that epoch yet.

use super::{now_rfc3339, AuxiliaryKind, Cached, Storage};
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::Row;

impl Storage {
    /// Replace the auxiliary list of one participant.
    pub async fn save_auxiliary<T: Serialize>(
        &self,
        epoch_id: u64,
        participant_id: &str,
        kind: AuxiliaryKind,
        items: &[T],
    ) -> Result<()> {
        let payload = serde_json::to_string(items)
            .with_context(|| format!("Failed to encode {} payload", kind))?;

        sqlx::query(
            r#"
            INSERT INTO auxiliary_records (epoch_id, participant_id, kind, payload_json, cached_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(epoch_id, participant_id, kind) DO UPDATE SET
                payload_json = excluded.payload_json,
                cached_at = excluded.cached_at
            "#,
        )
        .bind(epoch_id as i64)
        .bind(participant_id)
        .bind(kind.as_str())
        .bind(payload)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| {
            format!(
                "Failed to save {} for {} in epoch {}",
                kind, participant_id, epoch_id
            )
        })?;

        Ok(())
    }

    /// Load the auxiliary list of one participant, `None` if never stored.
    pub async fn get_auxiliary<T: DeserializeOwned>(
        &self,
        epoch_id: u64,
        participant_id: &str,
        kind: AuxiliaryKind,
    ) -> Result<Option<Cached<Vec<T>>>> {
        let row = sqlx::query(
            r#"
            SELECT payload_json, cached_at
            FROM auxiliary_records
            WHERE epoch_id = ? AND participant_id = ? AND kind = ?
            "#,
        )
        .bind(epoch_id as i64)
        .bind(participant_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("Failed to load {} for {}", kind, participant_id))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let payload: String = row.get("payload_json");
        let value: Vec<T> = serde_json::from_str(&payload)
            .with_context(|| format!("Corrupt {} payload for {}", kind, participant_id))?;

        Ok(Some(Cached {
            value,
            cached_at: row.get("cached_at"),
        }))
    }

    /// Whether an auxiliary row exists.
    pub async fn has_auxiliary(
        &self,
        epoch_id: u64,
        participant_id: &str,
        kind: AuxiliaryKind,
    ) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM auxiliary_records
            WHERE epoch_id = ? AND participant_id = ? AND kind = ?
            "#,
        )
        .bind(epoch_id as i64)
        .bind(participant_id)
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("Failed to check {} for {}", kind, participant_id))?;

        Ok(count > 0)
    }
}
