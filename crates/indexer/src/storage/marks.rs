//! Completion marks for work that may store no rows.
//!
//! An absent mark means "not yet done"; a mark with no rows next to it means
//! "done, nothing there".

use super::{now_rfc3339, CacheMark, Storage};
use anyhow::{Context, Result};

impl Storage {
    /// Record that `mark` completed for an epoch.
    pub async fn mark_done(&self, mark: CacheMark, epoch_id: u64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cache_marks (kind, epoch_id, marked_at)
            VALUES (?, ?, ?)
            ON CONFLICT(kind, epoch_id) DO UPDATE SET marked_at = excluded.marked_at
            "#,
        )
        .bind(mark.as_str())
        .bind(epoch_id as i64)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to mark {} done for epoch {}", mark.as_str(), epoch_id))?;

        Ok(())
    }

    /// When `mark` last completed for an epoch.
    pub async fn done_at(&self, mark: CacheMark, epoch_id: u64) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT marked_at FROM cache_marks WHERE kind = ? AND epoch_id = ?")
            .bind(mark.as_str())
            .bind(epoch_id as i64)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load completion mark")
    }

    /// When `mark` last completed for any epoch.
    pub async fn last_done(&self, mark: CacheMark) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT MAX(marked_at) FROM cache_marks WHERE kind = ?")
            .bind(mark.as_str())
            .fetch_one(&self.pool)
            .await
            .context("Failed to load completion mark")
    }
}
