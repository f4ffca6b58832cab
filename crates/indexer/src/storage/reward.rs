//! Reward storage: per-participant rewards and per-epoch totals.

use super::{now_rfc3339, Storage};
use anyhow::{Context, Result};
use inferwatch_core::RewardRecord;
use sqlx::Row;

impl Storage {
    /// Upsert a batch of participant rewards.
    pub async fn save_rewards(&self, rewards: &[RewardRecord]) -> Result<()> {
        if rewards.is_empty() {
            return Ok(());
        }

        let cached_at = now_rfc3339();
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        for reward in rewards {
            sqlx::query(
                r#"
                INSERT INTO participant_rewards (
                    epoch_id, participant_id, rewarded_coins, claimed, cached_at
                )
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(epoch_id, participant_id) DO UPDATE SET
                    rewarded_coins = excluded.rewarded_coins,
                    claimed = excluded.claimed,
                    cached_at = excluded.cached_at
                "#,
            )
            .bind(reward.epoch_id as i64)
            .bind(&reward.participant_id)
            .bind(&reward.rewarded_coins)
            .bind(reward.claimed)
            .bind(&cached_at)
            .execute(&mut *tx)
            .await
            .with_context(|| {
                format!(
                    "Failed to save reward for {} in epoch {}",
                    reward.participant_id, reward.epoch_id
                )
            })?;
        }

        tx.commit().await.context("Failed to commit rewards")?;
        Ok(())
    }

    /// Reward of one participant in one epoch.
    pub async fn get_reward(&self, epoch_id: u64, participant_id: &str) -> Result<Option<RewardRecord>> {
        let row = sqlx::query(
            r#"
            SELECT epoch_id, participant_id, rewarded_coins, claimed
            FROM participant_rewards
            WHERE epoch_id = ? AND participant_id = ?
            "#,
        )
        .bind(epoch_id as i64)
        .bind(participant_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load reward")?;

        Ok(row.map(Self::row_to_reward))
    }

    /// Cached rewards of one participant across the given epochs.
    pub async fn get_rewards_for_participant(
        &self,
        participant_id: &str,
        epoch_ids: &[u64],
    ) -> Result<Vec<RewardRecord>> {
        let mut rewards = Vec::with_capacity(epoch_ids.len());
        for &epoch_id in epoch_ids {
            if let Some(reward) = self.get_reward(epoch_id, participant_id).await? {
                rewards.push(reward);
            }
        }
        Ok(rewards)
    }

    /// Cached reward total of an epoch in GNK.
    pub async fn get_epoch_reward_total(&self, epoch_id: u64) -> Result<Option<u64>> {
        let total: Option<i64> =
            sqlx::query_scalar("SELECT total_gnk FROM epoch_reward_totals WHERE epoch_id = ?")
                .bind(epoch_id as i64)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to load epoch reward total")?;

        Ok(total.map(|t| t as u64))
    }

    /// Store an epoch's reward total in GNK.
    pub async fn save_epoch_reward_total(&self, epoch_id: u64, total_gnk: u64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO epoch_reward_totals (epoch_id, total_gnk, calculated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(epoch_id) DO UPDATE SET
                total_gnk = excluded.total_gnk,
                calculated_at = excluded.calculated_at
            "#,
        )
        .bind(epoch_id as i64)
        .bind(i64::try_from(total_gnk).unwrap_or(i64::MAX))
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to save epoch reward total")?;

        Ok(())
    }

    /// Delete an epoch's cached reward total.
    pub async fn delete_epoch_reward_total(&self, epoch_id: u64) -> Result<()> {
        sqlx::query("DELETE FROM epoch_reward_totals WHERE epoch_id = ?")
            .bind(epoch_id as i64)
            .execute(&self.pool)
            .await
            .context("Failed to delete epoch reward total")?;

        Ok(())
    }

    fn row_to_reward(row: sqlx::sqlite::SqliteRow) -> RewardRecord {
        RewardRecord {
            epoch_id: row.get::<i64, _>("epoch_id") as u64,
            participant_id: row.get("participant_id"),
            rewarded_coins: row.get("rewarded_coins"),
            claimed: row.get("claimed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::setup_storage;

    fn reward(epoch_id: u64, participant: &str, coins: &str, claimed: bool) -> RewardRecord {
        RewardRecord {
            epoch_id,
            participant_id: participant.to_string(),
            rewarded_coins: coins.to_string(),
            claimed,
        }
    }

    #[tokio::test]
    async fn test_reward_upsert_and_lookup() {
        let (storage, _temp_db) = setup_storage().await;

        storage
            .save_rewards(&[
                reward(60, "p1", "1000000000", false),
                reward(61, "p1", "2000000000", false),
            ])
            .await
            .unwrap();
        storage
            .save_rewards(&[reward(60, "p1", "1000000000", true)])
            .await
            .unwrap();

        let r = storage.get_reward(60, "p1").await.unwrap().unwrap();
        assert!(r.claimed);
        assert!(storage.get_reward(59, "p1").await.unwrap().is_none());

        let many = storage
            .get_rewards_for_participant("p1", &[59, 60, 61])
            .await
            .unwrap();
        assert_eq!(many.len(), 2);

        storage.close().await;
    }

    #[tokio::test]
    async fn test_reward_total_lifecycle() {
        let (storage, _temp_db) = setup_storage().await;

        assert_eq!(storage.get_epoch_reward_total(58).await.unwrap(), None);
        storage.save_epoch_reward_total(58, 0).await.unwrap();
        assert_eq!(storage.get_epoch_reward_total(58).await.unwrap(), Some(0));

        storage.delete_epoch_reward_total(58).await.unwrap();
        assert_eq!(storage.get_epoch_reward_total(58).await.unwrap(), None);

        storage.save_epoch_reward_total(58, 12_345).await.unwrap();
        assert_eq!(storage.get_epoch_reward_total(58).await.unwrap(), Some(12_345));

        storage.close().await;
    }
}
