//! Validator jail status and node health storage.

use super::{now_rfc3339, Storage};
use anyhow::{Context, Result};
use inferwatch_core::{JailStatus, NodeHealth};
use sqlx::Row;

impl Storage {
    /// Upsert the jail statuses of an epoch.
    pub async fn save_jail_statuses(&self, epoch_id: u64, statuses: &[JailStatus]) -> Result<()> {
        if statuses.is_empty() {
            return Ok(());
        }

        let recorded_at = now_rfc3339();
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        for status in statuses {
            sqlx::query(
                r#"
                INSERT INTO jail_status (
                    epoch_id, participant_id, is_jailed, jailed_until, ready_to_unjail,
                    valcons_address, moniker, identity, keybase_username,
                    keybase_picture_url, website, validator_consensus_key,
                    consensus_key_mismatch, recorded_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(epoch_id, participant_id) DO UPDATE SET
                    is_jailed = excluded.is_jailed,
                    jailed_until = excluded.jailed_until,
                    ready_to_unjail = excluded.ready_to_unjail,
                    valcons_address = excluded.valcons_address,
                    moniker = excluded.moniker,
                    identity = excluded.identity,
                    keybase_username = excluded.keybase_username,
                    keybase_picture_url = excluded.keybase_picture_url,
                    website = excluded.website,
                    validator_consensus_key = excluded.validator_consensus_key,
                    consensus_key_mismatch = excluded.consensus_key_mismatch,
                    recorded_at = excluded.recorded_at
                "#,
            )
            .bind(epoch_id as i64)
            .bind(&status.participant_id)
            .bind(status.is_jailed)
            .bind(status.jailed_until.as_deref())
            .bind(status.ready_to_unjail)
            .bind(status.valcons_address.as_deref())
            .bind(status.moniker.as_deref())
            .bind(status.identity.as_deref())
            .bind(status.keybase_username.as_deref())
            .bind(status.keybase_picture_url.as_deref())
            .bind(status.website.as_deref())
            .bind(status.validator_consensus_key.as_deref())
            .bind(status.consensus_key_mismatch)
            .bind(&recorded_at)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to save jail status for {}", status.participant_id))?;
        }

        tx.commit().await.context("Failed to commit jail statuses")?;
        Ok(())
    }

    /// Jail statuses cached for an epoch.
    pub async fn get_jail_statuses(&self, epoch_id: u64) -> Result<Vec<JailStatus>> {
        let rows = sqlx::query(
            r#"
            SELECT participant_id, is_jailed, jailed_until, ready_to_unjail,
                   valcons_address, moniker, identity, keybase_username,
                   keybase_picture_url, website, validator_consensus_key,
                   consensus_key_mismatch
            FROM jail_status
            WHERE epoch_id = ?
            ORDER BY participant_id ASC
            "#,
        )
        .bind(epoch_id as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load jail statuses")?;

        Ok(rows
            .into_iter()
            .map(|row| JailStatus {
                participant_id: row.get("participant_id"),
                is_jailed: row.get("is_jailed"),
                jailed_until: row.get("jailed_until"),
                ready_to_unjail: row.get("ready_to_unjail"),
                valcons_address: row.get("valcons_address"),
                moniker: row.get("moniker"),
                identity: row.get("identity"),
                keybase_username: row.get("keybase_username"),
                keybase_picture_url: row.get("keybase_picture_url"),
                website: row.get("website"),
                validator_consensus_key: row.get("validator_consensus_key"),
                consensus_key_mismatch: row.get("consensus_key_mismatch"),
            })
            .collect())
    }

    /// Upsert node health probes.
    pub async fn save_node_health(&self, probes: &[NodeHealth]) -> Result<()> {
        if probes.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        for probe in probes {
            sqlx::query(
                r#"
                INSERT INTO node_health (
                    participant_id, is_healthy, error_message, response_time_ms, checked_at
                )
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(participant_id) DO UPDATE SET
                    is_healthy = excluded.is_healthy,
                    error_message = excluded.error_message,
                    response_time_ms = excluded.response_time_ms,
                    checked_at = excluded.checked_at
                "#,
            )
            .bind(&probe.participant_id)
            .bind(probe.is_healthy)
            .bind(probe.error_message.as_deref())
            .bind(probe.response_time_ms.map(|ms| ms as i64))
            .bind(&probe.checked_at)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to save node health for {}", probe.participant_id))?;
        }

        tx.commit().await.context("Failed to commit node health")?;
        Ok(())
    }

    /// Every cached node health probe.
    pub async fn get_node_health(&self) -> Result<Vec<NodeHealth>> {
        let rows = sqlx::query(
            r#"
            SELECT participant_id, is_healthy, error_message, response_time_ms, checked_at
            FROM node_health
            ORDER BY participant_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to load node health")?;

        Ok(rows
            .into_iter()
            .map(|row| NodeHealth {
                participant_id: row.get("participant_id"),
                is_healthy: row.get("is_healthy"),
                error_message: row.get("error_message"),
                response_time_ms: row
                    .get::<Option<i64>, _>("response_time_ms")
                    .map(|ms| ms as u64),
                checked_at: row.get("checked_at"),
            })
            .collect())
    }
}
