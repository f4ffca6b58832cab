//! Validator jail status and inference endpoint health.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use inferwatch_core::address::{pubkey_to_valcons, to_valoper};
use inferwatch_core::{JailStatus, NodeHealth, VALOPER_PREFIX};

use super::SyncEngine;
use crate::client::{collect_validators, EpochRoster, HealthProbe, RosterEntry, Validator};
use crate::config::PollKind;
use crate::error::{ResultExt, ServiceResult};
use crate::storage::{now_rfc3339, CacheMark};

fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Whether a jail release time has passed. Unparsable times never have.
fn release_passed(jailed_until: &str, now: DateTime<Utc>) -> bool {
    DateTime::parse_from_rfc3339(jailed_until).is_ok_and(|until| until.with_timezone(&Utc) <= now)
}

impl SyncEngine {
    /// Scheduled cycle: jail status of the current roster at the latest height.
    pub async fn poll_jail_status(&self) -> ServiceResult<usize> {
        let height = self.chain().latest_height().await.upstream()?;
        let roster = self.current_roster().await?;
        let statuses = self
            .refresh_jail_statuses(roster.epoch_id, height, &roster)
            .await?;

        let jailed = statuses.iter().filter(|s| s.is_jailed).count();
        info!(
            "Jail status cycle complete: {} validators, {} jailed",
            statuses.len(),
            jailed
        );
        Ok(statuses.len())
    }

    /// Match staking validators to roster participants and store their jail state.
    pub async fn refresh_jail_statuses(
        &self,
        epoch_id: u64,
        height: u64,
        roster: &EpochRoster,
    ) -> ServiceResult<Vec<JailStatus>> {
        let validators = collect_validators(self.chain(), height).await.upstream()?;
        let by_operator: HashMap<&str, &Validator> = validators
            .iter()
            .filter(|v| v.has_tokens())
            .map(|v| (v.operator_address.as_str(), v))
            .collect();

        let mut matched = Vec::new();
        for entry in &roster.participants {
            match to_valoper(&entry.index) {
                Ok(valoper) => {
                    if let Some(validator) = by_operator.get(valoper.as_str()) {
                        matched.push((entry, *validator));
                    }
                }
                Err(e) => debug!("No operator address for {}: {}", entry.index, e),
            }
        }

        let batch_size = self.settings().schedule(PollKind::JailStatus).batch_size.max(1);
        let mut statuses = Vec::with_capacity(matched.len());
        for batch in matched.chunks(batch_size) {
            let results = join_all(
                batch
                    .iter()
                    .map(|(entry, validator)| self.jail_status_of(entry, validator, height)),
            )
            .await;
            statuses.extend(results);
        }

        self.storage()
            .save_jail_statuses(epoch_id, &statuses)
            .await
            .storage()?;
        self.storage()
            .mark_done(CacheMark::JailStatus, epoch_id)
            .await
            .storage()?;
        Ok(statuses)
    }

    async fn jail_status_of(&self, entry: &RosterEntry, validator: &Validator, height: u64) -> JailStatus {
        let consensus_key = validator.consensus_key().map(str::to_string);
        let valcons = consensus_key
            .as_deref()
            .and_then(|key| match pubkey_to_valcons(key) {
                Ok(address) => Some(address),
                Err(e) => {
                    warn!("Bad consensus key for {}: {}", validator.operator_address, e);
                    None
                }
            });

        let mut jailed_until = None;
        if validator.jailed {
            if let Some(valcons) = &valcons {
                match self.chain().signing_info(valcons, height).await {
                    Ok(info) => {
                        jailed_until = JailStatus::meaningful_jailed_until(
                            info.as_ref().and_then(|i| i.jailed_until.as_deref()),
                        );
                    }
                    Err(e) => warn!("Signing info for {} failed: {:#}", valcons, e),
                }
            }
        }
        let ready_to_unjail = validator.jailed
            && jailed_until
                .as_deref()
                .is_some_and(|until| release_passed(until, Utc::now()));

        let description = &validator.description;
        let moniker = non_empty(&description.moniker).filter(|m| !m.starts_with(VALOPER_PREFIX));
        let identity = non_empty(&description.identity);

        let mut keybase_username = None;
        let mut keybase_picture_url = None;
        if let Some(identity) = &identity {
            match self.chain().keybase_lookup(identity).await {
                Ok(Some(profile)) => {
                    keybase_username = Some(profile.username);
                    keybase_picture_url = Some(profile.picture_url);
                }
                Ok(None) => {}
                Err(e) => warn!("Identity lookup for {} failed: {:#}", identity, e),
            }
        }

        let consensus_key_mismatch = match (&entry.validator_key, &consensus_key) {
            (Some(epoch_key), Some(staking_key)) => Some(epoch_key != staking_key),
            _ => None,
        };

        JailStatus {
            participant_id: entry.index.clone(),
            is_jailed: validator.jailed,
            jailed_until,
            ready_to_unjail,
            valcons_address: valcons,
            moniker,
            identity,
            keybase_username,
            keybase_picture_url,
            website: non_empty(&description.website),
            validator_consensus_key: consensus_key,
            consensus_key_mismatch,
        }
    }

    /// Scheduled cycle: probe every roster participant's inference endpoint.
    pub async fn poll_node_health(&self) -> ServiceResult<usize> {
        let roster = self.current_roster().await?;
        let probes = self.refresh_node_health(&roster).await?;

        let healthy = probes.iter().filter(|p| p.is_healthy).count();
        info!(
            "Node health cycle complete: {} of {} healthy",
            healthy,
            probes.len()
        );
        Ok(probes.len())
    }

    /// Probe the endpoints of a roster and store the results.
    pub async fn refresh_node_health(&self, roster: &EpochRoster) -> ServiceResult<Vec<NodeHealth>> {
        let batch_size = self.settings().schedule(PollKind::NodeHealth).batch_size.max(1);
        let mut probes = Vec::with_capacity(roster.participants.len());

        for batch in roster.participants.chunks(batch_size) {
            let results = join_all(batch.iter().map(|entry| async move {
                let probe = match entry.inference_url.as_deref().map(str::trim) {
                    Some(url) if !url.is_empty() => self.chain().node_health(url).await,
                    _ => HealthProbe::no_url(),
                };
                NodeHealth {
                    participant_id: entry.index.clone(),
                    is_healthy: probe.is_healthy,
                    error_message: probe.error_message,
                    response_time_ms: probe.response_time_ms,
                    checked_at: now_rfc3339(),
                }
            }))
            .await;
            probes.extend(results);
        }

        self.storage().save_node_health(&probes).await.storage()?;
        self.storage()
            .mark_done(CacheMark::NodeHealth, roster.epoch_id)
            .await
            .storage()?;
        Ok(probes)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::engine_with;
    use super::*;
    use crate::client::{ConsensusPubkey, SigningInfo, ValidatorDescription};
    use crate::testing::{roster_entry, MockChain};
    use inferwatch_core::address::encode;
    use std::sync::Arc;

    fn validator(valoper: &str, key: &str, jailed: bool, moniker: &str) -> Validator {
        Validator {
            operator_address: valoper.to_string(),
            consensus_pubkey: Some(ConsensusPubkey {
                key: Some(key.to_string()),
                value: None,
            }),
            jailed,
            tokens: "1000".to_string(),
            description: ValidatorDescription {
                moniker: moniker.to_string(),
                identity: " ABCD1234 ".to_string(),
                website: String::new(),
            },
        }
    }

    #[test]
    fn test_release_passed() {
        let now = Utc::now();
        assert!(release_passed("2020-01-01T00:00:00Z", now));
        assert!(!release_passed("2999-01-01T00:00:00Z", now));
        assert!(!release_passed("soon", now));
    }

    #[tokio::test]
    async fn test_jail_status_matches_roster_by_operator() {
        let jailed_addr = encode("gonka", &[1u8; 20]).unwrap();
        let free_addr = encode("gonka", &[2u8; 20]).unwrap();
        let unstaked_addr = encode("gonka", &[3u8; 20]).unwrap();

        let chain = Arc::new(MockChain::with_current_epoch(
            65,
            1_000_000,
            1_000,
            &[jailed_addr.as_str(), free_addr.as_str(), unstaked_addr.as_str()],
        ));
        let mut roster = chain.roster(65).unwrap();
        roster.participants[0].validator_key = Some("AQID".to_string());
        roster.participants[1].validator_key = Some("other".to_string());
        chain.set_roster(roster);

        let jailed_valoper = to_valoper(&jailed_addr).unwrap();
        let free_valoper = to_valoper(&free_addr).unwrap();
        let mut unstaked = validator(&to_valoper(&unstaked_addr).unwrap(), "BAUG", true, "x");
        unstaked.tokens = "0".to_string();
        chain.set_validators(vec![
            validator(&jailed_valoper, "AQID", true, "alpha"),
            validator(&free_valoper, "BwgJ", false, &free_valoper),
            unstaked,
        ]);
        let valcons = pubkey_to_valcons("AQID").unwrap();
        chain.set_signing_info(
            &valcons,
            SigningInfo {
                jailed_until: Some("2020-01-01T00:00:00Z".to_string()),
            },
        );
        chain.set_keybase("ABCD1234", "alice", "https://keybase.io/alice/picture?size=96");

        let (engine, _temp_db) = engine_with(chain.clone()).await;
        assert_eq!(engine.poll_jail_status().await.unwrap(), 2);

        let stored = engine.storage().get_jail_statuses(65).await.unwrap();
        let jailed = stored.iter().find(|s| s.participant_id == jailed_addr).unwrap();
        assert!(jailed.is_jailed);
        assert!(jailed.ready_to_unjail);
        assert_eq!(jailed.valcons_address.as_deref(), Some(valcons.as_str()));
        assert_eq!(jailed.consensus_key_mismatch, Some(false));
        assert_eq!(jailed.moniker.as_deref(), Some("alpha"));
        assert_eq!(jailed.identity.as_deref(), Some("ABCD1234"));
        assert_eq!(jailed.keybase_username.as_deref(), Some("alice"));

        let free = stored.iter().find(|s| s.participant_id == free_addr).unwrap();
        assert!(!free.is_jailed);
        assert_eq!(free.jailed_until, None);
        assert_eq!(free.consensus_key_mismatch, Some(true));
        // A moniker that is just the operator address is blanked.
        assert_eq!(free.moniker, None);

        assert!(stored.iter().all(|s| s.participant_id != unstaked_addr));
        assert_eq!(chain.calls("signing_info"), 1);
    }

    #[tokio::test]
    async fn test_never_jailed_sentinel_is_dropped() {
        let addr = encode("gonka", &[4u8; 20]).unwrap();
        let chain = Arc::new(MockChain::with_current_epoch(65, 1_000_000, 1_000, &[addr.as_str()]));
        chain.set_validators(vec![validator(&to_valoper(&addr).unwrap(), "AQID", true, "m")]);
        chain.set_signing_info(
            &pubkey_to_valcons("AQID").unwrap(),
            SigningInfo {
                jailed_until: Some("1970-01-01T00:00:00Z".to_string()),
            },
        );
        let (engine, _temp_db) = engine_with(chain.clone()).await;

        engine.poll_jail_status().await.unwrap();
        let stored = engine.storage().get_jail_statuses(65).await.unwrap();
        assert!(stored[0].is_jailed);
        assert_eq!(stored[0].jailed_until, None);
        assert!(!stored[0].ready_to_unjail);
    }

    #[tokio::test]
    async fn test_jail_cycle_without_matches_is_marked_polled() {
        let chain = Arc::new(MockChain::with_current_epoch(65, 1_000_000, 1_000, &["p1"]));
        let (engine, _temp_db) = engine_with(chain.clone()).await;

        assert_eq!(engine.poll_jail_status().await.unwrap(), 0);
        assert!(engine.storage().get_jail_statuses(65).await.unwrap().is_empty());
        assert!(engine
            .storage()
            .done_at(CacheMark::JailStatus, 65)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_node_health_probes_roster() {
        let chain = Arc::new(MockChain::with_current_epoch(65, 1_000_000, 1_000, &["p1", "p2"]));
        let mut roster = chain.roster(65).unwrap();
        roster.participants[1].inference_url = Some("  ".to_string());
        roster.participants.push(roster_entry("p3", 10, &[]));
        chain.set_roster(roster);
        chain.set_unhealthy("http://p1.node:8080", "HTTP 503");
        let (engine, _temp_db) = engine_with(chain.clone()).await;

        assert_eq!(engine.poll_node_health().await.unwrap(), 3);

        let stored = engine.storage().get_node_health().await.unwrap();
        let p1 = stored.iter().find(|h| h.participant_id == "p1").unwrap();
        assert!(!p1.is_healthy);
        assert_eq!(p1.error_message.as_deref(), Some("HTTP 503"));

        let p2 = stored.iter().find(|h| h.participant_id == "p2").unwrap();
        assert_eq!(p2.error_message.as_deref(), Some("No inference URL"));

        let p3 = stored.iter().find(|h| h.participant_id == "p3").unwrap();
        assert!(p3.is_healthy);
        assert_eq!(chain.calls("node_health"), 2);
        assert!(engine
            .storage()
            .last_done(CacheMark::NodeHealth)
            .await
            .unwrap()
            .is_some());
    }
}
