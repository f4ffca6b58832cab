//! Bulk inference grouping.
//!
//! The whole upstream inference collection is fetched once per cycle and
//! grouped here: each record is parsed, its epoch repaired, filtered to the
//! retained epochs, categorized, and kept only if it is among the ten most
//! recent of its (epoch, participant, category) group.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::constants::INFERENCE_TOP_N;
use crate::de::{i64_from_value, string_from_value, u64_from_value};
use crate::epoch::EpochWindow;
use crate::error::{CoreError, Result};
use crate::types::{InferenceCategory, InferenceRecord, InferenceStatus};

/// An upstream inference record after parsing, before epoch repair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamInference {
    /// Participant that executed the inference.
    pub participant_id: String,
    /// Epoch id as reported upstream (0 when unknown).
    pub reported_epoch_id: u64,
    /// Parsed start height.
    pub start_height: u64,
    /// Parsed start timestamp, used for ordering.
    pub timestamp: i64,
    /// Parsed status.
    pub status: InferenceStatus,
    /// Record as it will be cached.
    pub record: InferenceRecord,
}

fn required_str(value: &Value, field: &'static str) -> Result<String> {
    match value.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(Value::Null) | None => Err(CoreError::missing(field)),
        Some(_) => Err(CoreError::invalid(field, "is not a non-empty string")),
    }
}

fn optional_str(value: &Value, field: &'static str) -> Option<String> {
    value
        .get(field)
        .and_then(string_from_value)
        .filter(|s| !s.is_empty())
}

fn validated_by(value: &Value) -> Result<Vec<String>> {
    match value.get("validated_by") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| CoreError::invalid("validated_by", "contains a non-string entry"))
            })
            .collect(),
        Some(_) => Err(CoreError::invalid("validated_by", "is not an array")),
    }
}

/// Parse one upstream inference object.
///
/// A missing identifier, executor, status, start height or timestamp, or an
/// unparsable `validated_by`, makes the record malformed.
pub fn parse_inference(value: &Value) -> Result<UpstreamInference> {
    let inference_id = required_str(value, "inference_id")?;
    let participant_id = required_str(value, "executed_by")?;
    let status_raw = required_str(value, "status")?;

    let height_raw = value
        .get("start_block_height")
        .ok_or_else(|| CoreError::missing("start_block_height"))?;
    let start_height = u64_from_value(height_raw)
        .ok_or_else(|| CoreError::invalid("start_block_height", "is not an integer"))?;

    let ts_raw = value
        .get("start_block_timestamp")
        .ok_or_else(|| CoreError::missing("start_block_timestamp"))?;
    let timestamp = i64_from_value(ts_raw)
        .ok_or_else(|| CoreError::invalid("start_block_timestamp", "is not an integer"))?;

    // Protobuf JSON omits zero values, so an absent epoch reads as 0.
    let reported_epoch_id = value
        .get("epoch_id")
        .or_else(|| value.get("epoch_group_id"))
        .and_then(u64_from_value)
        .unwrap_or(0);

    let record = InferenceRecord {
        inference_id,
        status: status_raw.clone(),
        start_block_height: start_height.to_string(),
        start_block_timestamp: timestamp.to_string(),
        validated_by: validated_by(value)?,
        prompt_hash: optional_str(value, "prompt_hash"),
        response_hash: optional_str(value, "response_hash"),
        prompt_payload: optional_str(value, "prompt_payload"),
        response_payload: optional_str(value, "response_payload"),
        prompt_token_count: optional_str(value, "prompt_token_count"),
        completion_token_count: optional_str(value, "completion_token_count"),
        model: optional_str(value, "model"),
    };

    Ok(UpstreamInference {
        participant_id,
        reported_epoch_id,
        start_height,
        timestamp,
        status: InferenceStatus::parse(&status_raw),
        record,
    })
}

/// Bounded, timestamp-descending records of one participant in one epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategorizedInferences {
    /// FINISHED and VALIDATED records.
    pub successful: Vec<InferenceRecord>,
    /// EXPIRED records.
    pub expired: Vec<InferenceRecord>,
    /// INVALIDATED records.
    pub invalidated: Vec<InferenceRecord>,
}

impl CategorizedInferences {
    /// Records of one category.
    pub fn get(&self, category: InferenceCategory) -> &[InferenceRecord] {
        match category {
            InferenceCategory::Successful => &self.successful,
            InferenceCategory::Expired => &self.expired,
            InferenceCategory::Invalidated => &self.invalidated,
        }
    }

    /// Replace the records of one category.
    pub fn set(&mut self, category: InferenceCategory, records: Vec<InferenceRecord>) {
        match category {
            InferenceCategory::Successful => self.successful = records,
            InferenceCategory::Expired => self.expired = records,
            InferenceCategory::Invalidated => self.invalidated = records,
        }
    }

    /// Total retained records.
    pub fn len(&self) -> usize {
        self.successful.len() + self.expired.len() + self.invalidated.len()
    }

    /// Whether no record is retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Grouping result keyed by `(epoch_id, participant_id)`.
#[derive(Debug, Default)]
pub struct InferenceGrouping {
    /// One entry per known participant per target epoch.
    pub groups: BTreeMap<(u64, String), CategorizedInferences>,
    /// Records whose repaired epoch fell outside the target set.
    pub outside_window: usize,
    /// Records with a status that is not retained.
    pub uncategorized: usize,
}

/// Group parsed records into bounded per-participant category lists.
///
/// `rosters` lists the participants known for each target epoch; every one of
/// them receives an entry, even with no surviving records. Participants that
/// only appear through records also receive one.
pub fn group_inferences(
    records: Vec<UpstreamInference>,
    window: &EpochWindow,
    rosters: &BTreeMap<u64, BTreeSet<String>>,
) -> InferenceGrouping {
    let mut grouping = InferenceGrouping::default();
    let mut buckets: BTreeMap<(u64, String, InferenceCategory), Vec<(i64, InferenceRecord)>> =
        BTreeMap::new();

    for (epoch_id, roster) in rosters {
        if !window.is_target(*epoch_id) {
            continue;
        }
        for participant in roster {
            grouping
                .groups
                .entry((*epoch_id, participant.clone()))
                .or_default();
        }
    }

    for item in records {
        let epoch_id = window.repair(item.reported_epoch_id, item.start_height);
        if !window.is_target(epoch_id) {
            grouping.outside_window += 1;
            continue;
        }
        let Some(category) = item.status.category() else {
            grouping.uncategorized += 1;
            continue;
        };
        grouping
            .groups
            .entry((epoch_id, item.participant_id.clone()))
            .or_default();
        buckets
            .entry((epoch_id, item.participant_id, category))
            .or_default()
            .push((item.timestamp, item.record));
    }

    for ((epoch_id, participant_id, category), mut entries) in buckets {
        entries.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| b.1.inference_id.cmp(&a.1.inference_id))
        });
        entries.truncate(INFERENCE_TOP_N);
        let records = entries.into_iter().map(|(_, r)| r).collect();
        if let Some(group) = grouping.groups.get_mut(&(epoch_id, participant_id)) {
            group.set(category, records);
        }
    }

    grouping
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(id: &str, who: &str, status: &str, epoch: u64, height: u64, ts: i64) -> Value {
        json!({
            "inference_id": id,
            "executed_by": who,
            "status": status,
            "epoch_id": epoch.to_string(),
            "start_block_height": height.to_string(),
            "start_block_timestamp": ts.to_string(),
            "validated_by": ["val1"],
            "model": "Qwen/Qwen2.5-7B-Instruct",
        })
    }

    fn window() -> EpochWindow {
        EpochWindow::new(65, 1_000_000, 1_000).unwrap()
    }

    fn rosters(current: &[&str], previous: &[&str]) -> BTreeMap<u64, BTreeSet<String>> {
        let mut map = BTreeMap::new();
        map.insert(65, current.iter().map(|s| s.to_string()).collect());
        map.insert(64, previous.iter().map(|s| s.to_string()).collect());
        map
    }

    #[test]
    fn test_parse_requires_identifier() {
        let mut v = raw("i1", "p1", "FINISHED", 65, 1_000_100, 1);
        v.as_object_mut().unwrap().remove("inference_id");
        assert_eq!(
            parse_inference(&v),
            Err(CoreError::missing("inference_id"))
        );
    }

    #[test]
    fn test_parse_rejects_bad_validated_by() {
        let mut v = raw("i1", "p1", "FINISHED", 65, 1_000_100, 1);
        v["validated_by"] = json!("val1,val2");
        assert!(parse_inference(&v).is_err());
    }

    #[test]
    fn test_parse_missing_epoch_reads_as_zero() {
        let mut v = raw("i1", "p1", "EXPIRED", 0, 999_500, 1);
        v.as_object_mut().unwrap().remove("epoch_id");
        let parsed = parse_inference(&v).unwrap();
        assert_eq!(parsed.reported_epoch_id, 0);
        assert_eq!(parsed.record.validated_by, vec!["val1".to_string()]);
    }

    #[test]
    fn test_expired_records_are_reassigned() {
        let records = vec![
            parse_inference(&raw("e1", "p1", "EXPIRED", 0, 999_500, 10)).unwrap(),
            parse_inference(&raw("e2", "p1", "EXPIRED", 0, 1_000_200, 20)).unwrap(),
            parse_inference(&raw("e3", "p1", "EXPIRED", 0, 997_000, 5)).unwrap(),
        ];
        let grouping = group_inferences(records, &window(), &rosters(&["p1"], &["p1"]));

        let current = &grouping.groups[&(65, "p1".to_string())];
        let previous = &grouping.groups[&(64, "p1".to_string())];
        assert_eq!(current.expired.len(), 1);
        assert_eq!(current.expired[0].inference_id, "e2");
        assert_eq!(previous.expired.len(), 1);
        assert_eq!(previous.expired[0].inference_id, "e1");
        assert_eq!(grouping.outside_window, 1);
    }

    #[test]
    fn test_top_n_keeps_most_recent() {
        let records: Vec<_> = (0..15)
            .map(|i| {
                parse_inference(&raw(
                    &format!("i{:02}", i),
                    "p1",
                    if i % 2 == 0 { "FINISHED" } else { "VALIDATED" },
                    65,
                    1_000_100 + i as u64,
                    1_700_000_000_000 + i,
                ))
                .unwrap()
            })
            .collect();
        let grouping = group_inferences(records, &window(), &rosters(&["p1"], &[]));
        let group = &grouping.groups[&(65, "p1".to_string())];

        assert_eq!(group.successful.len(), INFERENCE_TOP_N);
        let ids: Vec<_> = group.successful.iter().map(|r| r.inference_id.as_str()).collect();
        assert_eq!(ids.first(), Some(&"i14"));
        assert_eq!(ids.last(), Some(&"i05"));
        assert!(group.expired.is_empty());
    }

    #[test]
    fn test_every_roster_member_gets_a_group() {
        let records = vec![parse_inference(&raw("x", "p1", "INVALIDATED", 65, 1_000_010, 1)).unwrap()];
        let grouping = group_inferences(records, &window(), &rosters(&["p1", "p2"], &["p3"]));

        assert_eq!(grouping.groups.len(), 3);
        assert!(grouping.groups[&(65, "p2".to_string())].is_empty());
        assert!(grouping.groups[&(64, "p3".to_string())].is_empty());
        assert_eq!(grouping.groups[&(65, "p1".to_string())].invalidated.len(), 1);
    }

    #[test]
    fn test_unretained_statuses_are_dropped() {
        let records = vec![parse_inference(&raw("s", "p1", "STARTED", 65, 1_000_010, 1)).unwrap()];
        let grouping = group_inferences(records, &window(), &rosters(&["p1"], &[]));
        assert_eq!(grouping.uncategorized, 1);
        assert!(grouping.groups[&(65, "p1".to_string())].is_empty());
    }

    #[test]
    fn test_regrouping_is_stable() {
        let build = || {
            vec![
                parse_inference(&raw("a", "p1", "EXPIRED", 0, 999_900, 3)).unwrap(),
                parse_inference(&raw("b", "p1", "FINISHED", 64, 999_950, 4)).unwrap(),
            ]
        };
        let first = group_inferences(build(), &window(), &rosters(&["p1"], &["p1"]));
        let second = group_inferences(build(), &window(), &rosters(&["p1"], &["p1"]));
        assert_eq!(first.groups, second.groups);
    }
}
