//! Per-model weight aggregation.
//!
//! The chain reports a participant's declared models and its per-node weight
//! groups as two parallel lists. They are paired once, at ingestion, into
//! [`ModelWeights`]; aggregation then only ever reads the paired form.

use std::collections::{BTreeMap, BTreeSet};

use crate::types::{ModelAggregate, ModelWeights, NodeWeight, ParticipantSnapshot};

/// Result of pairing declared models with node weight groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pairing {
    /// Paired entries, in declaration order.
    pub model_weights: Vec<ModelWeights>,
    /// Whether the two upstream lists had different lengths.
    pub length_mismatch: bool,
}

/// Pair each declared model with the node weight group at the same position.
///
/// Only positions present in both lists are paired; the caller decides how to
/// report a mismatch.
pub fn pair_model_weights(models: &[String], node_groups: Vec<Vec<NodeWeight>>) -> Pairing {
    let length_mismatch = models.len() != node_groups.len();
    let model_weights = models
        .iter()
        .zip(node_groups)
        .map(|(model_id, node_weights)| ModelWeights {
            model_id: model_id.clone(),
            node_weights,
        })
        .collect();
    Pairing {
        model_weights,
        length_mismatch,
    }
}

/// Aggregate total weight and distinct participant count per model.
///
/// Output is ordered by model id.
pub fn aggregate_models(epoch_id: u64, snapshots: &[ParticipantSnapshot]) -> Vec<ModelAggregate> {
    let mut weights: BTreeMap<&str, i64> = BTreeMap::new();
    let mut participants: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

    for snapshot in snapshots {
        for group in &snapshot.model_weights {
            *weights.entry(group.model_id.as_str()).or_insert(0) += group.total_weight();
            participants
                .entry(group.model_id.as_str())
                .or_default()
                .insert(snapshot.participant_id.as_str());
        }
    }

    weights
        .into_iter()
        .map(|(model_id, total_weight)| ModelAggregate {
            epoch_id,
            model_id: model_id.to_string(),
            total_weight,
            participant_count: participants.get(model_id).map_or(0, |s| s.len() as u64),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EpochCounters;

    fn node(id: &str, weight: Option<i64>) -> NodeWeight {
        NodeWeight {
            node_id: Some(id.to_string()),
            poc_weight: weight,
        }
    }

    fn snapshot(id: &str, models: &[&str], groups: Vec<Vec<NodeWeight>>) -> ParticipantSnapshot {
        let models: Vec<String> = models.iter().map(|m| m.to_string()).collect();
        let pairing = pair_model_weights(&models, groups);
        ParticipantSnapshot {
            participant_id: id.to_string(),
            address: id.to_string(),
            weight: 0,
            validator_key: None,
            inference_url: None,
            status: None,
            models,
            model_weights: pairing.model_weights,
            counters: EpochCounters::default(),
            seed_signature: None,
        }
    }

    #[test]
    fn test_pairing_reports_mismatch() {
        let models = vec!["a".to_string(), "b".to_string()];
        let pairing = pair_model_weights(&models, vec![vec![node("n1", Some(5))]]);
        assert!(pairing.length_mismatch);
        assert_eq!(pairing.model_weights.len(), 1);
        assert_eq!(pairing.model_weights[0].model_id, "a");

        let aligned = pair_model_weights(&models, vec![vec![], vec![]]);
        assert!(!aligned.length_mismatch);
    }

    #[test]
    fn test_aggregate_sums_weights_and_counts_participants() {
        let snapshots = vec![
            snapshot(
                "p1",
                &["qwen", "llama"],
                vec![
                    vec![node("n1", Some(100)), node("n2", None)],
                    vec![node("n3", Some(40))],
                ],
            ),
            snapshot("p2", &["qwen"], vec![vec![node("n1", Some(60))]]),
        ];

        let aggregates = aggregate_models(58, &snapshots);
        assert_eq!(aggregates.len(), 2);

        let llama = &aggregates[0];
        assert_eq!(llama.model_id, "llama");
        assert_eq!(llama.total_weight, 40);
        assert_eq!(llama.participant_count, 1);

        let qwen = &aggregates[1];
        assert_eq!(qwen.model_id, "qwen");
        assert_eq!(qwen.total_weight, 160);
        assert_eq!(qwen.participant_count, 2);
        assert_eq!(qwen.epoch_id, 58);
    }

    #[test]
    fn test_model_without_nodes_still_listed() {
        let aggregates = aggregate_models(1, &[snapshot("p1", &["idle"], vec![vec![]])]);
        assert_eq!(aggregates.len(), 1);
        assert_eq!(aggregates[0].total_weight, 0);
        assert_eq!(aggregates[0].participant_count, 1);
    }
}
