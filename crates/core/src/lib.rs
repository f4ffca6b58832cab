//! # Inferwatch Core
//!
//! Domain types and pure logic for the inference chain cache.
//!
//! This crate has no I/O. It provides the building blocks shared by the
//! indexer and the HTTP API:
//!
//! - **Types**: epochs, participant snapshots, inference records, rewards,
//!   validator jail state, node health
//! - **Epoch repair**: recovering the true epoch of inference records the
//!   chain reports under epoch 0
//! - **Inference grouping**: categorized, bounded, timestamp-descending lists
//! - **Model aggregation**: total weight and participant count per model
//! - **Warm keys**: authz grants reduced to fully authorized grantees
//! - **Addresses**: bech32 prefix conversion and consensus addresses

#![warn(missing_docs)]

pub mod address;
pub mod aggregate;
pub mod authz;
pub mod constants;
pub mod de;
pub mod epoch;
pub mod error;
pub mod inference;
pub mod types;

pub use aggregate::{aggregate_models, pair_model_weights, Pairing};
pub use authz::{derive_warm_keys, Grant};
pub use constants::*;
pub use epoch::{settlement_height, EpochWindow};
pub use error::{CoreError, Result};
pub use inference::{
    group_inferences, parse_inference, CategorizedInferences, InferenceGrouping,
    UpstreamInference,
};
pub use types::*;
