//! Axum-based HTTP surface for inferwatch.
//!
//! This crate provides:
//! - `/v1/inference/current` - Current epoch summary
//! - `/v1/inference/epochs/:epoch_id` - Epoch summary, optionally at a height
//! - `/v1/participants/:id` - Participant detail (rewards, seed, warm keys, ML nodes)
//! - `/v1/participants/:id/inferences` - Recent categorized inferences
//! - `/v1/epochs/:epoch_id/total-rewards` - Settled reward total of a finished epoch
//! - `/v1/timeline` - Block timing and chain milestones
//! - `/v1/models/current`, `/v1/models/epochs/:epoch_id` - Model distribution

#![warn(missing_docs)]

/// API server runtime and in-process router builder.
pub mod server;

pub use server::{router, run_from_file, run_with_config};
