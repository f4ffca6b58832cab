//! Sync engine, cache store and read service for inferwatch.
//!
//! This crate provides:
//! - An upstream client for the inference chain's public query API
//! - A SQLite cache of epoch snapshots, rewards, auxiliary records,
//!   inference lists, jail status and node health
//! - The sync engine: scheduled pollers, proactive warm, inline fallback
//! - The read service consumed by the HTTP surface
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │  inferwatch-indexer (this)         │
//! │                                    │
//! │  ┌──────────────┐                  │
//! │  │  ChainApi    │ ← chain-api, node /health, keybase
//! │  └──────┬───────┘                  │
//! │         │                          │
//! │  ┌──────▼───────┐   ┌───────────┐  │
//! │  │  SyncEngine  │ ← │  pollers  │  │
//! │  │  (writer)    │   │  warm     │  │
//! │  └──────┬───────┘   └───────────┘  │
//! │         │                          │
//! │  ┌──────▼───────┐                  │
//! │  │   Storage    │ ← SQLite         │
//! │  └──────┬───────┘                  │
//! │         │                          │
//! │  ┌──────▼───────┐                  │
//! │  │ ReadService  │ → inline fallback│
//! │  └──────────────┘                  │
//! └─────────┬──────────────────────────┘
//!           │
//! ┌─────────▼──────────────────────────┐
//! │  inferwatch-api (axum routes)      │
//! └────────────────────────────────────┘
//! ```
//!
//! The engine is the only writer. Reads never fetch directly; on a miss they
//! ask the engine, which applies the same cache check and per-key lock as the
//! pollers.

#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod error;
pub mod service;
pub mod storage;
pub mod sync;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use client::{ChainApi, HttpChainClient};
pub use config::Config;
pub use error::{ServiceError, ServiceResult};
pub use service::ReadService;
pub use storage::Storage;
pub use sync::{spawn_pollers, EngineSettings, SyncEngine};
