//! # Pictor
//!
//! A media ingestion and synchronization engine with AI-powered retrieval.
//!
//! Pictor stores images content-addressed (SHA-256) across a set of storage
//! endpoints (local directories, S3-compatible buckets), keeps backups
//! eventually consistent through a background synchronizer, runs every new
//! image through a vision model for tags and a description, embeds the
//! description, and answers semantic nearest-neighbor queries from an
//! in-process vector index.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────┐   ┌──────────────┐   ┌───────────────┐
//! │ Ingest  │──▶│ ContentStore │──▶│ Endpoints      │
//! │ (bytes) │   │ SHA-256 dedup│   │ local / S3     │
//! └────┬────┘   └──────────────┘   └──────┬────────┘
//!      │ enqueue                          │ pending replicas
//!      ▼                                  ▼
//! ┌──────────────┐                 ┌──────────────┐
//! │ Task queue   │                 │ Synchronizer │
//! │ (SQLite)     │                 │ backoff+retry│
//! └────┬─────────┘                 └──────────────┘
//!      │ workers
//!      ▼
//! ┌──────────────┐   ┌───────────┐   ┌──────────────┐
//! │ Vision model │──▶│ Embedding │──▶│ VectorIndex  │
//! │ tags + desc  │   │ provider  │   │ (in-memory)  │
//! └──────────────┘   └───────────┘   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types |
//! | [`store`] | Content-addressed storage over the endpoint set |
//! | [`endpoint`] | Storage backend trait and endpoint resolution |
//! | [`sync`] | Backup synchronization and reconciliation |
//! | [`pipeline`] | Durable analysis task queue and worker pool |
//! | [`vision`] | Vision model providers |
//! | [`embedding`] | Embedding providers and vector codecs |
//! | [`index`] | In-memory nearest-neighbor index |
//! | [`engine`] | Orchestrator tying everything together |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod db;
pub mod embedding;
pub mod endpoint;
pub mod endpoint_local;
pub mod endpoint_s3;
pub mod engine;
pub mod errors;
pub mod index;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod store;
pub mod sync;
pub mod vision;
