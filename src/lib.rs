//! # docgraph
//!
//! A multi-tenant document indexing, incremental-diff, and reference-graph
//! pipeline for retrieval backends.
//!
//! docgraph takes documents produced by source connectors (Slack, GitHub,
//! Notion, ...), decides via content hashing which ones actually changed,
//! re-embeds only the chunks whose text changed, and writes the results to
//! three stores — PostgreSQL, a full-text search index, and a vector store
//! — while keeping the corpus-wide reference graph (`referenced_docs` /
//! `referrers` maps and the derived `referrer_score`) consistent across
//! updates and deletions.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────────────────┐   ┌────────────────┐
//! │ Connectors │──▶│  prepare (concurrent)     │──▶│  embed (batch) │
//! │ (external) │   │ hash ▸ refs ▸ chunk ▸ diff│   └───────┬────────┘
//! └────────────┘   └──────────────────────────┘           │
//!                                          ┌──────────────┼──────────────┐
//!                                          ▼              ▼              ▼
//!                                    ┌──────────┐   ┌──────────┐   ┌──────────┐
//!                                    │ Postgres │   │  Search  │   │  Vector  │
//!                                    │ (txn +   │   │  index   │   │  store   │
//!                                    │  locks)  │   │ (bulk)   │   │ (diffed) │
//!                                    └──────────┘   └──────────┘   └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`sources`] | Source-document trait (connector seam) |
//! | [`chunk`] | Deterministic text chunking |
//! | [`hash`] | Content hashing and the skip check |
//! | [`diff`] | Chunk-level diffing |
//! | [`references`] | Reference-graph extraction, diffing, scoring |
//! | [`scoring`] | Blended relevance/recency/authority ranking |
//! | [`embedding`] | Embedding service client |
//! | [`prepare`] | Concurrent batch preparation |
//! | [`ingest`] | Top-level indexing pipeline |
//! | [`deletion`] | Document deletion with graph repair |
//! | [`jobs`] | Background indexing job queue |
//! | [`store`] | Storage traits and backends |
//! | [`registry`] | Tenant store registry |
//! | [`migrate`] | Schema migrations |

pub mod chunk;
pub mod config;
pub mod deletion;
pub mod diff;
pub mod embedding;
pub mod hash;
pub mod ingest;
pub mod jobs;
pub mod migrate;
pub mod models;
pub mod prepare;
pub mod references;
pub mod registry;
pub mod scoring;
pub mod sources;
pub mod store;
