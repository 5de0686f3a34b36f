//! # ragpipe
//!
//! A retrieval-augmented generation engine with multi-capability request
//! routing.
//!
//! ragpipe ingests documents into a local vector index (chunking,
//! embedding, cosine retrieval over SQLite or memory) and routes incoming
//! requests across six execution paths: plain/RAG chat, PDF-native
//! analysis, schema-constrained extraction, tool-based code execution,
//! URL-grounded analysis, and file-search stores.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌─────────────┐
//! │  Intake   │──▶│   Pipeline    │──▶│ VectorIndex  │
//! │ files/PDF │   │ chunk+embed  │   │ sqlite/mem  │
//! └───────────┘   └──────────────┘   └──────┬──────┘
//!                                           │
//!            ┌──────────┐   ┌───────────┐   │
//! request ──▶│  Router   │──▶│ Retriever │◀──┘
//!            │ 6 paths  │   └───────────┘
//!            └────┬─────┘
//!                 ▼
//!         ┌──────────────┐   ┌───────────┐
//!         │   Backend     │──▶│  Stream    │──▶ caller
//!         │ generate/SSE │   │ assembler │
//!         └──────────────┘   └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! rag init                          # create database
//! rag ingest ./docs                 # chunk, embed, index
//! rag chat "how do I deploy?" --rag # grounded streaming answer
//! rag extract --schema recipe --text "..."
//! rag store create contracts
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`chunk`] | Overlap-aware text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Vector index trait and memory backend |
//! | [`index_sqlite`] | SQLite vector index |
//! | [`ingest`] | Ingestion pipeline |
//! | [`intake`] | Filesystem scanning and bundle splitting |
//! | [`retrieve`] | Context retrieval and budget packing |
//! | [`generate`] | Generative backend and wire codec |
//! | [`router`] | Capability classification and dispatch |
//! | [`cache`] | Single-flight response cache |
//! | [`stream`] | Streaming relay with cancellation |
//! | [`store_mgr`] | File-search store management |
//! | [`schemas`] | Built-in extraction schemas |
//! | [`engine`] | Facade wiring everything together |

pub mod cache;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod generate;
pub mod index;
pub mod index_sqlite;
pub mod ingest;
pub mod intake;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod retrieve;
pub mod router;
pub mod schemas;
pub mod store_mgr;
pub mod stream;
