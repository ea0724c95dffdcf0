//! # Document Search
//!
//! A document ingestion and retrieval-augmented search service.
//!
//! Users upload documents through the HTTP API; the service stores the raw
//! file, extracts its text via a remote extraction service, chunks and
//! embeds the text, and writes the vectors into a vector store. Search
//! requests embed the query, retrieve the most similar chunks from the
//! caller's accessible documents, and optionally synthesize an answer with
//! an LLM. Every query records its token usage for billing.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────┐   ┌──────────────┐
//! │  Upload   │──▶│  Job Queue    │──▶│   Ingestion   │
//! │  (HTTP)   │   │  (SQLite)     │   │ Extract+Embed │
//! └──────────┘   └───────────────┘   └──────┬───────┘
//!                                           │
//!                                           ▼
//! ┌──────────┐   ┌───────────────┐   ┌──────────────┐
//! │  Search   │──▶│  Retrieval    │──▶│ Vector Store  │
//! │  (HTTP)   │   │ Embed+Filter  │   │ Qdrant/Memory │
//! └──────────┘   └───────────────┘   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`blob`] | Raw document file storage |
//! | [`extract`] | Remote text extraction client |
//! | [`chunk`] | Text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`llm`] | Answer generation provider abstraction |
//! | [`store`] | Vector store adapter (Qdrant and in-memory) |
//! | [`documents`] | Document lifecycle and access scoping |
//! | [`catalog`] | Model and prompt catalog queries |
//! | [`ingest`] | The ingestion pipeline |
//! | [`jobs`] | Background job queue and retry policy |
//! | [`search`] | Quick search and nodes search pipelines |
//! | [`usage`] | Token usage accounting |
//! | [`server`] | HTTP API server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod blob;
pub mod catalog;
pub mod chunk;
pub mod config;
pub mod db;
pub mod documents;
pub mod embedding;
pub mod extract;
pub mod ingest;
pub mod jobs;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod search;
pub mod server;
pub mod store;
pub mod usage;
