//! # ZeRag
//!
//! Retrieval-augmented question answering over relational databases,
//! document collections and web pages.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────────┐   ┌──────────────┐
//! │  Connectors  │──▶│      Sync      │──▶│    SQLite    │
//! │ SQL/File/Web │   │ Chunk + Embed  │   │ chunks + vec │
//! └──────────────┘   └────────────────┘   └──────┬───────┘
//!                                                │
//!           ┌────────────────────────────────────┤
//!           ▼                                    ▼
//!   ┌───────────────┐   rewrite ─▶ vector ║ keyword ║ hyde ─▶ fuse
//!   │   Pipeline    │──▶                   ─▶ [SQL fallback] ─▶ generate
//!   └───────┬───────┘
//!           ▼
//!   ┌───────────────┐
//!   │ HTTP / SSE /  │
//!   │     CLI       │
//!   └───────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`logging`] | Tracing subscriber setup |
//! | [`db`] / [`migrate`] | SQLite connection and schema |
//! | [`sqlite_store`] | SQLite implementation of the store |
//! | [`traits`] | Connector trait and factory |
//! | [`connector_relational`] | MySQL / PostgreSQL / SQLite sources |
//! | [`connector_file`] | File collections |
//! | [`connector_web`] | Web page collections |
//! | [`extract`] | Text extraction from PDF / DOCX / PPTX |
//! | [`embedding`] | Embedding providers and query cache |
//! | [`llm`] | Chat completion client |
//! | [`rewrite`] | Query rewriting, keywords, HyDE |
//! | [`keyword_index`] | Cached per-source BM25 indexes |
//! | [`retrieval`] | Multi-strategy retrieval and fusion |
//! | [`sql_fallback`] | Read-only keyword search against relational sources |
//! | [`pipeline`] | Question answering, streaming and cancellation |
//! | [`sync`] | Sync orchestration |
//! | [`progress`] | Terminal sync progress |
//! | [`services`] | Process-wide service wiring |
//! | [`server`] | HTTP API |

pub mod commands;
pub mod config;
pub mod connector_file;
pub mod connector_relational;
pub mod connector_web;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod keyword_index;
pub mod llm;
pub mod logging;
pub mod migrate;
pub mod pipeline;
pub mod progress;
pub mod retrieval;
pub mod rewrite;
pub mod server;
pub mod services;
pub mod sources;
pub mod sql_fallback;
pub mod sqlite_store;
pub mod sync;
pub mod traits;
