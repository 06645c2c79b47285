//! # ZeRag Core
//!
//! Runtime-independent logic for ZeRag: data models, chunking strategies,
//! the store abstraction, BM25 ranking, result fusion, and the embedding
//! trait.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem I/O. The
//! `zerag` app crate supplies concrete stores, providers, and connectors.

pub mod bm25;
pub mod chunk;
pub mod embedding;
pub mod fusion;
pub mod models;
pub mod store;
