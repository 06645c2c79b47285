//! TOML configuration.
//!
//! Every section except `[db]` is optional; omitted keys take the defaults
//! below. [`load_config`] parses and validates, [`Config::minimal`] gives a
//! usable in-code default.
//!
//! ```toml
//! [db]
//! path = "./data/zerag.sqlite"
//!
//! [chunking]
//! max_chars = 512
//! overlap_chars = 64
//!
//! [retrieval]
//! top_k = 5
//! similarity_threshold = 0.45
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [llm]
//! provider = "openai"
//! base_url = "https://api.openai.com/v1"
//! model = "gpt-4o-mini"
//!
//! [server]
//! bind = "127.0.0.1:8000"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use zerag_core::chunk::ChunkParams;
use zerag_core::models::ChunkStrategy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

// ============ Chunking ============

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,
    /// Strategy for file and web sources without an explicit one.
    #[serde(default = "default_file_strategy")]
    pub file_strategy: ChunkStrategy,
    /// Strategy for relational rows without an explicit one.
    #[serde(default = "default_row_strategy")]
    pub row_strategy: ChunkStrategy,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            overlap_chars: default_overlap_chars(),
            min_chars: default_min_chars(),
            file_strategy: default_file_strategy(),
            row_strategy: default_row_strategy(),
        }
    }
}

impl ChunkingConfig {
    pub fn params(&self) -> ChunkParams {
        ChunkParams {
            max_chars: self.max_chars,
            overlap_chars: self.overlap_chars,
            min_chars: self.min_chars,
        }
    }
}

fn default_max_chars() -> usize {
    512
}
fn default_overlap_chars() -> usize {
    64
}
fn default_min_chars() -> usize {
    40
}
fn default_file_strategy() -> ChunkStrategy {
    ChunkStrategy::Smart
}
fn default_row_strategy() -> ChunkStrategy {
    ChunkStrategy::Fixed
}

// ============ Retrieval ============

/// How salient keywords are pulled from a question.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KeywordMethod {
    /// Use the keywords returned by the query rewrite call, falling back
    /// to the lexical heuristic when rewrite is off or fails.
    Rewrite,
    /// Stopword-filtered tokens and phrase, no model call.
    Lexical,
}

/// How keyword hits are ranked.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KeywordRanking {
    /// Okapi BM25 over a per-source index when the request is scoped to a
    /// source; substring matching otherwise or if the index fails.
    Bm25,
    /// Substring matching, scored by the share of keywords found.
    Substring,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Below this max similarity, relational sources try SQL fallback.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    /// Each strategy fetches `top_k * candidate_multiplier` candidates.
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    #[serde(default = "default_keyword_method")]
    pub keyword_method: KeywordMethod,
    #[serde(default = "default_keyword_ranking")]
    pub keyword_ranking: KeywordRanking,
    /// Per-source BM25 indexes kept in memory.
    #[serde(default = "default_bm25_index_capacity")]
    pub bm25_index_capacity: usize,
    /// Proxy similarity of the best keyword hit.
    #[serde(default = "default_keyword_hit_score")]
    pub keyword_hit_score: f64,
    #[serde(default = "default_max_keywords")]
    pub max_keywords: usize,
    /// Extra rewritten queries searched alongside the primary one.
    #[serde(default = "default_max_query_variants")]
    pub max_query_variants: usize,
    #[serde(default = "default_context_max_chars")]
    pub context_max_chars: usize,
    #[serde(default)]
    pub rerank: bool,
    #[serde(default = "default_true")]
    pub enable_rewrite: bool,
    #[serde(default = "default_true")]
    pub enable_hyde: bool,
    #[serde(default = "default_true")]
    pub enable_sql_fallback: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            similarity_threshold: default_similarity_threshold(),
            candidate_multiplier: default_candidate_multiplier(),
            keyword_method: default_keyword_method(),
            keyword_ranking: default_keyword_ranking(),
            bm25_index_capacity: default_bm25_index_capacity(),
            keyword_hit_score: default_keyword_hit_score(),
            max_keywords: default_max_keywords(),
            max_query_variants: default_max_query_variants(),
            context_max_chars: default_context_max_chars(),
            rerank: false,
            enable_rewrite: true,
            enable_hyde: true,
            enable_sql_fallback: true,
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_similarity_threshold() -> f64 {
    0.45
}
fn default_candidate_multiplier() -> usize {
    3
}
fn default_keyword_method() -> KeywordMethod {
    KeywordMethod::Rewrite
}
fn default_keyword_ranking() -> KeywordRanking {
    KeywordRanking::Bm25
}
fn default_bm25_index_capacity() -> usize {
    64
}
fn default_keyword_hit_score() -> f64 {
    0.99
}
fn default_max_keywords() -> usize {
    5
}
fn default_max_query_variants() -> usize {
    2
}
fn default_context_max_chars() -> usize {
    6000
}
fn default_true() -> bool {
    true
}

// ============ Embedding ============

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `disabled`, `openai`, `ollama`, `local`, or `hash`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for `openai` (default `https://api.openai.com/v1`) or
    /// `ollama` (default `http://localhost:11434`).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Entries in the query-embedding cache; 0 disables it.
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            cache_size: default_cache_size(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_cache_size() -> usize {
    2000
}

// ============ LLM ============

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// `openai` (any OpenAI-compatible endpoint) or `disabled`.
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Longest silence between response bytes. One-shot completions also
    /// use it as a whole-request deadline; streams may run longer.
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_retries")]
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key_env: default_api_key_env(),
            temperature: default_temperature(),
            timeout_secs: default_llm_timeout_secs(),
            max_retries: default_llm_retries(),
        }
    }
}

fn default_llm_provider() -> String {
    "disabled".to_string()
}
fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_api_key_env() -> String {
    "LLM_API_KEY".to_string()
}
fn default_temperature() -> f32 {
    0.3
}
fn default_llm_timeout_secs() -> u64 {
    120
}
fn default_llm_retries() -> u32 {
    2
}

// ============ Sync ============

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Bound on any single connector call (connect, list, pull one unit).
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_max_rows_per_table")]
    pub max_rows_per_table: usize,
    /// Tables introspected when a relational source configures none.
    #[serde(default = "default_max_tables")]
    pub max_tables: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: default_fetch_timeout_secs(),
            max_rows_per_table: default_max_rows_per_table(),
            max_tables: default_max_tables(),
        }
    }
}

fn default_fetch_timeout_secs() -> u64 {
    30
}
fn default_max_rows_per_table() -> usize {
    10_000
}
fn default_max_tables() -> usize {
    20
}

// ============ Server ============

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

impl Config {
    /// Defaults with the database under `./data`. Embeddings and the
    /// language model are disabled.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from("./data/zerag.sqlite"),
            },
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            sync: SyncConfig::default(),
            server: ServerConfig::default(),
        }
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.chunking.max_chars == 0 {
            bail!("chunking.max_chars must be > 0");
        }
        if self.chunking.overlap_chars >= self.chunking.max_chars {
            bail!("chunking.overlap_chars must be smaller than chunking.max_chars");
        }

        if self.retrieval.top_k < 1 {
            bail!("retrieval.top_k must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.retrieval.similarity_threshold) {
            bail!("retrieval.similarity_threshold must be in [0.0, 1.0]");
        }
        if !(0.0..=1.0).contains(&self.retrieval.keyword_hit_score) {
            bail!("retrieval.keyword_hit_score must be in [0.0, 1.0]");
        }
        if self.retrieval.candidate_multiplier < 1 {
            bail!("retrieval.candidate_multiplier must be >= 1");
        }

        match self.embedding.provider.as_str() {
            "disabled" | "openai" | "ollama" | "local" | "hash" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, local, or hash.",
                other
            ),
        }
        if self.embedding.is_enabled() && self.embedding.provider != "local" {
            if self.embedding.dims.unwrap_or(0) == 0 {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    self.embedding.provider
                );
            }
            if self.embedding.model.is_none() && self.embedding.provider != "hash" {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    self.embedding.provider
                );
            }
        }
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }

        match self.llm.provider.as_str() {
            "disabled" | "openai" => {}
            other => bail!(
                "Unknown llm provider: '{}'. Must be disabled or openai.",
                other
            ),
        }

        if self.sync.fetch_timeout_secs == 0 {
            bail!("sync.fetch_timeout_secs must be > 0");
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_file_gets_defaults() {
        let cfg = parse_config("[db]\npath = \"/tmp/z.sqlite\"\n").unwrap();
        assert_eq!(cfg.chunking.max_chars, 512);
        assert_eq!(cfg.chunking.file_strategy, ChunkStrategy::Smart);
        assert_eq!(cfg.chunking.row_strategy, ChunkStrategy::Fixed);
        assert_eq!(cfg.retrieval.top_k, 5);
        assert!((cfg.retrieval.similarity_threshold - 0.45).abs() < 1e-9);
        assert_eq!(cfg.retrieval.keyword_method, KeywordMethod::Rewrite);
        assert!(!cfg.embedding.is_enabled());
        assert_eq!(cfg.server.bind, "127.0.0.1:8000");
    }

    #[test]
    fn rejects_overlap_not_below_max() {
        let err = parse_config(
            "[db]\npath = \"x\"\n[chunking]\nmax_chars = 100\noverlap_chars = 100\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("overlap_chars"));
    }

    #[test]
    fn rejects_threshold_out_of_range() {
        assert!(
            parse_config("[db]\npath = \"x\"\n[retrieval]\nsimilarity_threshold = 1.5\n").is_err()
        );
    }

    #[test]
    fn enabled_embedding_requires_dims() {
        let err = parse_config(
            "[db]\npath = \"x\"\n[embedding]\nprovider = \"openai\"\nmodel = \"m\"\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("dims"));

        let ok = parse_config("[db]\npath = \"x\"\n[embedding]\nprovider = \"hash\"\ndims = 64\n");
        assert!(ok.is_ok());
    }

    #[test]
    fn keyword_method_parses() {
        let cfg = parse_config("[db]\npath = \"x\"\n[retrieval]\nkeyword_method = \"lexical\"\n")
            .unwrap();
        assert_eq!(cfg.retrieval.keyword_method, KeywordMethod::Lexical);
    }

    #[test]
    fn unknown_provider_rejected() {
        assert!(parse_config("[db]\npath = \"x\"\n[llm]\nprovider = \"bard\"\n").is_err());
        assert!(Config::minimal().validate().is_ok());
    }
}
