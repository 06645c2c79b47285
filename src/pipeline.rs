//! Question answering pipeline.
//!
//! ```text
//! AskRequest ─▶ validate ─▶ rewrite ─▶ retrieve ─▶ [sql fallback] ─▶ generate
//!                                                                       │
//!      AnswerStream ◀── retrieval_done, token*, done | error ◀──────────┘
//! ```
//!
//! Every request runs in a producer task that writes [`StreamEvent`]s to
//! a channel. The streaming surface hands that channel to the caller as
//! an [`AnswerStream`]; the single-shot surface ([`Pipeline::ask`]) drains
//! the very same stream, so both produce the same answer.
//!
//! Chat mode skips retrieval and emits no `retrieval_done` event.

use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use zerag_core::models::{DataSource, Origin, PipelineStep, RetrievedFragment};
use zerag_core::store::Store;

use crate::config::{Config, KeywordMethod, RetrievalConfig};
use crate::embedding::EmbeddingService;
use crate::error::{RagError, RagResult};
use crate::llm::{ChatMessage, LanguageModel};
use crate::keyword_index::KeywordIndex;
use crate::retrieval::{EmbeddingReranker, RetrievalEngine, RetrievalRequest};
use crate::rewrite::{lexical_keywords, QueryRewriter, Rewrite};
use crate::sql_fallback::SqlFallback;

pub const MAX_TOP_K: usize = 50;
pub const RAG_HISTORY_TURNS: usize = 10;
pub const CHAT_HISTORY_TURNS: usize = 20;

// ============ Request / Response ============

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AskMode {
    #[default]
    Rag,
    Chat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: String,
    pub content: String,
}

/// Per-request switches can only narrow what the configuration enables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AskRequest {
    pub question: String,
    #[serde(default)]
    pub mode: AskMode,
    #[serde(default)]
    pub data_source_id: Option<i64>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub enable_rewrite: Option<bool>,
    #[serde(default)]
    pub enable_hyde: Option<bool>,
    #[serde(default)]
    pub enable_sql_fallback: Option<bool>,
    #[serde(default)]
    pub conversation_history: Vec<ConversationTurn>,
}

impl AskRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskResponse {
    pub answer: String,
    pub retrieved_chunks: Vec<RetrievedFragment>,
    pub pipeline_log: Vec<PipelineStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    RetrievalDone {
        chunks: Vec<RetrievedFragment>,
        pipeline_log: Vec<PipelineStep>,
    },
    Token {
        content: String,
    },
    Done {
        answer: String,
    },
    Error {
        message: String,
    },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }
}

// ============ Answer stream ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnswerStatus {
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerOutcome {
    /// Final answer, or the tokens delivered before cancellation or failure.
    pub answer: String,
    pub status: AnswerStatus,
}

/// Consumer side of one answer.
///
/// Yields events until a terminal one or until [`cancel`](Self::cancel);
/// nothing is yielded after either. Dropping the stream cancels the
/// producer, which drops the model call.
pub struct AnswerStream {
    rx: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
    delivered: String,
    status: Option<AnswerStatus>,
}

impl AnswerStream {
    fn new(rx: mpsc::Receiver<StreamEvent>, cancel: CancellationToken) -> Self {
        Self {
            rx,
            cancel,
            delivered: String::new(),
            status: None,
        }
    }

    pub async fn next(&mut self) -> Option<StreamEvent> {
        std::future::poll_fn(|cx| self.poll_event(cx)).await
    }

    /// Stop generation. The answer is whatever was delivered so far.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        if self.status.is_none() {
            self.status = Some(AnswerStatus::Cancelled);
        }
    }

    /// Token text delivered so far.
    pub fn answer(&self) -> &str {
        &self.delivered
    }

    /// A token that cancels this stream from elsewhere, e.g. on client
    /// disconnect.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drain remaining events and report how the answer ended.
    pub async fn finish(mut self) -> AnswerOutcome {
        while self.next().await.is_some() {}
        AnswerOutcome {
            answer: self.delivered.clone(),
            status: self.status.unwrap_or(AnswerStatus::Failed),
        }
    }

    fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        if self.status.is_some() {
            return Poll::Ready(None);
        }
        if self.cancel.is_cancelled() {
            self.status = Some(AnswerStatus::Cancelled);
            return Poll::Ready(None);
        }
        let event = match ready!(self.rx.poll_recv(cx)) {
            Some(event) => event,
            // Producer vanished without a terminal event.
            None => StreamEvent::Error {
                message: "answer stream ended unexpectedly".into(),
            },
        };
        match &event {
            StreamEvent::Token { content } => self.delivered.push_str(content),
            StreamEvent::Done { answer } => {
                self.delivered = answer.clone();
                self.status = Some(AnswerStatus::Completed);
            }
            StreamEvent::Error { .. } => self.status = Some(AnswerStatus::Failed),
            StreamEvent::RetrievalDone { .. } => {}
        }
        Poll::Ready(Some(event))
    }
}

impl Stream for AnswerStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        self.get_mut().poll_event(cx)
    }
}

impl Drop for AnswerStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ============ Prompting ============

const RAG_PROMPT: &str = "You answer questions using only the context below. \
If the context does not contain the answer, say that you don't know. \
Cite fragments by their [n] number when you use them. \
Answer in the language of the question.";

const CHAT_PROMPT: &str = "You are a helpful assistant. Answer concisely.";

const NO_CONTEXT: &str = "No relevant context was found.";

/// Assemble the context block. Retrieved fragments are numbered for
/// citation; SQL rows follow in their own list. Stops adding entries once
/// `max_chars` would be exceeded.
pub fn build_context(fragments: &[RetrievedFragment], max_chars: usize) -> String {
    let (rows, docs): (Vec<&RetrievedFragment>, Vec<&RetrievedFragment>) =
        fragments.iter().partition(|f| f.origin == Origin::Sql);
    let mut out = String::new();

    for (i, f) in docs.iter().enumerate() {
        let cite = match &f.row_id {
            Some(row) => format!("{} #{}", f.table_name, row),
            None => f.table_name.clone(),
        };
        let entry = format!("[{}] ({}) {}\n\n", i + 1, cite, f.chunk_text.trim());
        if !push_bounded(&mut out, &entry, max_chars) {
            return out.trim_end().to_string();
        }
    }

    if !rows.is_empty() && push_bounded(&mut out, "Database rows:\n", max_chars) {
        for r in rows {
            if !push_bounded(&mut out, &format!("- {}\n", r.chunk_text.trim()), max_chars) {
                break;
            }
        }
    }
    out.trim_end().to_string()
}

fn push_bounded(out: &mut String, entry: &str, max_chars: usize) -> bool {
    let used = out.chars().count();
    if used + entry.chars().count() <= max_chars {
        out.push_str(entry);
        return true;
    }
    if used == 0 {
        out.extend(entry.chars().take(max_chars));
    }
    false
}

/// Last `max_turns` user/assistant turns with content, as chat messages.
pub fn trim_history(turns: &[ConversationTurn], max_turns: usize) -> Vec<ChatMessage> {
    let kept: Vec<ChatMessage> = turns
        .iter()
        .filter(|t| !t.content.trim().is_empty())
        .filter_map(|t| match t.role.as_str() {
            "user" => Some(ChatMessage::user(t.content.clone())),
            "assistant" => Some(ChatMessage::assistant(t.content.clone())),
            _ => None,
        })
        .collect();
    let skip = kept.len().saturating_sub(max_turns);
    kept.into_iter().skip(skip).collect()
}

// ============ Pipeline ============

/// A request after validation, with every switch resolved.
struct Plan {
    question: String,
    mode: AskMode,
    source: Option<DataSource>,
    top_k: usize,
    rewrite: bool,
    hyde: bool,
    sql_fallback: bool,
    history: Vec<ConversationTurn>,
}

struct Prepared {
    messages: Vec<ChatMessage>,
    fragments: Vec<RetrievedFragment>,
    steps: Vec<PipelineStep>,
}

#[derive(Clone)]
pub struct Pipeline {
    store: Arc<dyn Store>,
    retrieval: Arc<RetrievalEngine>,
    rewriter: Arc<QueryRewriter>,
    model: Arc<dyn LanguageModel>,
    fallback: Arc<SqlFallback>,
    config: RetrievalConfig,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        store: Arc<dyn Store>,
        embeddings: Arc<EmbeddingService>,
        model: Arc<dyn LanguageModel>,
    ) -> Self {
        let keyword_index = Arc::new(KeywordIndex::new(
            store.clone(),
            config.retrieval.bm25_index_capacity,
        ));
        Self::with_keyword_index(config, store, embeddings, model, keyword_index)
    }

    /// Like [`Pipeline::new`], searching BM25 indexes owned elsewhere.
    pub fn with_keyword_index(
        config: &Config,
        store: Arc<dyn Store>,
        embeddings: Arc<EmbeddingService>,
        model: Arc<dyn LanguageModel>,
        keyword_index: Arc<KeywordIndex>,
    ) -> Self {
        let mut engine = RetrievalEngine::new(
            store.clone(),
            embeddings.clone(),
            model.clone(),
            config.retrieval.clone(),
        )
        .with_keyword_index(keyword_index);
        if config.retrieval.rerank {
            engine = engine.with_reranker(Arc::new(EmbeddingReranker::new(embeddings)));
        }
        Self {
            store,
            retrieval: Arc::new(engine),
            rewriter: Arc::new(QueryRewriter::new(
                model.clone(),
                config.retrieval.max_keywords,
            )),
            model,
            fallback: Arc::new(SqlFallback::new(
                config.sync.clone(),
                config.retrieval.max_keywords,
            )),
            config: config.retrieval.clone(),
        }
    }

    /// Answer in one response. Fails with [`RagError::Generation`] when
    /// the stream ends in an `error` event.
    pub async fn ask(&self, req: AskRequest) -> RagResult<AskResponse> {
        let mut stream = self.ask_stream(req).await?;
        let mut chunks = Vec::new();
        let mut log = Vec::new();
        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::RetrievalDone {
                    chunks: c,
                    pipeline_log,
                } => {
                    chunks = c;
                    log = pipeline_log;
                }
                StreamEvent::Token { .. } => {}
                StreamEvent::Done { answer } => {
                    return Ok(AskResponse {
                        answer,
                        retrieved_chunks: chunks,
                        pipeline_log: log,
                    })
                }
                StreamEvent::Error { message } => return Err(RagError::Generation(message)),
            }
        }
        Err(RagError::Generation("answer stream ended without a result".into()))
    }

    /// Validate the request and start answering. Validation failures are
    /// returned here; everything later arrives as events.
    pub async fn ask_stream(&self, req: AskRequest) -> RagResult<AnswerStream> {
        let plan = self.plan(req).await?;
        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let span = tracing::info_span!(
            "ask",
            request_id = %uuid::Uuid::new_v4(),
            mode = ?plan.mode,
            data_source_id = ?plan.source.as_ref().map(|s| s.id),
        );
        let this = self.clone();
        let token = cancel.clone();
        tokio::spawn(async move { this.produce(plan, tx, token).await }.instrument(span));

        Ok(AnswerStream::new(rx, cancel))
    }

    async fn plan(&self, req: AskRequest) -> RagResult<Plan> {
        let question = req.question.trim().to_string();
        if question.is_empty() {
            return Err(RagError::validation("question must not be empty"));
        }
        let top_k = req.top_k.unwrap_or(self.config.top_k);
        if !(1..=MAX_TOP_K).contains(&top_k) {
            return Err(RagError::validation(format!(
                "top_k must be between 1 and {}",
                MAX_TOP_K
            )));
        }
        let source = match req.data_source_id {
            Some(id) => Some(
                self.store
                    .get_data_source(id)
                    .await?
                    .ok_or(RagError::UnknownDataSource(id))?,
            ),
            None => None,
        };

        Ok(Plan {
            question,
            mode: req.mode,
            source,
            top_k,
            rewrite: self.config.enable_rewrite && req.enable_rewrite.unwrap_or(true),
            hyde: self.config.enable_hyde && req.enable_hyde.unwrap_or(true),
            sql_fallback: self.config.enable_sql_fallback
                && req.enable_sql_fallback.unwrap_or(true),
            history: req.conversation_history,
        })
    }

    async fn produce(self, plan: Plan, tx: mpsc::Sender<StreamEvent>, cancel: CancellationToken) {
        let messages = match plan.mode {
            AskMode::Chat => {
                let mut messages = vec![ChatMessage::system(CHAT_PROMPT)];
                messages.extend(trim_history(&plan.history, CHAT_HISTORY_TURNS));
                messages.push(ChatMessage::user(plan.question.clone()));
                messages
            }
            AskMode::Rag => {
                let prepared = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    prepared = self.prepare(&plan) => prepared,
                };
                tracing::info!(
                    fragments = prepared.fragments.len(),
                    steps = prepared.steps.len(),
                    "retrieval done"
                );
                let event = StreamEvent::RetrievalDone {
                    chunks: prepared.fragments,
                    pipeline_log: prepared.steps,
                };
                if !emit(&tx, &cancel, event).await {
                    return;
                }
                prepared.messages
            }
        };

        let started = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            started = self.model.stream(&messages) => started,
        };
        let mut tokens = match started {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::warn!(error = %e, "answer generation failed to start");
                emit(&tx, &cancel, StreamEvent::Error { message: e.to_string() }).await;
                return;
            }
        };

        let mut answer = String::new();
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(chars = answer.len(), "answer cancelled");
                    return;
                }
                item = tokens.recv() => item,
            };
            match item {
                Some(Ok(token)) => {
                    answer.push_str(&token);
                    if !emit(&tx, &cancel, StreamEvent::Token { content: token }).await {
                        return;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "answer generation failed");
                    emit(&tx, &cancel, StreamEvent::Error { message: e.to_string() }).await;
                    return;
                }
                None => {
                    tracing::info!(chars = answer.len(), "answer complete");
                    emit(&tx, &cancel, StreamEvent::Done { answer }).await;
                    return;
                }
            }
        }
    }

    /// Rewrite, retrieve and optionally fall back to SQL. Never fails:
    /// each degraded stage leaves an `error` in its pipeline step.
    async fn prepare(&self, plan: &Plan) -> Prepared {
        let mut steps = Vec::new();
        let max_keywords = self.config.max_keywords;

        let step = PipelineStep::new("query_rewrite");
        let (rewrite, step) = if plan.rewrite {
            match self.rewriter.rewrite(&plan.question).await {
                Ok(rw) => {
                    let step = step
                        .with("queries", serde_json::json!(rw.queries))
                        .with("fallback", rw.fallback);
                    (rw, step)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "query rewrite failed, using lexical keywords");
                    let step = step.with("error", e.to_string()).with("fallback", true);
                    (Rewrite::lexical(&plan.question, max_keywords), step)
                }
            }
        } else {
            (
                Rewrite::lexical(&plan.question, max_keywords),
                step.with("enabled", false),
            )
        };
        let keywords = match self.config.keyword_method {
            KeywordMethod::Rewrite => rewrite.keywords.clone(),
            KeywordMethod::Lexical => lexical_keywords(&plan.question, max_keywords),
        };
        steps.push(step.with("keywords", serde_json::json!(keywords)));

        let outcome = self
            .retrieval
            .retrieve(&RetrievalRequest {
                question: plan.question.clone(),
                scope: plan.source.as_ref().map(|s| s.id),
                top_k: plan.top_k,
                keywords: keywords.clone(),
                query_variants: rewrite.queries.clone(),
                use_hyde: plan.hyde,
                hyde_hint: rewrite.hyde_hint.clone(),
            })
            .await;
        steps.extend(outcome.steps);
        let mut fragments = outcome.fragments;

        let relational = plan.source.as_ref().filter(|s| s.kind.is_relational());
        if let Some(source) = relational {
            let threshold = self.config.similarity_threshold;
            if plan.sql_fallback && outcome.max_similarity < threshold {
                tracing::info!(
                    max_similarity = outcome.max_similarity,
                    threshold,
                    "weak retrieval, trying sql fallback"
                );
                steps.push(
                    PipelineStep::new("sql_fallback")
                        .with(
                            "reason",
                            format!(
                                "max similarity {:.3} below threshold {:.3}",
                                outcome.max_similarity, threshold
                            ),
                        )
                        .with("max_similarity", outcome.max_similarity)
                        .with("threshold", threshold),
                );
                let result = PipelineStep::new("sql_fallback_result");
                match self.fallback.attempt(&plan.question, &keywords, source).await {
                    Ok(rows) => {
                        steps.push(result.with("rows", rows.len()));
                        fragments.extend(rows);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "sql fallback failed");
                        steps.push(result.with("error", e.to_string()));
                    }
                }
            }
        }

        let context = if fragments.is_empty() {
            NO_CONTEXT.to_string()
        } else {
            build_context(&fragments, self.config.context_max_chars)
        };
        let history = trim_history(&plan.history, RAG_HISTORY_TURNS);

        steps.push(
            PipelineStep::new("generate")
                .with("model", self.model.model_name())
                .with("fragments", fragments.len())
                .with("history_turns", history.len())
                .with("context_chars", context.chars().count()),
        );

        let mut messages = vec![ChatMessage::system(format!(
            "{}\n\nContext:\n{}",
            RAG_PROMPT, context
        ))];
        messages.extend(history);
        messages.push(ChatMessage::user(plan.question.clone()));

        Prepared {
            messages,
            fragments,
            steps,
        }
    }
}

/// Send unless cancelled. `false` means the consumer is gone.
async fn emit(tx: &mpsc::Sender<StreamEvent>, cancel: &CancellationToken, event: StreamEvent) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashProvider;
    use crate::llm::TokenStream;
    use async_trait::async_trait;
    use futures::StreamExt;
    use zerag_core::models::{ConnectionParams, NewDataSource, SourceKind};
    use zerag_core::store::memory::InMemoryStore;

    struct Scripted {
        tokens: Vec<&'static str>,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl LanguageModel for Scripted {
        fn model_name(&self) -> &str {
            "scripted"
        }
        async fn complete(&self, _m: &[ChatMessage]) -> RagResult<String> {
            Ok("not json".into())
        }
        async fn stream(&self, _m: &[ChatMessage]) -> RagResult<TokenStream> {
            let (tx, rx) = mpsc::channel(4);
            let tokens = self.tokens.clone();
            let fail_after = self.fail_after;
            tokio::spawn(async move {
                for (i, t) in tokens.into_iter().enumerate() {
                    if fail_after == Some(i) {
                        let _ = tx.send(Err(RagError::Generation("upstream reset".into()))).await;
                        return;
                    }
                    if tx.send(Ok(t.to_string())).await.is_err() {
                        return;
                    }
                }
            });
            Ok(rx)
        }
    }

    fn pipeline(model: Scripted) -> (Pipeline, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let embeddings = Arc::new(EmbeddingService::new(Arc::new(HashProvider::new(32)), 8, 0));
        let p = Pipeline::new(&Config::minimal(), store.clone(), embeddings, Arc::new(model));
        (p, store)
    }

    fn frag(text: &str, origin: Origin, row: Option<&str>) -> RetrievedFragment {
        RetrievedFragment {
            chunk_id: None,
            chunk_text: text.into(),
            table_name: "orders".into(),
            row_id: row.map(str::to_string),
            similarity: 0.5,
            origin,
            rerank_score: None,
        }
    }

    #[test]
    fn context_numbers_fragments_and_lists_rows() {
        let ctx = build_context(
            &[
                frag("first", Origin::Vector, Some("3")),
                frag("row text", Origin::Sql, Some("9")),
                frag("second", Origin::Keyword, None),
            ],
            1000,
        );
        assert_eq!(
            ctx,
            "[1] (orders #3) first\n\n[2] (orders) second\n\nDatabase rows:\n- row text"
        );
        assert_eq!(build_context(&[frag("abcdefghij", Origin::Vector, None)], 8).chars().count(), 8);
    }

    #[test]
    fn history_keeps_recent_conversational_turns() {
        let turns: Vec<ConversationTurn> = (0..14)
            .map(|i| ConversationTurn {
                role: if i % 2 == 0 { "user" } else { "assistant" }.into(),
                content: format!("turn {}", i),
            })
            .chain([
                ConversationTurn {
                    role: "system".into(),
                    content: "ignored".into(),
                },
                ConversationTurn {
                    role: "user".into(),
                    content: "  ".into(),
                },
            ])
            .collect();
        let kept = trim_history(&turns, RAG_HISTORY_TURNS);
        assert_eq!(kept.len(), 10);
        assert_eq!(kept[0].content, "turn 4");
        assert_eq!(kept[9].content, "turn 13");
    }

    #[tokio::test]
    async fn validation_happens_before_streaming() {
        let (p, _) = pipeline(Scripted {
            tokens: vec![],
            fail_after: None,
        });
        assert!(matches!(
            p.ask_stream(AskRequest::new("   ")).await,
            Err(RagError::Validation(_))
        ));
        let mut req = AskRequest::new("hi");
        req.top_k = Some(51);
        assert!(matches!(p.ask(req).await, Err(RagError::Validation(_))));
        let mut req = AskRequest::new("hi");
        req.data_source_id = Some(99);
        assert!(matches!(
            p.ask(req).await,
            Err(RagError::UnknownDataSource(99))
        ));
    }

    #[tokio::test]
    async fn rag_stream_orders_events() {
        let (p, store) = pipeline(Scripted {
            tokens: vec!["Thirty ", "days."],
            fail_after: None,
        });
        let ds = store
            .create_data_source(&NewDataSource {
                name: "kb".into(),
                kind: SourceKind::File,
                connection: ConnectionParams::default(),
                chunk_strategy: None,
            })
            .await
            .unwrap();
        let mut req = AskRequest::new("What is the refund policy?");
        req.data_source_id = Some(ds.id);

        let events: Vec<StreamEvent> = p.ask_stream(req).await.unwrap().collect().await;
        assert_eq!(events.len(), 4);
        match &events[0] {
            StreamEvent::RetrievalDone { pipeline_log, .. } => {
                assert_eq!(pipeline_log[0].step, "query_rewrite");
                assert_eq!(pipeline_log.last().unwrap().step, "generate");
            }
            other => panic!("unexpected first event {:?}", other),
        }
        assert_eq!(
            events[3],
            StreamEvent::Done {
                answer: "Thirty days.".into()
            }
        );
    }

    #[tokio::test]
    async fn chat_mode_skips_retrieval() {
        let (p, _) = pipeline(Scripted {
            tokens: vec!["Hello"],
            fail_after: None,
        });
        let mut req = AskRequest::new("hi");
        req.mode = AskMode::Chat;
        let mut stream = p.ask_stream(req).await.unwrap();
        assert_eq!(
            stream.next().await,
            Some(StreamEvent::Token {
                content: "Hello".into()
            })
        );
        let outcome = stream.finish().await;
        assert_eq!(outcome.status, AnswerStatus::Completed);
        assert_eq!(outcome.answer, "Hello");
    }

    #[tokio::test]
    async fn mid_stream_failure_is_terminal_error() {
        let (p, _) = pipeline(Scripted {
            tokens: vec!["a", "b", "c"],
            fail_after: Some(2),
        });
        let mut req = AskRequest::new("hi");
        req.mode = AskMode::Chat;
        let mut stream = p.ask_stream(req).await.unwrap();
        let mut last = None;
        while let Some(ev) = stream.next().await {
            last = Some(ev);
        }
        assert!(matches!(last, Some(StreamEvent::Error { .. })));
        assert_eq!(stream.answer(), "ab");
        assert!(stream.next().await.is_none());

        let mut req = AskRequest::new("hi");
        req.mode = AskMode::Chat;
        assert!(matches!(p.ask(req).await, Err(RagError::Generation(_))));
    }
}
