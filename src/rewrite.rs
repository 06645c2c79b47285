//! Query rewriting, keyword extraction and HyDE passages.
//!
//! The rewriter asks the language model for a JSON object:
//!
//! ```json
//! { "keywords": ["refund policy", "refund"], "queries": ["refund rules"], "hyde_hint": "..." }
//! ```
//!
//! Output wrapped in a code fence or surrounded by prose is tolerated.
//! Anything unparseable falls back to [`lexical_keywords`].

use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::RagResult;
use crate::llm::{ChatMessage, LanguageModel};

const STOPWORDS: &[&str] = &[
    "a", "about", "all", "an", "and", "any", "are", "as", "at", "be", "been", "but", "by", "can",
    "could", "did", "do", "does", "for", "from", "get", "had", "has", "have", "how", "i", "if",
    "in", "into", "is", "it", "its", "list", "me", "much", "my", "of", "on", "or", "our",
    "please", "show", "so", "some", "tell", "than", "that", "the", "their", "them", "then",
    "there", "these", "they", "this", "to", "us", "was", "we", "were", "what", "when", "where",
    "which", "who", "whom", "why", "will", "with", "would", "you", "your",
    // German
    "auf", "bei", "das", "dem", "den", "der", "des", "die", "du", "ein", "eine", "einem", "einen",
    "einer", "es", "für", "ich", "ihr", "im", "ist", "mein", "meine", "mit", "nach", "nicht",
    "oder", "sie", "sind", "und", "von", "wann", "warum", "wer", "wie", "wir", "wo", "zu",
];

/// Salient search terms from a question without a model call.
///
/// Runs of two or more consecutive content words are kept as phrases
/// ("refund policy") ahead of the single words, but phrases take at most
/// half of `max` (rounded up). Tokens are lower-cased; stopwords and
/// one-character tokens are dropped. A run of CJK text has
/// no spaces and stays one term.
pub fn lexical_keywords(question: &str, max: usize) -> Vec<String> {
    let lower = question.to_lowercase();
    let mut phrases = Vec::new();
    let mut words = Vec::new();
    let mut run: Vec<&str> = Vec::new();

    fn close_run(run: &mut Vec<&str>, phrases: &mut Vec<String>) {
        if run.len() >= 2 {
            phrases.push(run.join(" "));
        }
        run.clear();
    }

    for token in lower.split(|c: char| !c.is_alphanumeric()) {
        if token.is_empty() {
            continue;
        }
        if token.chars().count() < 2 || STOPWORDS.contains(&token) {
            close_run(&mut run, &mut phrases);
            continue;
        }
        run.push(token);
        words.push(token.to_string());
    }
    close_run(&mut run, &mut phrases);

    let mut seen = HashSet::new();
    phrases.truncate(max.div_ceil(2));
    phrases
        .into_iter()
        .chain(words)
        .filter(|k| seen.insert(k.clone()))
        .take(max)
        .collect()
}

/// Result of a rewrite call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rewrite {
    pub keywords: Vec<String>,
    /// Alternative phrasings for extra vector searches.
    pub queries: Vec<String>,
    pub hyde_hint: Option<String>,
    /// True when the model output could not be used and the keywords came
    /// from [`lexical_keywords`].
    pub fallback: bool,
}

impl Rewrite {
    pub fn lexical(question: &str, max_keywords: usize) -> Self {
        Self {
            keywords: lexical_keywords(question, max_keywords),
            fallback: true,
            ..Default::default()
        }
    }
}

#[derive(Deserialize)]
struct RewriteJson {
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    queries: Vec<String>,
    #[serde(default)]
    hyde_hint: Option<String>,
}

const REWRITE_PROMPT: &str = "You prepare search queries for a retrieval system. \
Given a user question, reply with only a JSON object with the fields \
\"keywords\" (up to 5 short exact terms or phrases likely to appear verbatim in relevant text), \
\"queries\" (up to 2 alternative phrasings of the question), and \
\"hyde_hint\" (one sentence describing what a good answer would contain). \
Use the question's language.";

pub struct QueryRewriter {
    model: Arc<dyn LanguageModel>,
    max_keywords: usize,
}

impl QueryRewriter {
    pub fn new(model: Arc<dyn LanguageModel>, max_keywords: usize) -> Self {
        Self {
            model,
            max_keywords,
        }
    }

    /// Model errors propagate; malformed output does not.
    pub async fn rewrite(&self, question: &str) -> RagResult<Rewrite> {
        let reply = self
            .model
            .complete(&[
                ChatMessage::system(REWRITE_PROMPT),
                ChatMessage::user(question),
            ])
            .await?;
        Ok(parse_rewrite(&reply, question, self.max_keywords))
    }
}

fn strip_fences(text: &str) -> &str {
    let start = text.find('{');
    let end = text.rfind('}');
    match (start, end) {
        (Some(s), Some(e)) if e > s => &text[s..=e],
        _ => text.trim(),
    }
}

fn parse_rewrite(reply: &str, question: &str, max_keywords: usize) -> Rewrite {
    let parsed: RewriteJson = match serde_json::from_str(strip_fences(reply)) {
        Ok(p) => p,
        Err(e) => {
            tracing::debug!(error = %e, "rewrite output is not JSON, using lexical keywords");
            return Rewrite::lexical(question, max_keywords);
        }
    };

    let mut seen = HashSet::new();
    let mut keywords: Vec<String> = parsed
        .keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty() && seen.insert(k.clone()))
        .take(max_keywords)
        .collect();
    let fallback = keywords.is_empty();
    if fallback {
        keywords = lexical_keywords(question, max_keywords);
    }

    let queries = parsed
        .queries
        .iter()
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty() && !q.eq_ignore_ascii_case(question.trim()))
        .collect();

    Rewrite {
        keywords,
        queries,
        hyde_hint: parsed
            .hyde_hint
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty()),
        fallback,
    }
}

const HYDE_PROMPT: &str = "Write a short, factual-sounding passage (3 to 5 sentences) \
that directly answers the question, as it might appear in a document or database record. \
Do not mention that it is hypothetical.";

/// Synthesizes a hypothetical answer passage to embed as an extra query.
pub struct HydeGenerator {
    model: Arc<dyn LanguageModel>,
}

impl HydeGenerator {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    pub async fn generate(&self, question: &str, hint: Option<&str>) -> RagResult<String> {
        let mut prompt = format!("Question: {}", question);
        if let Some(hint) = hint {
            prompt.push_str(&format!("\nA good answer covers: {}", hint));
        }
        let passage = self
            .model
            .complete(&[ChatMessage::system(HYDE_PROMPT), ChatMessage::user(prompt)])
            .await?;
        Ok(passage.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phrases_come_first() {
        assert_eq!(
            lexical_keywords("What is the refund policy?", 5),
            vec!["refund policy", "refund", "policy"]
        );
    }

    #[test]
    fn stopwords_break_phrases_and_max_applies() {
        let kws = lexical_keywords("Show orders shipped to Berlin in March 2024", 4);
        assert_eq!(kws, vec!["orders shipped", "march 2024", "orders", "shipped"]);
    }

    #[test]
    fn german_questions_keep_their_nouns() {
        assert_eq!(
            lexical_keywords("Wie lange dauert eine Überweisung?", 4),
            vec!["lange dauert", "lange", "dauert", "überweisung"]
        );
    }

    #[test]
    fn phrases_leave_room_for_single_words() {
        let kws = lexical_keywords("refund policy for gift cards and store credit at partner shops", 4);
        assert_eq!(kws, vec!["refund policy", "gift cards", "refund", "policy"]);
        assert_eq!(lexical_keywords("gift cards", 1), vec!["gift cards"]);
    }

    #[test]
    fn cjk_runs_stay_whole() {
        assert_eq!(lexical_keywords("退款政策是什么？", 5), vec!["退款政策是什么"]);
        assert!(lexical_keywords("a I ?", 5).is_empty());
    }

    #[test]
    fn parses_fenced_json() {
        let reply = "Sure!\n```json\n{\"keywords\": [\"Refund Policy\", \"refund policy\", \" \"], \
                     \"queries\": [\"refund rules\", \"What is the refund policy?\"], \
                     \"hyde_hint\": \"days allowed\"}\n```";
        let rw = parse_rewrite(reply, "What is the refund policy?", 5);
        assert_eq!(rw.keywords, vec!["refund policy"]);
        assert_eq!(rw.queries, vec!["refund rules"]);
        assert_eq!(rw.hyde_hint.as_deref(), Some("days allowed"));
        assert!(!rw.fallback);
    }

    #[test]
    fn garbage_falls_back_to_lexical() {
        let rw = parse_rewrite("I cannot help with that.", "refund policy details", 5);
        assert!(rw.fallback);
        assert_eq!(rw.keywords[0], "refund policy details");
        assert!(rw.queries.is_empty());

        let rw = parse_rewrite("{\"keywords\": []}", "refund policy", 5);
        assert!(rw.fallback);
        assert_eq!(rw.keywords[0], "refund policy");
    }
}
