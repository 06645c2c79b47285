//! Okapi BM25 keyword ranking over one data source's chunks.
//!
//! The index is immutable: build it from every chunk of a source and
//! throw it away when the source is re-synced. Tokens are Unicode words,
//! lower-cased with full Unicode case folding, so "Überweisung" and
//! "überweisung" are the same term.
//!
//! IDF uses the non-negative form `ln(1 + (N - n + 0.5) / (n + 0.5))`,
//! so a term present in most chunks still scores a little above zero.

use std::collections::HashMap;

use unicode_segmentation::UnicodeSegmentation;

use crate::store::ChunkCandidate;

const K1: f64 = 1.5;
const B: f64 = 0.75;

/// Lower-cased Unicode words of `text`.
pub fn tokenize(text: &str) -> Vec<String> {
    text.unicode_words().map(|w| w.to_lowercase()).collect()
}

pub struct Bm25Index {
    docs: Vec<ChunkCandidate>,
    doc_len: Vec<f64>,
    avg_len: f64,
    /// term -> (doc index, term frequency)
    postings: HashMap<String, Vec<(usize, u32)>>,
}

impl Bm25Index {
    pub fn build(docs: Vec<ChunkCandidate>) -> Self {
        let mut postings: HashMap<String, Vec<(usize, u32)>> = HashMap::new();
        let mut doc_len = Vec::with_capacity(docs.len());

        for (i, doc) in docs.iter().enumerate() {
            let tokens = tokenize(&doc.text);
            doc_len.push(tokens.len() as f64);
            let mut tf: HashMap<String, u32> = HashMap::new();
            for t in tokens {
                *tf.entry(t).or_insert(0) += 1;
            }
            for (term, n) in tf {
                postings.entry(term).or_default().push((i, n));
            }
        }

        let avg_len = if doc_len.is_empty() {
            0.0
        } else {
            doc_len.iter().sum::<f64>() / doc_len.len() as f64
        };

        Self {
            docs,
            doc_len,
            avg_len,
            postings,
        }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn vocabulary_size(&self) -> usize {
        self.postings.len()
    }

    fn idf(&self, docs_with_term: usize) -> f64 {
        let n = self.docs.len() as f64;
        let df = docs_with_term as f64;
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
    }

    /// Chunks with a positive score for `query`, best first (ties by
    /// chunk id), at most `limit`. `score` carries the raw BM25 value.
    ///
    /// Repeated query terms count once.
    pub fn search(&self, query: &str, limit: usize) -> Vec<ChunkCandidate> {
        let mut terms = tokenize(query);
        terms.sort();
        terms.dedup();

        let mut scores: HashMap<usize, f64> = HashMap::new();
        for term in &terms {
            let Some(posting) = self.postings.get(term) else {
                continue;
            };
            let idf = self.idf(posting.len());
            for &(doc, tf) in posting {
                let tf = tf as f64;
                let norm = if self.avg_len > 0.0 {
                    self.doc_len[doc] / self.avg_len
                } else {
                    1.0
                };
                let s = idf * tf * (K1 + 1.0) / (tf + K1 * (1.0 - B + B * norm));
                *scores.entry(doc).or_insert(0.0) += s;
            }
        }

        let mut hits: Vec<ChunkCandidate> = scores
            .into_iter()
            .filter(|(_, s)| *s > 0.0)
            .map(|(doc, s)| ChunkCandidate {
                score: s,
                ..self.docs[doc].clone()
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(limit);
        hits
    }
}
