//! Web collection connector.
//!
//! Each configured URL is one unit. Pages are fetched with a bounded
//! timeout; HTML bodies are reduced to text by [`html_to_text`], other
//! textual bodies are used as-is.

use async_trait::async_trait;
use std::time::Duration;
use url::Url;

use zerag_core::models::{ConnectionParams, SourceKind};

use crate::error::{RagError, RagResult};
use crate::traits::{Connector, SourceUnit, UnitRef};

pub struct WebCollection {
    client: reqwest::Client,
    urls: Vec<Url>,
}

impl WebCollection {
    pub fn new(params: &ConnectionParams, timeout: Duration) -> RagResult<Self> {
        if params.urls.is_empty() {
            return Err(RagError::validation("web data source has no URLs"));
        }
        let urls = params
            .urls
            .iter()
            .map(|raw| {
                let url = Url::parse(raw.trim())
                    .map_err(|e| RagError::validation(format!("invalid URL '{}': {}", raw, e)))?;
                match url.scheme() {
                    "http" | "https" => Ok(url),
                    other => Err(RagError::validation(format!(
                        "unsupported URL scheme '{}' in {}",
                        other, raw
                    ))),
                }
            })
            .collect::<RagResult<Vec<_>>>()?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("zerag/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RagError::Internal(e.into()))?;

        Ok(Self { client, urls })
    }

    async fn fetch(&self, url: &str) -> RagResult<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| RagError::connection(format!("{}: {}", url, e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(RagError::connection(format!("{} returned HTTP {}", url, status)));
        }
        let is_html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("html"))
            .unwrap_or(true);
        let body = response
            .text()
            .await
            .map_err(|e| RagError::connection(format!("{}: {}", url, e)))?;
        Ok(if is_html { html_to_text(&body) } else { body })
    }
}

#[async_trait]
impl Connector for WebCollection {
    fn kind(&self) -> SourceKind {
        SourceKind::Web
    }

    /// Only the first URL is checked.
    async fn test_connection(&self) -> RagResult<()> {
        self.fetch(self.urls[0].as_str()).await.map(|_| ())
    }

    async fn list_units(&self) -> RagResult<Vec<UnitRef>> {
        Ok(self
            .urls
            .iter()
            .map(|u| UnitRef {
                name: u.to_string(),
                locator: u.to_string(),
            })
            .collect())
    }

    async fn pull_unit(&self, unit: &UnitRef) -> RagResult<Vec<SourceUnit>> {
        let text = self.fetch(&unit.locator).await?;
        if text.trim().is_empty() {
            tracing::warn!(url = %unit.locator, "page has no text content");
            return Ok(Vec::new());
        }
        Ok(vec![SourceUnit {
            unit_name: unit.name.clone(),
            row_id: None,
            text,
        }])
    }
}

// ============ HTML to text ============

const HIDDEN_TAGS: &[&str] = &["script", "style", "noscript"];

/// Reduce an HTML document to readable text.
///
/// Script, style and noscript elements are cut first; `html2md` turns
/// the rest into Markdown and decodes entities. Blank-line runs collapse
/// to a single paragraph break.
pub fn html_to_text(html: &str) -> String {
    let markdown = html2md::parse_html(&drop_hidden_blocks(html));
    collapse_blank_lines(&markdown)
}

/// Remove hidden elements together with their content.
fn drop_hidden_blocks(html: &str) -> String {
    // ASCII lowering keeps byte offsets aligned with `html`.
    let lower = html.to_ascii_lowercase();
    let mut out = String::with_capacity(html.len());
    let mut pos = 0;
    while let Some((start, tag)) = next_hidden(&lower, pos) {
        out.push_str(&html[pos..start]);
        let close = format!("</{}", tag);
        pos = match lower[start..].find(&close) {
            Some(p) => lower[start + p..]
                .find('>')
                .map(|q| start + p + q + 1)
                .unwrap_or(html.len()),
            None => html.len(),
        };
    }
    out.push_str(&html[pos..]);
    out
}

fn next_hidden(lower: &str, from: usize) -> Option<(usize, &'static str)> {
    HIDDEN_TAGS
        .iter()
        .filter_map(|tag| {
            let open = format!("<{}", tag);
            let mut search = from;
            while let Some(p) = lower[search..].find(&open) {
                let at = search + p;
                let after = at + open.len();
                match lower[after..].chars().next() {
                    Some(c) if c == '>' || c == '/' || c.is_ascii_whitespace() => {
                        return Some((at, *tag))
                    }
                    None => return Some((at, *tag)),
                    _ => search = after,
                }
            }
            None
        })
        .min_by_key(|(at, _)| *at)
}

fn collapse_blank_lines(text: &str) -> String {
    let mut out = String::new();
    let mut blank = false;
    for line in text.lines().map(str::trim_end) {
        if line.trim().is_empty() {
            blank = !out.is_empty();
            continue;
        }
        if !out.is_empty() {
            out.push_str(if blank { "\n\n" } else { "\n" });
        }
        out.push_str(line);
        blank = false;
    }
    out
}
