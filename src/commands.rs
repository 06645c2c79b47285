//! `zerag sync`, `status`, `chunks` and `ask`.

use anyhow::Result;
use std::io::Write;
use std::sync::Arc;

use zerag_core::models::SyncStatus;

use crate::pipeline::{AskMode, AskRequest, StreamEvent};
use crate::progress::ProgressMode;
use crate::services::Services;
use crate::sync::{SyncOrchestrator, SyncStatusView};

pub async fn run_sync(services: &Services, id: i64) -> Result<()> {
    let orchestrator: SyncOrchestrator = (*services.sync)
        .clone()
        .with_progress(Arc::from(ProgressMode::default_for_tty().reporter()));
    let view = orchestrator.run(id).await?;
    print_status(id, &view);
    if view.sync_status == SyncStatus::Error {
        anyhow::bail!("sync failed");
    }
    Ok(())
}

pub async fn run_status(services: &Services, id: i64) -> Result<()> {
    let view = services.sync.status(id).await?;
    print_status(id, &view);
    Ok(())
}

fn print_status(id: i64, view: &SyncStatusView) {
    println!("data source {}", id);
    println!("  status: {}", view.sync_status.as_str());
    println!("  chunks: {}", view.chunk_count);
    println!("  progress: {}%", view.sync_progress);
    if let Some(at) = view.last_synced_at {
        println!("  last synced: {}", at.to_rfc3339());
    }
    if let Some(err) = &view.sync_error {
        println!("  error: {}", err);
    }
}

pub async fn run_chunks(
    services: &Services,
    id: i64,
    q: Option<String>,
    page: i64,
    page_size: i64,
) -> Result<()> {
    if services.store.get_data_source(id).await?.is_none() {
        anyhow::bail!("data source {} not found", id);
    }
    let listing = services
        .store
        .list_chunks(id, page.max(1), page_size.clamp(1, 200), q.as_deref())
        .await?;
    if listing.items.is_empty() {
        println!("No chunks.");
        return Ok(());
    }
    for c in &listing.items {
        let preview: String = c.text.chars().take(160).collect();
        let location = match &c.row_id {
            Some(row) => format!("{} #{}", c.unit_name, row),
            None => c.unit_name.clone(),
        };
        println!("[{}] {} (chunk {})", c.id, location, c.chunk_index);
        println!("    {}", preview.replace('\n', " "));
    }
    println!(
        "page {} of {} ({} chunks)",
        listing.page,
        (listing.total + listing.page_size - 1) / listing.page_size.max(1),
        listing.total
    );
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct AskOptions {
    pub source: Option<i64>,
    pub chat: bool,
    pub stream: bool,
    pub top_k: Option<usize>,
    pub no_rewrite: bool,
    pub no_hyde: bool,
    pub no_sql_fallback: bool,
}

pub async fn run_ask(services: &Services, question: &str, opts: AskOptions) -> Result<()> {
    let req = AskRequest {
        question: question.to_string(),
        mode: if opts.chat { AskMode::Chat } else { AskMode::Rag },
        data_source_id: opts.source,
        top_k: opts.top_k,
        enable_rewrite: opts.no_rewrite.then_some(false),
        enable_hyde: opts.no_hyde.then_some(false),
        enable_sql_fallback: opts.no_sql_fallback.then_some(false),
        conversation_history: Vec::new(),
    };

    if !opts.stream {
        let resp = services.pipeline.ask(req).await?;
        println!("{}", resp.answer);
        print_sources(&resp.retrieved_chunks);
        return Ok(());
    }

    let mut stream = services.pipeline.ask_stream(req).await?;
    let mut chunks = Vec::new();
    let mut stdout = std::io::stdout();
    while let Some(event) = stream.next().await {
        match event {
            StreamEvent::RetrievalDone { chunks: c, .. } => chunks = c,
            StreamEvent::Token { content } => {
                write!(stdout, "{}", content)?;
                stdout.flush()?;
            }
            StreamEvent::Done { .. } => println!(),
            StreamEvent::Error { message } => {
                println!();
                anyhow::bail!("generation failed: {}", message);
            }
        }
    }
    print_sources(&chunks);
    Ok(())
}

fn print_sources(chunks: &[zerag_core::models::RetrievedFragment]) {
    if chunks.is_empty() {
        return;
    }
    println!();
    println!("sources:");
    for (i, c) in chunks.iter().enumerate() {
        let location = match &c.row_id {
            Some(row) => format!("{} #{}", c.table_name, row),
            None => c.table_name.clone(),
        };
        println!(
            "  [{}] {} ({}, {:.3})",
            i + 1,
            location,
            c.origin.as_str(),
            c.similarity
        );
    }
}
