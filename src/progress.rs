//! Sync progress reporting for the terminal.
//!
//! The orchestrator always records a percentage on the data source for
//! pollers; these reporters additionally show per-unit progress when a
//! sync runs in the foreground (`zerag sync <id>`). Output goes to
//! **stderr** so stdout stays parseable.

use std::io::Write;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncProgressEvent {
    /// Units enumerated, nothing fetched yet.
    Listed { source: String, units: u64 },
    /// One unit fetched, chunked, embedded and stored.
    Unit {
        source: String,
        unit: String,
        n: u64,
        total: u64,
        chunks: u64,
    },
    Finished { source: String, chunks: u64 },
}

pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: SyncProgressEvent);
}

/// `sync shop  3 / 12 units  orders (+240 chunks)`
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Listed { source, units } => {
                format!("sync {}  {} units to fetch\n", source, format_number(*units))
            }
            SyncProgressEvent::Unit {
                source,
                unit,
                n,
                total,
                chunks,
            } => format!(
                "sync {}  {} / {} units  {} (+{} chunks)\n",
                source,
                format_number(*n),
                format_number(*total),
                unit,
                format_number(*chunks)
            ),
            SyncProgressEvent::Finished { source, chunks } => {
                format!("sync {}  done, {} chunks\n", source, format_number(*chunks))
            }
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// One JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let obj = match &event {
            SyncProgressEvent::Listed { source, units } => serde_json::json!({
                "event": "progress",
                "source": source,
                "phase": "listed",
                "units": units
            }),
            SyncProgressEvent::Unit {
                source,
                unit,
                n,
                total,
                chunks,
            } => serde_json::json!({
                "event": "progress",
                "source": source,
                "phase": "unit",
                "unit": unit,
                "n": n,
                "total": total,
                "chunks": chunks
            }),
            SyncProgressEvent::Finished { source, chunks } => serde_json::json!({
                "event": "progress",
                "source": source,
                "phase": "finished",
                "chunks": chunks
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Percentage stored on the data source after `done` of `total` units.
/// Listing occupies 0–10, units 10–90, the final write 90–100.
pub fn unit_percent(done: usize, total: usize) -> i64 {
    if total == 0 {
        return 90;
    }
    10 + (80 * done.min(total) / total) as i64
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
