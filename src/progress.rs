//! Scan progress reporting.
//!
//! A running scan publishes a [`ScanStatus`] snapshot through a
//! `tokio::sync::watch` channel. Reporters render those snapshots on
//! **stderr** so stdout remains parseable for scripts.

use std::io::Write;

use serde::Serialize;

/// Phase of a scan.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    /// Waiting for another scan of the same organization to finish.
    #[default]
    Queued,
    Loading,
    Embedding,
    Comparing,
    Persisting,
    Caching,
    Done,
    Failed,
    Cancelled,
}

impl ScanPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanPhase::Queued => "queued",
            ScanPhase::Loading => "loading",
            ScanPhase::Embedding => "embedding",
            ScanPhase::Comparing => "comparing",
            ScanPhase::Persisting => "persisting",
            ScanPhase::Caching => "caching",
            ScanPhase::Done => "done",
            ScanPhase::Failed => "failed",
            ScanPhase::Cancelled => "cancelled",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, ScanPhase::Done | ScanPhase::Failed | ScanPhase::Cancelled)
    }
}

/// Snapshot of a scan. Counters only grow while a scan runs.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ScanStatus {
    pub phase: ScanPhase,
    pub documents_total: u64,
    pub documents_embedded: u64,
    pub pairs_found: u64,
    pub documents_updated: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Renders scan status snapshots.
pub trait ScanProgressReporter: Send + Sync {
    fn report(&self, org: &str, status: &ScanStatus);
}

/// Human-friendly progress on stderr: "scan acme  embedding  1,234 / 5,000 documents".
pub struct StderrProgress;

impl ScanProgressReporter for StderrProgress {
    fn report(&self, org: &str, status: &ScanStatus) {
        let line = match status.phase {
            ScanPhase::Embedding => format!(
                "scan {}  embedding  {} / {} documents\n",
                org,
                format_number(status.documents_embedded),
                format_number(status.documents_total)
            ),
            ScanPhase::Comparing | ScanPhase::Persisting | ScanPhase::Caching => format!(
                "scan {}  {}  {} pairs\n",
                org,
                status.phase.as_str(),
                format_number(status.pairs_found)
            ),
            ScanPhase::Done => format!(
                "scan {}  done  {} pairs, {} documents updated\n",
                org,
                format_number(status.pairs_found),
                format_number(status.documents_updated)
            ),
            phase => format!("scan {}  {}...\n", org, phase.as_str()),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ScanProgressReporter for JsonProgress {
    fn report(&self, org: &str, status: &ScanStatus) {
        let obj = serde_json::json!({
            "event": "progress",
            "org": org,
            "status": status,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ScanProgressReporter for NoProgress {
    fn report(&self, _org: &str, _status: &ScanStatus) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    pub fn reporter(&self) -> Box<dyn ScanProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
