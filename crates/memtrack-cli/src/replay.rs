use std::sync::Arc;

use anyhow::Context;
use memtrack_core::MemtrackConfig;
use memtrack_layer::{CollectingSink, ValidationLayer};
use memtrack_protocol::{Call, CallResult, Completion, Diagnostic, Severity};
use serde::{Deserialize, Serialize};
use tracing::debug;

// ── Trace format ────────────────────────────────────────────────────────────

/// One entry of a recorded trace: an intercepted call with the driver's
/// result, or a completion report from the driver.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TraceEntry {
    Call {
        call: Call,
        #[serde(default)]
        result: CallResult,
    },
    Complete {
        complete: Completion,
    },
}

pub fn parse_trace(content: &str) -> anyhow::Result<Vec<TraceEntry>> {
    serde_json::from_str(content).context("trace must be a JSON list of call or completion entries")
}

// ── Replay ──────────────────────────────────────────────────────────────────

/// A diagnostic together with the trace entry that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct ReportedDiagnostic {
    pub entry: usize,
    pub call: String,
    #[serde(flatten)]
    pub diagnostic: Diagnostic,
}

#[derive(Debug, Default, Serialize)]
pub struct ReplayReport {
    pub entries: usize,
    /// Calls the layer asked the dispatch layer not to forward
    pub skipped: usize,
    pub diagnostics: Vec<ReportedDiagnostic>,
}

impl ReplayReport {
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| d.diagnostic.is_error())
    }

    fn count(&self, severity: Severity) -> usize {
        self.diagnostics.iter().filter(|d| d.diagnostic.severity == severity).count()
    }
}

pub fn run_replay(path: &str, config: MemtrackConfig) -> anyhow::Result<ReplayReport> {
    let content = std::fs::read_to_string(path).with_context(|| format!("reading trace {}", path))?;
    let entries = parse_trace(&content)?;
    Ok(replay_entries(&entries, config))
}

/// Feed every entry through a fresh layer. A call whose pre-call verdict
/// asks to skip it never reaches the post-call hook.
pub fn replay_entries(entries: &[TraceEntry], config: MemtrackConfig) -> ReplayReport {
    let sink = Arc::new(CollectingSink::new());
    let layer = ValidationLayer::with_sink(config, sink.clone());
    let completions = layer.completion_sender();
    let mut report = ReplayReport {
        entries: entries.len(),
        ..Default::default()
    };

    for (index, entry) in entries.iter().enumerate() {
        let name = match entry {
            TraceEntry::Call { call, result } => {
                let verdict = layer.pre_call(call);
                if verdict.skip_call {
                    report.skipped += 1;
                    debug!("entry {}: {} skipped", index, call.name());
                } else {
                    layer.post_call(call, *result);
                }
                call.name().to_string()
            }
            TraceEntry::Complete { complete } => {
                // The layer owns the receiver, so the channel stays open.
                let _ = completions.send(*complete);
                layer.process_completions();
                format!("Completion({}, {})", complete.queue, complete.sequence)
            }
        };

        report.diagnostics.extend(sink.take().into_iter().map(|diagnostic| ReportedDiagnostic {
            entry: index,
            call: name.clone(),
            diagnostic,
        }));
    }
    report
}

// ── Output formatters ───────────────────────────────────────────────────────

pub fn print_report_pretty(report: &ReplayReport) {
    println!();
    println!("memtrack replay");
    println!("===============");
    println!();

    for reported in &report.diagnostics {
        let d = &reported.diagnostic;
        let (label, color_start, color_end) = match d.severity {
            Severity::Info => ("[INFO] ", "\x1b[90m", "\x1b[0m"),
            Severity::Warning => ("[WARN] ", "\x1b[33m", "\x1b[0m"),
            Severity::Error => ("[ERROR]", "\x1b[31m", "\x1b[0m"),
            Severity::Fatal => ("[FATAL]", "\x1b[1;31m", "\x1b[0m"),
        };
        println!(
            "  {}{}{} #{} {} - {}: {}",
            color_start, label, color_end, reported.entry, reported.call, d.kind, d.message
        );
    }
    if !report.diagnostics.is_empty() {
        println!();
    }

    println!("-------------------------------");
    println!(
        "  {} entries, {} skipped, {} errors, {} warnings",
        report.entries,
        report.skipped,
        report.count(Severity::Error) + report.count(Severity::Fatal),
        report.count(Severity::Warning)
    );
    println!();
}

pub fn print_report_json(report: &ReplayReport) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use memtrack_protocol::ErrorKind;

    const LEAKY_TRACE: &str = r#"[
        { "call": { "CreateDevice": { "device": { "raw": 1, "kind": "device" } } } },
        { "call": { "AllocateMemory": {
            "device": { "raw": 1, "kind": "device" },
            "memory": { "raw": 32, "kind": "device_memory" },
            "info": { "size": 4096, "properties": "HOST_VISIBLE" }
        } } },
        { "call": { "UnmapMemory": {
            "device": { "raw": 1, "kind": "device" },
            "memory": { "raw": 32, "kind": "device_memory" }
        } } },
        { "call": { "DestroyDevice": { "device": { "raw": 1, "kind": "device" } } } }
    ]"#;

    #[test]
    fn replay_reports_errors_and_leaks_with_entry_index() {
        let entries = parse_trace(LEAKY_TRACE).unwrap();
        assert_eq!(entries.len(), 4);

        let report = replay_entries(&entries, MemtrackConfig::default());
        assert!(report.has_errors());
        assert_eq!(report.skipped, 1);

        let kinds: Vec<(usize, ErrorKind)> =
            report.diagnostics.iter().map(|d| (d.entry, d.diagnostic.kind)).collect();
        assert_eq!(kinds, vec![(2, ErrorKind::InvalidMap), (3, ErrorKind::MemoryLeak)]);
    }

    #[test]
    fn completion_entries_parse() {
        let entries = parse_trace(r#"[{ "complete": { "queue": { "raw": 5, "kind": "queue" }, "sequence": 3 } }]"#)
            .unwrap();
        match &entries[0] {
            TraceEntry::Complete { complete } => assert_eq!(complete.sequence, 3),
            other => panic!("expected a completion, got {:?}", other),
        }
    }
}
