//! Outcome → human/json string formatting.
//!
//! Two modes:
//! - **Human** (default): one line per transaction or disk
//! - **JSON** (`--json`): `serde_json::to_string_pretty`

use hotclone_core::{CloneError, TransactionRecord, TxnId};
use hotclone_engine::{ClonePlan, CloneReport, CorruptRecord, RecoveryReport};
use serde_json::json;

/// Output formatting mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

/// Format an error.
pub fn format_error(err: &CloneError, mode: OutputMode) -> String {
    match mode {
        OutputMode::Json => pretty(&json!({
            "error": err.to_string(),
            "exit_code": err.exit_code(),
        })),
        OutputMode::Human => format!("(error) {}", err),
    }
}

/// Format a successful clone.
pub fn format_report(report: &CloneReport, mode: OutputMode) -> String {
    match mode {
        OutputMode::Json => pretty(&json!({
            "txn_id": report.txn_id.to_string(),
            "destination": report.destination.as_str(),
            "disks": report
                .disks
                .iter()
                .map(|(disk, path)| (disk.to_string(), serde_json::Value::String(path.display().to_string())))
                .collect::<serde_json::Map<_, _>>(),
            "bytes_copied": report.bytes_copied,
        })),
        OutputMode::Human => {
            let mut out = format!(
                "cloned into {} ({} bytes, txn {})",
                report.destination, report.bytes_copied, report.txn_id
            );
            for (disk, path) in &report.disks {
                out.push_str(&format!("\n  {} -> {}", disk, path.display()));
            }
            out
        }
    }
}

/// Format a dry-run plan.
pub fn format_plan(plan: &ClonePlan, mode: OutputMode) -> String {
    match mode {
        OutputMode::Json => pretty(&json!({
            "source": plan.source().as_str(),
            "destination": plan.request.destination,
            "disks": plan
                .disks
                .iter()
                .map(|(disk, rec)| {
                    (
                        disk.to_string(),
                        json!({
                            "source": rec.source_path.display().to_string(),
                            "destination": rec.dest_path.display().to_string(),
                        }),
                    )
                })
                .collect::<serde_json::Map<_, _>>(),
        })),
        OutputMode::Human => {
            let mut out = format!(
                "would clone {} into {} ({} disks)",
                plan.source(),
                plan.request.destination,
                plan.disks.len()
            );
            for (disk, rec) in &plan.disks {
                out.push_str(&format!(
                    "\n  {}: {} -> {}",
                    disk,
                    rec.source_path.display(),
                    rec.dest_path.display()
                ));
            }
            out
        }
    }
}

/// Format log records, newest last.
pub fn format_records(records: &[TransactionRecord], mode: OutputMode) -> String {
    match mode {
        OutputMode::Json => pretty(&records),
        OutputMode::Human => {
            if records.is_empty() {
                return "(no transactions)".to_string();
            }
            records
                .iter()
                .map(format_record_human)
                .collect::<Vec<_>>()
                .join("\n")
        }
    }
}

fn format_record_human(record: &TransactionRecord) -> String {
    let mut out = format!(
        "{} {} {} -> {} (updated {})",
        record.txn_id,
        record.state.as_str(),
        record.request.source,
        record.request.destination,
        record.last_updated.to_rfc3339()
    );
    if let Some(cause) = &record.failure {
        out.push_str(&format!("\n  cause: {}", cause));
    }
    for (disk, rec) in &record.disks {
        let progress = match rec.total_bytes {
            Some(total) => format!("{}/{} bytes", rec.bytes_copied, total),
            None => format!("{} bytes", rec.bytes_copied),
        };
        out.push_str(&format!(
            "\n  {}: {} {} -> {}",
            disk,
            rec.state.as_str(),
            progress,
            rec.dest_path.display()
        ));
    }
    out
}

/// Format log records that could not be read.
pub fn format_corrupt(corrupt: &[CorruptRecord], mode: OutputMode) -> String {
    match mode {
        OutputMode::Json => pretty(&json!({
            "corrupt": corrupt
                .iter()
                .map(|c| {
                    json!({
                        "txn_id": c.txn_id.to_string(),
                        "path": c.path.display().to_string(),
                        "reason": c.reason,
                    })
                })
                .collect::<Vec<_>>(),
        })),
        OutputMode::Human => corrupt
            .iter()
            .map(|c| format!("{} unreadable ({}): {}", c.txn_id, c.path.display(), c.reason))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// Format a recovery pass.
pub fn format_recovery(report: &RecoveryReport, mode: OutputMode) -> String {
    match mode {
        OutputMode::Json => pretty(
            &report
                .outcomes
                .iter()
                .map(|o| {
                    json!({
                        "txn_id": o.txn_id.to_string(),
                        "state": o.state.as_str(),
                        "error": o.error.as_ref().map(|e| e.to_string()),
                    })
                })
                .collect::<Vec<_>>(),
        ),
        OutputMode::Human => {
            if report.is_empty() {
                return "nothing to recover".to_string();
            }
            report
                .outcomes
                .iter()
                .map(|o| match &o.error {
                    Some(e) => format!("{} {}: {}", o.txn_id, o.state.as_str(), e),
                    None => format!("{} {}", o.txn_id, o.state.as_str()),
                })
                .collect::<Vec<_>>()
                .join("\n")
        }
    }
}

/// Format the ids of deleted records.
pub fn format_removed(ids: &[TxnId], mode: OutputMode) -> String {
    match mode {
        OutputMode::Json => pretty(&ids.iter().map(|id| id.to_string()).collect::<Vec<_>>()),
        OutputMode::Human => format!("(integer) {}", ids.len()),
    }
}

fn pretty<T: serde::Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e))
}
