//! Summary of a noop (dry-run) deployment task.
//!
//! For every finished task record that ran in noop mode, the report keeps the
//! raw report lines saying what "should be" changed.

use serde::Serialize;
use serde_json::Value;

use crate::client::DeploymentClient;
use crate::error::Result;

pub const COLUMNS: [&str; 3] = ["task_name", "node", "summary"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportRow {
    pub task_name: String,
    pub node: String,
    pub summary: String,
}

/// The summary object of a record. Some client versions hand it over as a
/// JSON-encoded string.
fn summary_of(record: &Value) -> Option<Value> {
    match record.get("summary")? {
        Value::String(raw) => serde_json::from_str(raw).ok(),
        other => Some(other.clone()),
    }
}

fn is_noop_event(summary: &Value) -> bool {
    match summary.get("events") {
        Some(Value::Array(events)) => events.iter().any(|e| e.as_str() == Some("noop")),
        Some(Value::String(events)) => events.contains("noop"),
        _ => false,
    }
}

fn text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn pending_changes(summary: &Value) -> String {
    summary
        .get("raw_report")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter(|entry| {
                    entry
                        .get("message")
                        .and_then(Value::as_str)
                        .is_some_and(|message| message.contains("should be"))
                })
                .map(|entry| format!("{}:{}", text(entry.get("source")), text(entry.get("message"))))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

/// Reduce raw history records to noop report rows, in input order.
pub fn summarize(records: &[Value]) -> Vec<ReportRow> {
    records
        .iter()
        .filter_map(|record| {
            let summary = summary_of(record)?;
            if !is_noop_event(&summary) {
                return None;
            }
            Some(ReportRow {
                task_name: text(record.get("task_name")),
                node: text(record.get("node_id")),
                summary: pending_changes(&summary),
            })
        })
        .collect()
}

pub fn noop_report(client: &dyn DeploymentClient, task: u64) -> Result<Vec<ReportRow>> {
    let history = client.deployment_history(task)?;
    tracing::debug!(task, records = history.len(), "deployment history fetched");
    Ok(summarize(&history))
}
