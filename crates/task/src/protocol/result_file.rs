//! Text form of a [`TaskResult`]

use super::sections::{fenced_blocks, list_items, parse_record, RecordWriter};
use chrono::{DateTime, SecondsFormat, Utc};
use filebridge_core::constants::RESULT_HEADER;
use filebridge_core::{
    ChangeKind, Error, ExecutionMetrics, FileChange, Issue, Result, ResultStatus, Severity,
    TaskId, TaskResult,
};
use std::path::Path;

const STATUS: &str = "Status";
const SUMMARY: &str = "Summary";
const CHANGES: &str = "Changes";
const OUTPUT: &str = "Output";
const ISSUES: &str = "Issues";
const NEXT_STEPS: &str = "Next Steps";
const METADATA: &str = "Metadata";

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn render_change(change: &FileChange) -> String {
    format!(
        "{}: {} (size: {:+}, lines: {:+})",
        change.kind.as_str(),
        change.path,
        change.size_delta,
        change.line_delta
    )
}

/// `[severity] message (file:line)`. A message that itself ends in a
/// parenthesised part gets an empty location so it is not read back as one.
fn render_issue(issue: &Issue) -> String {
    let mut line = format!("[{}] {}", issue.severity.as_str(), issue.message);
    match (&issue.file, issue.line) {
        (Some(file), Some(n)) => line.push_str(&format!(" ({file}:{n})")),
        (Some(file), None) => line.push_str(&format!(" ({file})")),
        (None, _) if issue.message.ends_with(')') && issue.message.contains(" (") => {
            line.push_str(" ()")
        }
        (None, _) => {}
    }
    line
}

pub fn render_result(result: &TaskResult) -> String {
    let mut writer = RecordWriter::new(RESULT_HEADER, result.task_id.as_str());
    writer
        .section(STATUS, result.status.as_str())
        .text(SUMMARY, &result.summary);

    if !result.changes.is_empty() {
        writer.list(CHANGES, result.changes.iter().map(render_change));
    }
    if !result.output.is_empty() {
        writer.fenced(OUTPUT, &[(None, result.output.as_str())]);
    }
    if !result.issues.is_empty() {
        writer.list(ISSUES, result.issues.iter().map(render_issue));
    }
    if !result.next_steps.is_empty() {
        writer.list(NEXT_STEPS, &result.next_steps);
    }
    writer.list(
        METADATA,
        [
            format!("started_at: {}", timestamp(&result.metrics.started_at)),
            format!("completed_at: {}", timestamp(&result.metrics.completed_at)),
            format!("duration_ms: {}", result.metrics.duration_ms),
        ],
    );

    writer.finish()
}

fn parse_change(item: &str, path: &Path) -> Result<FileChange> {
    let bad = || Error::task_parse(path, format!("malformed change entry '{item}'"));
    let (kind, rest) = item.split_once(':').ok_or_else(bad)?;
    let kind: ChangeKind = kind.parse().map_err(|_| bad())?;
    let rest = rest.trim();

    let (file, size_delta, line_delta) = match rest.rfind(" (size: ") {
        Some(idx) if rest.ends_with(')') => {
            let deltas = &rest[idx + " (size: ".len()..rest.len() - 1];
            let (size, lines) = deltas.split_once(", lines: ").ok_or_else(bad)?;
            (
                &rest[..idx],
                size.trim().parse::<i64>().map_err(|_| bad())?,
                lines.trim().parse::<i64>().map_err(|_| bad())?,
            )
        }
        _ => (rest, 0, 0),
    };

    Ok(FileChange::new(file.trim(), kind).with_deltas(size_delta, line_delta))
}

fn parse_issue(item: &str, path: &Path) -> Result<Issue> {
    let bad = || Error::task_parse(path, format!("malformed issue entry '{item}'"));
    let rest = item.strip_prefix('[').ok_or_else(bad)?;
    let (severity, message) = rest.split_once(']').ok_or_else(bad)?;
    let severity: Severity = severity.parse().map_err(|_| bad())?;
    let message = message.trim();

    if let (Some(idx), true) = (message.rfind(" ("), message.ends_with(')')) {
        let location = &message[idx + 2..message.len() - 1];
        let text = &message[..idx];
        if location.is_empty() {
            return Ok(Issue::new(severity, text));
        }
        let (file, line) = match location.rsplit_once(':') {
            Some((file, n)) if n.parse::<u32>().is_ok() => (file, n.parse::<u32>().ok()),
            _ => (location, None),
        };
        if !file.is_empty() {
            return Ok(Issue::new(severity, text).at(file, line));
        }
    }

    Ok(Issue::new(severity, message))
}

fn parse_timestamp(raw: &str, path: &Path) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::task_parse(path, format!("bad timestamp '{raw}': {e}")))
}

pub fn parse_result(text: &str, path: &Path) -> Result<TaskResult> {
    let record = parse_record(text, &[RESULT_HEADER], path)?;
    let task_id = TaskId::new(record.header_value.as_str())
        .map_err(|e| Error::task_parse(path, e.to_string()))?;

    let status: ResultStatus = record
        .require(STATUS, path)?
        .parse()
        .map_err(|e: Error| Error::task_parse(path, e.to_string()))?;
    let summary = record.text(SUMMARY).unwrap_or_default();

    let changes = match record.section(CHANGES) {
        Some(body) => list_items(body, CHANGES, path)?
            .into_iter()
            .map(|item| parse_change(&item, path))
            .collect::<Result<Vec<_>>>()?,
        None => Vec::new(),
    };

    let output = match record.section(OUTPUT) {
        Some(body) => fenced_blocks(body, OUTPUT, path)?
            .into_iter()
            .map(|block| block.content)
            .collect::<Vec<_>>()
            .join("\n"),
        None => String::new(),
    };

    let issues = match record.section(ISSUES) {
        Some(body) => list_items(body, ISSUES, path)?
            .into_iter()
            .map(|item| parse_issue(&item, path))
            .collect::<Result<Vec<_>>>()?,
        None => Vec::new(),
    };

    let next_steps = match record.section(NEXT_STEPS) {
        Some(body) => list_items(body, NEXT_STEPS, path)?,
        None => Vec::new(),
    };

    let mut started_at = None;
    let mut completed_at = None;
    let mut duration_ms = None;
    if let Some(body) = record.section(METADATA) {
        for item in list_items(body, METADATA, path)? {
            let Some((key, value)) = item.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "started_at" => started_at = Some(parse_timestamp(value, path)?),
                "completed_at" => completed_at = Some(parse_timestamp(value, path)?),
                "duration_ms" => {
                    duration_ms = Some(value.parse::<u64>().map_err(|_| {
                        Error::task_parse(path, format!("bad duration_ms '{value}'"))
                    })?)
                }
                _ => {}
            }
        }
    }

    let completed_at =
        completed_at.ok_or_else(|| Error::task_parse(path, "missing completed_at metadata"))?;
    let started_at = started_at.unwrap_or(completed_at);
    let metrics = ExecutionMetrics {
        started_at,
        completed_at,
        duration_ms: duration_ms
            .unwrap_or_else(|| (completed_at - started_at).num_milliseconds().max(0) as u64),
    };

    Ok(TaskResult {
        task_id,
        status,
        summary,
        changes,
        output,
        issues,
        next_steps,
        metrics,
    })
}
