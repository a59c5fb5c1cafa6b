//! Text form of a [`Task`]

use super::naming::TaskFileName;
use super::sections::{fenced_blocks, list_items, parse_record, Record, RecordWriter};
use filebridge_core::constants::{LEGACY_TASK_HEADER, META_TASK_ID, TASK_HEADER};
use filebridge_core::{
    validate_project_id, CodeFragment, Error, Priority, Result, Task, TaskId, TaskKind, TaskStatus,
};
use indexmap::IndexMap;
use std::path::Path;

const TITLE: &str = "Title";
const PROJECT: &str = "Project";
const CONTEXT: &str = "Context";
const TASK: &str = "Task";
const FILES: &str = "Files";
const CODE: &str = "Code";
const PRIORITY: &str = "Priority";
const DEPENDENCIES: &str = "Dependencies";
const METADATA: &str = "Metadata";

/// Render a task in the canonical layout. Queue status is not part of the
/// text form; the directory a file sits in is its status.
pub fn render_task(task: &Task) -> String {
    let mut writer = RecordWriter::new(TASK_HEADER, task.kind.as_str());

    if !task.title.is_empty() {
        writer.text(TITLE, &task.title);
    }
    writer.section(PROJECT, &task.project_id);
    if !task.context.is_empty() {
        writer.text(CONTEXT, &task.context);
    }
    writer.text(TASK, &task.instructions);
    if !task.files.is_empty() {
        writer.list(FILES, &task.files);
    }
    if !task.code.is_empty() {
        let blocks: Vec<(Option<&str>, &str)> = task
            .code
            .iter()
            .map(|c| (c.language.as_deref(), c.content.as_str()))
            .collect();
        writer.fenced(CODE, &blocks);
    }
    writer.section(PRIORITY, task.priority.as_str());
    if !task.dependencies.is_empty() {
        writer.list(DEPENDENCIES, task.dependencies.iter().map(TaskId::as_str));
    }

    let metadata = std::iter::once(format!("{META_TASK_ID}: {}", task.id)).chain(
        task.metadata
            .iter()
            .filter(|(k, _)| k.as_str() != META_TASK_ID)
            .map(|(k, v)| format!("{k}: {v}")),
    );
    writer.list(METADATA, metadata);

    writer.finish()
}

/// Parse a task file.
///
/// The id comes from the `task_id` metadata entry, falling back to the
/// canonical file name. Missing `Project` or `Task` sections, an unknown
/// kind or priority, and malformed lists are all parse errors. A project id
/// that could leave the queue directory once it is part of a file name is a
/// security error.
pub fn parse_task(text: &str, path: &Path) -> Result<Task> {
    let record = parse_record(text, &[TASK_HEADER, LEGACY_TASK_HEADER], path)?;

    let kind: TaskKind = record
        .header_value
        .parse()
        .map_err(|e: Error| Error::task_parse(path, e.to_string()))?;

    let project_id = record.require(PROJECT, path)?.to_string();
    validate_project_id(&project_id).map_err(|e| Error::security(path, e.to_string()))?;
    let instructions = record.require_text(TASK, path)?;

    let priority = match record.section(PRIORITY) {
        Some(raw) if !raw.is_empty() => raw
            .parse::<Priority>()
            .map_err(|e| Error::task_parse(path, e.to_string()))?,
        _ => Priority::default(),
    };

    let files = optional_list(&record, FILES, path)?;

    let code = match record.section(CODE) {
        Some(body) => fenced_blocks(body, CODE, path)?
            .into_iter()
            .map(|block| CodeFragment {
                language: block.info,
                content: block.content,
            })
            .collect(),
        None => Vec::new(),
    };

    let dependencies = optional_list(&record, DEPENDENCIES, path)?
        .into_iter()
        .map(|raw| {
            TaskId::new(raw).map_err(|e| Error::task_parse(path, format!("bad dependency: {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut metadata = IndexMap::new();
    for item in optional_list(&record, METADATA, path)? {
        let (key, value) = item
            .split_once(':')
            .ok_or_else(|| Error::task_parse(path, format!("metadata entry '{item}' is not 'key: value'")))?;
        metadata.insert(key.trim().to_string(), value.trim().to_string());
    }

    let id = match metadata.shift_remove(META_TASK_ID) {
        Some(raw) => TaskId::new(raw).map_err(|e| Error::task_parse(path, e.to_string()))?,
        None => path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(TaskFileName::parse)
            .map(|name| name.task_id)
            .ok_or_else(|| Error::task_parse(path, "no task_id metadata and no id in file name"))?,
    };

    Ok(Task {
        id,
        project_id,
        kind,
        title: record.text(TITLE).unwrap_or_default(),
        context: record.text(CONTEXT).unwrap_or_default(),
        instructions,
        files,
        code,
        priority,
        dependencies,
        status: TaskStatus::Pending,
        metadata,
    })
}

fn optional_list(record: &Record, name: &str, path: &Path) -> Result<Vec<String>> {
    match record.section(name) {
        Some(body) => list_items(body, name, path),
        None => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filebridge_core::ErrorKind;
    use proptest::prelude::*;

    fn p() -> &'static Path {
        Path::new("tech_20260101T000000_t1.md")
    }

    fn sample() -> Task {
        Task::new("tech", TaskKind::Implement, "Add a login endpoint.\nKeep it small.")
            .with_id(TaskId::new("t1").unwrap())
            .with_title("Login")
            .with_context("Users cannot sign in yet.")
            .with_priority(Priority::High)
            .with_file("src/auth.rs")
            .with_code(CodeFragment::new("fn login() {}").with_language("rust"))
            .with_dependency(TaskId::new("t0").unwrap())
            .with_creator("desktop")
    }

    #[test]
    fn test_round_trip_sample() {
        let task = sample();
        let parsed = parse_task(&render_task(&task), p()).unwrap();
        assert_eq!(parsed, task);
    }

    #[test]
    fn test_minimal_file_defaults() {
        let text = "## BRIDGE_TASK: analyze\n\n### Project\ntech\n\n### Task\nLook around\n\n---\n";
        let task = parse_task(text, p()).unwrap();
        assert_eq!(task.id.as_str(), "t1");
        assert_eq!(task.priority, Priority::Medium);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.files.is_empty());
    }

    #[test]
    fn test_legacy_header_accepted() {
        let text = "## CLAUDE_TASK: test\n### Project\ntech\n### Task\nRun it\n### Metadata\n- task_id: abc\n---\n";
        let task = parse_task(text, Path::new("whatever.md")).unwrap();
        assert_eq!(task.kind, TaskKind::Test);
        assert_eq!(task.id.as_str(), "abc");
    }

    #[test]
    fn test_missing_task_section_is_parse_error() {
        let text = "## BRIDGE_TASK: implement\n### Project\ntech\n### Priority\nhigh\n---\n";
        let err = parse_task(text, p()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TaskParse);
        assert!(err.to_string().contains("Task"));
    }

    #[test]
    fn test_bad_kind_and_priority_are_parse_errors() {
        let bad_kind = "## BRIDGE_TASK: dance\n### Project\ntech\n### Task\nx\n---\n";
        assert_eq!(parse_task(bad_kind, p()).unwrap_err().kind(), ErrorKind::TaskParse);

        let bad_priority = "## BRIDGE_TASK: test\n### Project\ntech\n### Task\nx\n### Priority\nasap\n---\n";
        assert_eq!(parse_task(bad_priority, p()).unwrap_err().kind(), ErrorKind::TaskParse);
    }

    #[test]
    fn test_metadata_values_may_contain_colons() {
        let task = sample().with_metadata("created_at", "2026-01-01T10:20:30+00:00");
        let parsed = parse_task(&render_task(&task), p()).unwrap();
        assert_eq!(
            parsed.metadata.get("created_at").map(String::as_str),
            Some("2026-01-01T10:20:30+00:00")
        );
    }

    /// Lines that look like record framing are as likely as plain prose
    #[test]
    fn test_framing_lines_in_instructions_round_trip() {
        for instructions in [
            "Step one\n---\nStep two",
            "Intro\n### Steps\n1. do it",
            "Open a fence\n```\nand never close it",
            "\\---\nalready escaped looking",
        ] {
            let task = sample()
                .with_context("Background\n### Project\nother")
                .with_metadata("note", "first\n- second\n\n---");
            let task = Task {
                instructions: instructions.to_string(),
                ..task
            };
            let parsed = parse_task(&render_task(&task), p()).unwrap();
            assert_eq!(parsed, task, "{instructions:?}");
        }
    }

    #[test]
    fn test_path_like_project_is_security_error() {
        let text = "## BRIDGE_TASK: analyze\n### Project\n../../../escaped\n### Task\nLook\n---\n";
        assert_eq!(parse_task(text, p()).unwrap_err().kind(), ErrorKind::Security);
    }

    fn text_line() -> impl Strategy<Value = String> {
        prop_oneof![
            "[A-Za-z0-9 ,.!?()#`\\\\-]{1,30}".prop_filter_map("blank", |s| {
                let trimmed = s.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }),
            prop::sample::select(vec![
                "---",
                "### Heading",
                "### Task",
                "```",
                "```rust",
                "- item",
                "\\---",
                "\\",
                "\\\\### x",
            ])
            .prop_map(String::from),
        ]
    }

    /// Non-blank first and last lines, blank lines allowed in between
    fn text_block() -> impl Strategy<Value = String> {
        (
            text_line(),
            prop::collection::vec(prop_oneof![text_line(), Just(String::new())], 0..3),
            prop::option::of(text_line()),
        )
            .prop_map(|(first, middle, last)| {
                let mut lines = vec![first];
                if let Some(last) = last {
                    lines.extend(middle);
                    lines.push(last);
                }
                lines.join("\n")
            })
    }

    fn optional_text() -> impl Strategy<Value = String> {
        prop_oneof![Just(String::new()), text_block()]
    }

    fn task_id() -> impl Strategy<Value = TaskId> {
        "[a-z0-9][a-z0-9.-]{0,15}".prop_map(|s| TaskId::new(s).unwrap())
    }

    fn code_fragment() -> impl Strategy<Value = CodeFragment> {
        (
            prop::option::of("[a-z]{1,8}"),
            prop::collection::vec("[A-Za-z0-9 (){};=]{0,20}", 0..4),
        )
            .prop_map(|(language, lines)| CodeFragment {
                language,
                content: lines.join("\n"),
            })
    }

    prop_compose! {
        fn arb_task()(
            id in task_id(),
            project_id in "[a-z][a-z0-9_]{0,11}",
            kind in prop::sample::select(TaskKind::ALL.to_vec()),
            title in optional_text(),
            context in optional_text(),
            instructions in text_block(),
            files in prop::collection::vec("[a-z]{1,8}(/[a-z]{1,8}){0,2}\\.[a-z]{1,3}", 0..4),
            code in prop::collection::vec(code_fragment(), 0..3),
            priority in prop::sample::select(Priority::ALL.to_vec()),
            dependencies in prop::collection::vec(task_id(), 0..3),
            metadata in prop::collection::vec(("[a-z][a-z_]{0,10}", text_block()), 0..4),
        ) -> Task {
            let metadata: IndexMap<String, String> = metadata
                .into_iter()
                .filter(|(k, _)| k != META_TASK_ID)
                .collect();
            Task {
                id,
                project_id,
                kind,
                title,
                context,
                instructions,
                files,
                code,
                priority,
                dependencies,
                status: TaskStatus::Pending,
                metadata,
            }
        }
    }

    proptest! {
        #[test]
        fn prop_parse_render_round_trip(task in arb_task()) {
            let text = render_task(&task);
            let parsed = parse_task(&text, Path::new("any.md")).unwrap();
            prop_assert_eq!(parsed, task);
        }
    }
}
