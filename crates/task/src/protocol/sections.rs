//! Section framing shared by task and result files
//!
//! A record is a header line (`## MARKER: value`), a series of
//! `### Name` sections and a closing `---`. Fenced code blocks inside a
//! section are opaque: markers inside them are content.
//!
//! Free text is written through [`RecordWriter::text`], which puts a
//! backslash in front of every line that would otherwise read as framing.
//! [`Record::text`] strips exactly those backslashes again.
//! List items may span lines: continuation lines are indented by two spaces
//! and escaped the same way.

use filebridge_core::constants::{RECORD_TERMINATOR, SECTION_PREFIX};
use std::borrow::Cow;
use std::path::Path;

use filebridge_core::{Error, Result};

/// A parsed record: the header value plus its sections in file order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Which of the accepted header markers matched
    pub marker: &'static str,
    pub header_value: String,
    pub sections: Vec<Section>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    /// Body with surrounding blank lines removed
    pub body: String,
}

impl Record {
    pub fn section(&self, name: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
            .map(|s| s.body.as_str())
    }

    pub fn require(&self, name: &str, path: &Path) -> Result<&str> {
        match self.section(name) {
            Some(body) if !body.is_empty() => Ok(body),
            Some(_) => Err(Error::task_parse(path, format!("section '{name}' is empty"))),
            None => Err(Error::task_parse(path, format!("missing required section '{name}'"))),
        }
    }

    /// A free-text section with escapes removed
    pub fn text(&self, name: &str) -> Option<String> {
        self.section(name).map(unescape_text)
    }

    pub fn require_text(&self, name: &str, path: &Path) -> Result<String> {
        self.require(name, path).map(unescape_text)
    }
}

const ESCAPE: char = '\\';
const LIST_BULLET: &str = "- ";
const CONTINUATION_INDENT: &str = "  ";

/// Lines the record parser would not keep as section content
fn is_framing(line: &str) -> bool {
    line.trim_end() == RECORD_TERMINATOR
        || line.starts_with(SECTION_PREFIX)
        || fence_of(line.trim_start()).is_some()
}

/// Lines that would not survive as the continuation of a list item
fn is_list_framing(line: &str) -> bool {
    let trimmed = line.trim_start();
    line.trim().is_empty() || trimmed.starts_with(LIST_BULLET) || fence_of(trimmed).is_some()
}

/// A line is escaped when it is framing, or when it already starts with the
/// escape character in front of something that would need escaping. The
/// second rule keeps the mapping reversible.
fn needs_escape(line: &str, framing: fn(&str) -> bool) -> bool {
    framing(line)
        || line
            .strip_prefix(ESCAPE)
            .is_some_and(|rest| needs_escape(rest, framing))
}

fn escape_line(line: &str, framing: fn(&str) -> bool) -> Cow<'_, str> {
    if needs_escape(line, framing) {
        Cow::Owned(format!("{ESCAPE}{line}"))
    } else {
        Cow::Borrowed(line)
    }
}

fn unescape_line(line: &str, framing: fn(&str) -> bool) -> &str {
    match line.strip_prefix(ESCAPE) {
        Some(rest) if needs_escape(rest, framing) => rest,
        _ => line,
    }
}

/// Make free text safe to place in a section body
pub fn escape_text(text: &str) -> String {
    text.lines()
        .map(|line| escape_line(line, is_framing))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn unescape_text(body: &str) -> String {
    body.lines()
        .map(|line| unescape_line(line, is_framing))
        .collect::<Vec<_>>()
        .join("\n")
}

fn fence_of(line: &str) -> Option<usize> {
    let ticks = line.chars().take_while(|c| *c == '`').count();
    (ticks >= 3).then_some(ticks)
}

/// Split `text` into a [`Record`].
///
/// `markers` lists the accepted header prefixes; the first non-blank line
/// must start with one of them. Text after the terminator is ignored.
pub fn parse_record(text: &str, markers: &[&'static str], path: &Path) -> Result<Record> {
    let mut lines = text.lines().skip_while(|l| l.trim().is_empty());

    let header = lines
        .next()
        .ok_or_else(|| Error::task_parse(path, "file is empty"))?;
    let header = header.trim_end();
    let (marker, header_value) = markers
        .iter()
        .find_map(|m| header.strip_prefix(m).map(|rest| (*m, rest.trim().to_string())))
        .ok_or_else(|| {
            Error::task_parse(path, format!("unrecognised header line '{header}'"))
        })?;

    let mut sections: Vec<Section> = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;
    let mut open_fence: Option<usize> = None;
    let mut terminated = false;

    for line in lines {
        if let Some(width) = open_fence {
            if fence_of(line.trim_end()) == Some(width) && line.trim_end().len() == width {
                open_fence = None;
            }
            match current.as_mut() {
                Some((_, body)) => body.push(line),
                None => {
                    return Err(Error::task_parse(path, "content before the first section"));
                }
            }
            continue;
        }

        if line.trim_end() == RECORD_TERMINATOR {
            terminated = true;
            break;
        }

        if let Some(name) = line.strip_prefix(SECTION_PREFIX) {
            if let Some((name, body)) = current.take() {
                push_section(&mut sections, name, &body, path)?;
            }
            current = Some((name.trim().to_string(), Vec::new()));
            continue;
        }

        if let Some(width) = fence_of(line.trim_start()) {
            open_fence = Some(width);
        }

        match current.as_mut() {
            Some((_, body)) => body.push(line),
            None if line.trim().is_empty() => {}
            None => return Err(Error::task_parse(path, "content before the first section")),
        }
    }

    if open_fence.is_some() {
        return Err(Error::task_parse(path, "unterminated code fence"));
    }
    if !terminated {
        return Err(Error::task_parse(
            path,
            format!("missing '{RECORD_TERMINATOR}' terminator"),
        ));
    }
    if let Some((name, body)) = current.take() {
        push_section(&mut sections, name, &body, path)?;
    }

    Ok(Record {
        marker,
        header_value,
        sections,
    })
}

fn push_section(sections: &mut Vec<Section>, name: String, body: &[&str], path: &Path) -> Result<()> {
    if sections.iter().any(|s| s.name.eq_ignore_ascii_case(&name)) {
        return Err(Error::task_parse(path, format!("duplicate section '{name}'")));
    }
    let body = body.join("\n").trim().to_string();
    sections.push(Section { name, body });
    Ok(())
}

/// Items of a `- item` list. Indented lines continue the previous item;
/// anything else is rejected.
pub fn list_items(body: &str, section: &str, path: &Path) -> Result<Vec<String>> {
    let mut items: Vec<String> = Vec::new();
    for line in body.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if let Some(item) = line.trim_start().strip_prefix(LIST_BULLET) {
            items.push(item.trim().to_string());
            continue;
        }
        match (items.last_mut(), line.strip_prefix(CONTINUATION_INDENT)) {
            (Some(item), Some(rest)) => {
                item.push('\n');
                item.push_str(unescape_line(rest, is_list_framing));
            }
            _ => {
                return Err(Error::task_parse(
                    path,
                    format!("expected '- item' in section '{section}', got '{line}'"),
                ))
            }
        }
    }
    Ok(items)
}

/// A fenced block: optional info string plus content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fenced {
    pub info: Option<String>,
    pub content: String,
}

/// Every fenced block in `body`, in order. Text outside fences is rejected.
pub fn fenced_blocks(body: &str, section: &str, path: &Path) -> Result<Vec<Fenced>> {
    let mut blocks = Vec::new();
    let mut lines = body.lines();

    while let Some(line) = lines.next() {
        if line.trim().is_empty() {
            continue;
        }
        let opening = line.trim();
        let width = fence_of(opening).ok_or_else(|| {
            Error::task_parse(path, format!("expected a code fence in section '{section}'"))
        })?;
        let info = opening[width..].trim();
        let mut content = Vec::new();
        let mut closed = false;
        for inner in lines.by_ref() {
            let trimmed = inner.trim_end();
            if fence_of(trimmed) == Some(width) && trimmed.len() == width {
                closed = true;
                break;
            }
            content.push(inner);
        }
        if !closed {
            return Err(Error::task_parse(path, format!("unterminated code fence in section '{section}'")));
        }
        blocks.push(Fenced {
            info: (!info.is_empty()).then(|| info.to_string()),
            content: content.join("\n"),
        });
    }

    Ok(blocks)
}

/// A backtick fence longer than any backtick run at the start of a line in
/// `content`
pub fn fence_for(content: &str) -> String {
    let longest = content
        .lines()
        .map(|l| l.trim_start().chars().take_while(|c| *c == '`').count())
        .max()
        .unwrap_or(0);
    "`".repeat(longest.max(2) + 1)
}

/// Incrementally builds a record in the canonical layout
pub struct RecordWriter {
    out: String,
}

impl RecordWriter {
    pub fn new(marker: &str, header_value: &str) -> Self {
        Self {
            out: format!("{marker} {header_value}\n"),
        }
    }

    pub fn section(&mut self, name: &str, body: &str) -> &mut Self {
        self.out.push('\n');
        self.out.push_str(SECTION_PREFIX);
        self.out.push_str(name);
        self.out.push('\n');
        self.out.push_str(body);
        if !body.ends_with('\n') {
            self.out.push('\n');
        }
        self
    }

    /// A free-text section; see [`escape_text`]
    pub fn text(&mut self, name: &str, text: &str) -> &mut Self {
        self.section(name, &escape_text(text))
    }

    pub fn list<I, S>(&mut self, name: &str, items: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut body = String::new();
        for item in items {
            let mut lines = item.as_ref().lines();
            body.push_str(LIST_BULLET);
            body.push_str(lines.next().unwrap_or_default());
            body.push('\n');
            for line in lines {
                body.push_str(CONTINUATION_INDENT);
                body.push_str(&escape_line(line, is_list_framing));
                body.push('\n');
            }
        }
        self.section(name, &body)
    }

    pub fn fenced(&mut self, name: &str, blocks: &[(Option<&str>, &str)]) -> &mut Self {
        let mut body = String::new();
        for (i, (info, content)) in blocks.iter().enumerate() {
            if i > 0 {
                body.push('\n');
            }
            let fence = fence_for(content);
            body.push_str(&fence);
            body.push_str(info.unwrap_or(""));
            body.push('\n');
            if !content.is_empty() {
                body.push_str(content);
                body.push('\n');
            }
            body.push_str(&fence);
            body.push('\n');
        }
        self.section(name, &body)
    }

    pub fn finish(mut self) -> String {
        self.out.push('\n');
        self.out.push_str(RECORD_TERMINATOR);
        self.out.push('\n');
        self.out
    }
}
