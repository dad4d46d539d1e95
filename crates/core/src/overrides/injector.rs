//! Re-injection of locked overrides into freshly generated code.
//!
//! Generated documents are sequences of blocks separated by blank lines, and every component
//! block opens with a `[component:<id>]` marker comment. Anchors are resolved against the
//! generated text only, never against code inserted by another override. An override replaces
//! the generated block from its anchor line up to the next blank line. When the marker is
//! missing the injector falls back to a name anchor (a `define "<id>"` line or a `<id> AS (`
//! CTE head). An override that cannot be anchored is appended at the end of the document,
//! never dropped. Override code is always written verbatim.

use super::{AppliedOverride, CodeOverride};
use crate::constants::{BATCH_SEPARATOR, COMPONENT_MARKER};
use crate::format::OutputFormat;
use crate::generation::single_line;
use chrono::SecondsFormat;
use std::ops::Range;
use std::sync::Arc;

/// Applies locked overrides of one format to a generated document.
///
/// # Arguments
///
/// * `format` - Grammar of `code`; overrides of another format are ignored.
/// * `code` - Generated document.
/// * `overrides` - Overrides of the measure being generated, typically from
///   [`super::OverrideStore::overrides_for_measure`].
///
/// # Returns
///
/// The document with overrides applied and a summary banner prepended, plus one
/// [`AppliedOverride`] per override placed. The document is returned unchanged when no locked
/// override of `format` was given.
pub fn inject(
    format: OutputFormat,
    code: &str,
    overrides: &[Arc<CodeOverride>],
) -> (String, Vec<AppliedOverride>) {
    let active: Vec<&CodeOverride> = overrides
        .iter()
        .map(|o| o.as_ref())
        .filter(|o| o.locked && o.format == format)
        .collect();
    if active.is_empty() {
        return (code.to_string(), Vec::new());
    }

    let prefix = format.comment_prefix();
    let generated: Vec<&str> = code.lines().collect();
    let mut placed: Vec<(Range<usize>, &CodeOverride)> = Vec::new();
    let mut unanchored = Vec::new();
    let mut applied = Vec::new();

    for record in active {
        let block = find_anchor(&generated, format, &record.component_id)
            .map(|anchor| anchor.block(&generated, format))
            .filter(|block| {
                !placed
                    .iter()
                    .any(|(taken, _)| block.start < taken.end && taken.start < block.end)
            });
        match block {
            Some(block) => {
                tracing::debug!(component_id = %record.component_id, %format, "override anchored");
                placed.push((block, record));
            }
            None => {
                tracing::warn!(
                    measure_id = %record.measure_id,
                    component_id = %record.component_id,
                    %format,
                    "override anchor not found; appending at end of document"
                );
                unanchored.push(record);
            }
        }
        applied.push(AppliedOverride {
            component_id: record.component_id.clone(),
            anchored: block_is_placed(&placed, record),
        });
    }

    placed.sort_by_key(|(block, _)| block.start);
    let mut lines: Vec<String> = Vec::with_capacity(generated.len());
    let mut cursor = 0;
    for (block, record) in &placed {
        lines.extend(generated[cursor..block.start].iter().map(|l| l.to_string()));
        lines.extend(replacement_block(format, record, &generated[block.clone()]));
        cursor = block.end;
    }
    lines.extend(generated[cursor..].iter().map(|l| l.to_string()));

    for record in unanchored {
        lines.push(String::new());
        lines.push(format!("{prefix} OVERRIDE for: {}", record.component_id));
        lines.extend(note_lines(prefix, record));
        lines.push(verbatim(&record.code).to_string());
    }

    let mut document = banner(prefix, &applied);
    document.push('\n');
    document.push_str(&lines.join("\n"));
    if code.ends_with('\n') {
        document.push('\n');
    }
    (document, applied)
}

fn block_is_placed(placed: &[(Range<usize>, &CodeOverride)], record: &CodeOverride) -> bool {
    placed.iter().any(|(_, r)| std::ptr::eq(*r, record))
}

fn marker_prefix(format: OutputFormat, component_id: &str) -> String {
    format!("{} {COMPONENT_MARKER}{component_id}]", format.comment_prefix())
}

/// Where a component was found in a document.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Anchor {
    /// Line of the `[component:<id>]` marker.
    Marker(usize),
    /// Line of a `define "<id>"` statement or a `<id> AS (` CTE head.
    Name(usize),
}

impl Anchor {
    /// Line range replaced by the override.
    ///
    /// A generated block ends at the next blank line. A CTE found by name also ends where its
    /// parentheses close, since CTE chains need not be separated by blank lines.
    fn block(self, lines: &[&str], format: OutputFormat) -> Range<usize> {
        let (start, by_name) = match self {
            Self::Marker(start) => (start, false),
            Self::Name(start) => (start, true),
        };
        let blank = lines[start..]
            .iter()
            .position(|l| l.trim().is_empty())
            .map(|offset| start + offset)
            .unwrap_or(lines.len());
        if !(by_name && format == OutputFormat::Sql) {
            return start..blank;
        }
        let mut depth = 0i32;
        for (index, line) in lines.iter().enumerate().take(blank).skip(start) {
            depth += line.matches('(').count() as i32 - line.matches(')').count() as i32;
            if depth <= 0 && line.contains(')') {
                return start..index + 1;
            }
        }
        start..blank
    }
}

fn find_anchor(lines: &[&str], format: OutputFormat, component_id: &str) -> Option<Anchor> {
    let marker = marker_prefix(format, component_id);
    if let Some(index) = lines
        .iter()
        .position(|l| l.trim_start().starts_with(&marker))
    {
        return Some(Anchor::Marker(index));
    }
    let id = component_id.trim();
    lines
        .iter()
        .position(|line| {
            let line = line.trim_start();
            match format {
                OutputFormat::Cql => line
                    .strip_prefix("define ")
                    .is_some_and(|rest| rest.trim_start().starts_with(&format!("\"{id}\":"))),
                OutputFormat::Sql => line
                    .trim_start_matches(|c: char| c == ',' || c.is_whitespace())
                    .strip_prefix(id)
                    .is_some_and(is_cte_head_tail),
            }
        })
        .map(Anchor::Name)
}

/// True for the ` AS (` that follows a CTE name.
fn is_cte_head_tail(rest: &str) -> bool {
    if !rest.starts_with(char::is_whitespace) {
        return false;
    }
    let rest = rest.trim_start();
    match (rest.get(..2), rest.get(2..)) {
        (Some(keyword), Some(tail)) => {
            keyword.eq_ignore_ascii_case("AS") && tail.trim_start().starts_with('(')
        }
        _ => false,
    }
}

fn note_lines(prefix: &str, record: &CodeOverride) -> Vec<String> {
    record
        .notes
        .iter()
        .map(|note| {
            let when = note.created_at.to_rfc3339_opts(SecondsFormat::Secs, true);
            match note.change_type {
                Some(kind) => format!(
                    "{prefix} Note ({kind}, {when}): {}",
                    single_line(note.text.as_str())
                ),
                None => format!("{prefix} Note ({when}): {}", single_line(note.text.as_str())),
            }
        })
        .collect()
}

/// Override code as written, minus the single line break the document join adds back.
fn verbatim(code: &str) -> &str {
    code.strip_suffix("\r\n")
        .or_else(|| code.strip_suffix('\n'))
        .unwrap_or(code)
}

fn replacement_block(
    format: OutputFormat,
    record: &CodeOverride,
    original: &[&str],
) -> Vec<String> {
    let prefix = format.comment_prefix();
    let marker = marker_prefix(format, &record.component_id);
    let mut block = Vec::new();
    match original.first() {
        Some(first) if first.trim_start().starts_with(&marker) => block.push(first.to_string()),
        _ => block.push(marker),
    }
    block.push(format!("{prefix} MANUAL OVERRIDE"));
    block.extend(note_lines(prefix, record));
    block.push(verbatim(&record.code).to_string());
    if format == OutputFormat::Sql {
        block.extend(sql_terminators(original, &record.code));
    }
    block
}

/// Lines restoring the CTE-chain comma or batch separator of the replaced block when the
/// override code does not end with it.
fn sql_terminators(original: &[&str], code: &str) -> Option<String> {
    let last_original = original
        .iter()
        .rev()
        .map(|l| l.trim())
        .find(|l| !l.is_empty())?;
    let last_code = code.lines().rev().map(str::trim).find(|l| !l.is_empty());
    if last_original == BATCH_SEPARATOR {
        return (last_code != Some(BATCH_SEPARATOR)).then(|| BATCH_SEPARATOR.to_string());
    }
    let wants_comma = last_original.ends_with(',');
    let has_comma = last_code.is_some_and(|l| l.ends_with(','));
    (wants_comma && !has_comma).then(|| ",".to_string())
}

fn banner(prefix: &str, applied: &[AppliedOverride]) -> String {
    let rule = format!("{prefix} {}", "=".repeat(76));
    let mut lines = vec![
        rule.clone(),
        format!("{prefix} MANUAL OVERRIDES APPLIED: {}", applied.len()),
    ];
    for entry in applied {
        let placement = if entry.anchored {
            "replaced in place"
        } else {
            "appended at end"
        };
        lines.push(format!("{prefix}   - {} ({placement})", entry.component_id));
    }
    lines.push(rule);
    lines.push(String::new());
    lines.join("\n")
}
