//! Plan sections of `explain` cases.
//!
//! A plan section is a named rendering of an execution tree, one node per line:
//!
//! ```text
//! physical_plan
//! 01)ProjectionExec: expr=[a@0 as a]
//! 02)--FilterExec: a@0 > 1
//! 03)----DataSourceExec: file_groups={1 group: [[WORKSPACE_ROOT/t.parquet]]}
//! ```
//!
//! Each line starts with its 1-based number and a marker repeated once per level of depth.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const LOGICAL_PLAN: &str = "logical_plan";
pub const PHYSICAL_PLAN: &str = "physical_plan";

/// The marker written once per level of tree depth.
pub const DEPTH_MARKER: &str = "--";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSection {
    pub name: String,
    pub lines: Vec<String>,
}

impl PlanSection {
    pub fn new(name: impl Into<String>, lines: Vec<String>) -> Self {
        Self {
            name: name.into(),
            lines,
        }
    }
}

impl fmt::Display for PlanSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for line in &self.lines {
            write!(f, "\n{line}")?;
        }
        Ok(())
    }
}

/// Whether a line of an expectation block names a plan section.
pub fn is_section_header(line: &str) -> bool {
    let mut chars = line.chars();
    chars.next().is_some_and(|c| c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Renders sections as they appear in a test file, one line per string.
pub fn render_sections(sections: &[PlanSection]) -> Vec<String> {
    sections
        .iter()
        .flat_map(|s| std::iter::once(s.name.clone()).chain(s.lines.iter().cloned()))
        .collect()
}

/// Turns a tree indented with whitespace into numbered lines with depth markers.
///
/// The depth of a line is the number of enclosing lines with a smaller indentation. Leading
/// `->` arrows, as printed by Postgres, are dropped. Blank lines are ignored.
pub fn number_tree_lines<'a>(tree: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut widths: Vec<usize> = vec![];
    let mut lines = vec![];
    for line in tree {
        let body = line.trim_start();
        if body.is_empty() {
            continue;
        }
        let indent = line.len() - body.len();
        while widths.last().is_some_and(|&w| w >= indent) {
            widths.pop();
        }
        let depth = widths.len();
        widths.push(indent);

        let body = body.strip_prefix("->").map(str::trim_start).unwrap_or(body);
        lines.push(format!(
            "{:02}){}{}",
            lines.len() + 1,
            DEPTH_MARKER.repeat(depth),
            body.trim_end()
        ));
    }
    lines
}
