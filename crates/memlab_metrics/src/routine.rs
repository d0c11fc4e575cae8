//! Identity and source text of a profiled routine

use std::fmt;
use std::ops::Range;

/// Stable identity of a routine: where it is defined and what it is called.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RoutineId {
    file: String,
    line: u32,
    name: String,
}

impl RoutineId {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn line(&self) -> u32 {
        self.line
    }
}

impl fmt::Display for RoutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.name, self.file, self.line)
    }
}

/// A routine that can be profiled.
///
/// Without a line count only visited lines show up in reports. With one,
/// every line of the routine gets a row and unvisited lines stay blank.
#[derive(Clone, Debug)]
pub struct Routine {
    id: RoutineId,
    line_count: Option<u32>,
    source: Vec<String>,
}

impl Routine {
    pub fn new(name: impl Into<String>, file: impl Into<String>, first_line: u32) -> Self {
        Self {
            id: RoutineId {
                file: file.into(),
                line: first_line,
                name: name.into(),
            },
            line_count: None,
            source: Vec::new(),
        }
    }

    /// A routine whose whole source is `snippet`, starting at line 1.
    pub fn from_snippet(name: impl Into<String>, snippet: &str) -> Self {
        let lines = snippet.lines().count() as u32;
        Self::new(name, "<snippet>", 1)
            .with_line_count(lines)
            .with_source(snippet)
    }

    pub fn with_line_count(mut self, count: u32) -> Self {
        self.line_count = Some(count);
        self
    }

    /// Attach the text of the file the routine lives in; line 1 is the first line of `text`.
    pub fn with_source(mut self, text: &str) -> Self {
        self.source = text.lines().map(str::to_string).collect();
        self
    }

    pub fn id(&self) -> &RoutineId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.id.name
    }

    pub fn first_line(&self) -> u32 {
        self.id.line
    }

    /// Lines spanned by the routine, empty when the line count is unknown.
    pub fn lines(&self) -> Range<u32> {
        let start = self.id.line;
        start..start + self.line_count.unwrap_or(0)
    }

    /// Source text of `line`, if known.
    pub fn line_text(&self, line: u32) -> Option<&str> {
        let index = line.checked_sub(1)? as usize;
        self.source.get(index).map(String::as_str)
    }
}
