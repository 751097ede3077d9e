//! Filtering and line scanning shared by both grep paths.
//!
//! Matches from an engine-side tool and from the built-in scan go through the
//! same [`SearchFilter`], so hidden-path and glob handling cannot drift apart.

use regex::Regex;
use std::path::Path;

use crate::engine::RawMatch;
use crate::pattern::PatternMatcher;
use crate::types::GrepMatch;

pub(crate) struct SearchFilter {
    root: String,
    root_is_file: bool,
    glob: Option<PatternMatcher>,
    ignore_hidden: bool,
}

impl SearchFilter {
    pub(crate) fn new(
        root: &str,
        root_is_file: bool,
        glob: Option<PatternMatcher>,
        ignore_hidden: bool,
    ) -> Self {
        Self {
            root: root.to_string(),
            root_is_file,
            glob,
            ignore_hidden,
        }
    }

    /// Path used for filtering: relative to the search root, or the file name
    /// when the root is itself a file.
    fn subject(&self, path: &str) -> Option<String> {
        if self.root_is_file {
            return path.rsplit('/').next().map(str::to_string);
        }
        relative_to(path, &self.root)
    }

    pub(crate) fn accepts(&self, path: &str) -> bool {
        let Some(subject) = self.subject(path) else {
            return false;
        };
        if self.ignore_hidden && is_hidden(&subject) {
            return false;
        }
        match &self.glob {
            Some(glob) => glob.is_match(&subject),
            None => true,
        }
    }
}

/// `path` relative to `root`, or `None` if it lies outside.
pub(crate) fn relative_to(path: &str, root: &str) -> Option<String> {
    let relative = pathdiff::diff_paths(Path::new(path), Path::new(root))?;
    let relative = relative.to_string_lossy().into_owned();
    if relative.starts_with("..") {
        return None;
    }
    Some(relative)
}

/// Any segment beginning with a dot.
pub(crate) fn is_hidden(relative: &str) -> bool {
    relative
        .split('/')
        .any(|segment| segment.starts_with('.') && segment != "." && segment != "..")
}

pub(crate) fn is_binary(content: &[u8]) -> bool {
    content.contains(&0)
}

/// Scan file content line by line. Binary files yield nothing.
pub(crate) fn scan(regex: &Regex, path: &str, content: &[u8]) -> Vec<GrepMatch> {
    if is_binary(content) {
        return Vec::new();
    }
    String::from_utf8_lossy(content)
        .lines()
        .enumerate()
        .filter(|(_, line)| regex.is_match(line))
        .map(|(i, line)| GrepMatch {
            path: path.to_string(),
            line_number: i + 1,
            line: line.to_string(),
        })
        .collect()
}

impl From<RawMatch> for GrepMatch {
    fn from(m: RawMatch) -> Self {
        GrepMatch {
            path: m.path,
            line_number: m.line_number,
            line: m.line,
        }
    }
}
