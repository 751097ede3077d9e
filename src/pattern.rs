//! Glob-style pattern matching for permission rules, `glob` and grep filters.
//!
//! Supported syntax:
//! - `*` matches any run of characters except `/`
//! - `**` matches any run of characters including `/`; `**/` also matches zero
//!   directories, so `**/*.env` matches both `/a/.env` and `.env`
//! - `?` matches one character except `/`
//! - `[abc]`, `[a-z]` match a character class, `[!abc]` excludes one
//!
//! Matching is anchored at both ends and case-sensitive. Command strings are
//! matched as literal text, so `rm -rf *` is a plain pattern over the command.

use regex::Regex;

use crate::error::{Error, Result};

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    pattern: String,
    regex: Regex,
}

impl PatternMatcher {
    pub fn new(pattern: &str) -> Result<Self> {
        let source = glob_to_regex_string(pattern)?;
        let regex = Regex::new(&source).map_err(|e| Error::invalid_pattern(pattern, e))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    pub fn is_match(&self, target: &str) -> bool {
        self.regex.is_match(target)
    }
}

/// One-shot match. Invalid patterns never match.
pub fn matches(pattern: &str, target: &str) -> bool {
    PatternMatcher::new(pattern)
        .map(|m| m.is_match(target))
        .unwrap_or(false)
}

fn glob_to_regex_string(glob: &str) -> Result<String> {
    let chars: Vec<char> = glob.chars().collect();
    let mut regex = String::with_capacity(glob.len() * 2 + 2);
    regex.push('^');
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    regex.push_str("(?s:(?:.*/)?)");
                    i += 3;
                } else {
                    regex.push_str("(?s:.*)");
                    i += 2;
                }
            }
            '*' => {
                regex.push_str("[^/]*");
                i += 1;
            }
            '?' => {
                regex.push_str("[^/]");
                i += 1;
            }
            '[' => {
                let (class, next) = translate_class(glob, &chars, i)?;
                regex.push_str(&class);
                i = next;
            }
            c => {
                let mut buf = [0u8; 4];
                regex.push_str(&regex::escape(c.encode_utf8(&mut buf)));
                i += 1;
            }
        }
    }

    regex.push('$');
    Ok(regex)
}

/// Translate the class starting at `start` (which holds `[`). Returns the
/// regex fragment and the index just past the closing `]`.
fn translate_class(glob: &str, chars: &[char], start: usize) -> Result<(String, usize)> {
    let mut j = start + 1;
    let negated = matches!(chars.get(j), Some('!') | Some('^'));
    if negated {
        j += 1;
    }

    let body_start = j;
    // A `]` right after the opening bracket is a literal member.
    if chars.get(j) == Some(&']') {
        j += 1;
    }
    while j < chars.len() && chars[j] != ']' {
        j += 1;
    }
    if j >= chars.len() {
        return Err(Error::invalid_pattern(
            glob,
            format!("unclosed character class at position {}", start),
        ));
    }

    let mut class = String::from("[");
    if negated {
        class.push('^');
    }
    for &c in &chars[body_start..j] {
        match c {
            // Range dashes stay meaningful; everything with a special meaning
            // inside a regex class is escaped.
            '\\' | '[' | ']' | '&' | '~' | '^' => {
                class.push('\\');
                class.push(c);
            }
            _ => class.push(c),
        }
    }
    class.push(']');
    Ok((class, j + 1))
}
