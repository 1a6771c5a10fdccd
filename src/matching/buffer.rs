//! A random-access view of the text being parsed.
//!
//! All indices used by the matching engine are *character* indices into this
//! buffer, not byte offsets into the original string. Reads past the end
//! yield the [`EOI`] sentinel instead of failing, which lets matchers probe
//! ahead without bounds checks.

use once_cell::sync::OnceCell;
use serde_derive::{Deserialize, Serialize};
use std::fmt;

/// The end-of-input sentinel returned by [`InputBuffer::char_at`] for any
/// index at or past the end of the buffer.
pub const EOI: char = '\u{FFFF}';

/// A line/column pair, both 1-based, for error formatting.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

/// An immutable, fully materialized view of the source text.
///
/// The buffer is read-only for the duration of a parse and can be shared
/// freely between passes. Line information for [`position_of`] is computed
/// lazily on first use since it is only needed when formatting errors.
///
/// [`position_of`]: #method.position_of
#[derive(Debug)]
pub struct InputBuffer {
    chars: Vec<char>,
    line_starts: OnceCell<Vec<usize>>,
}

impl InputBuffer {
    pub fn new(text: &str) -> InputBuffer {
        InputBuffer {
            chars: text.chars().collect(),
            line_starts: OnceCell::new(),
        }
    }

    /// The number of characters in the buffer.
    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    /// Returns the character at `index`, or [`EOI`] for any index at or past
    /// the end.
    pub fn char_at(&self, index: usize) -> char {
        self.chars.get(index).copied().unwrap_or(EOI)
    }

    /// Extracts the text of the half-open range `[start, end)` as a `String`.
    ///
    /// The range is clamped to the buffer, so an end index past the last
    /// character simply extracts up to the end.
    pub fn extract(&self, start: usize, end: usize) -> String {
        let end = end.min(self.chars.len());
        let start = start.min(end);
        self.chars[start..end].iter().collect()
    }

    /// Returns the 1-based line/column position of `index`.
    ///
    /// Indices past the end report the position just after the last
    /// character, which is where end-of-input errors are anchored.
    pub fn position_of(&self, index: usize) -> Position {
        let starts = self.line_starts.get_or_init(|| {
            let mut starts = vec![0];
            for (i, &c) in self.chars.iter().enumerate() {
                if c == '\n' {
                    starts.push(i + 1);
                }
            }
            starts
        });
        let index = index.min(self.chars.len());
        let line = match starts.binary_search(&index) {
            Ok(line) => line,
            Err(insertion) => insertion - 1,
        };
        Position {
            line: line + 1,
            column: index - starts[line] + 1,
        }
    }
}
