//! Diagnostics produced by the matching engine.
//!
//! Three things can go wrong during a parse, and they are kept strictly
//! apart. A routine PEG mismatch is not an error at all, just a `false`
//! return with all state rolled back. A syntactic problem in the *input* is
//! a [`ParseError`]: plain data collected by the reporting and recovering
//! runners. A problem in the *program*, such as an illegal engine call or a
//! failing semantic action, is a [`MatchError`] that aborts the parse.

use serde_derive::{Deserialize, Serialize};
use std::fmt;

use super::buffer::Position;

/// One step of a [`MatcherPath`]: the matcher's label and the input index it
/// started matching at.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PathElement {
    pub label: String,
    pub start_index: usize,
}

/// The chain of matchers from the grammar root down to a frame, used to tell
/// the user *where in the grammar* something happened.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct MatcherPath {
    pub elements: Vec<PathElement>,
}

impl MatcherPath {
    /// The label of the deepest matcher on the path.
    pub fn last_label(&self) -> Option<&str> {
        self.elements.last().map(|e| e.label.as_str())
    }
}

impl fmt::Display for MatcherPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, element) in self.elements.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            write!(f, "{}", element.label)?;
        }
        Ok(())
    }
}

/// A user-visible syntax error in the input, collected during reporting and
/// recovering runs.
///
/// This is data, not control flow: accumulating parse errors does not abort
/// the parse. `expected` holds the deduplicated labels of the terminal
/// matchers that could have matched at `index`; `paths` holds their full
/// matcher paths for tooling that wants more than the labels.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ParseError {
    /// Character index into the input the error is anchored at.
    pub index: usize,
    /// Line/column of `index` in the original input.
    pub position: Position,
    /// The offending character, or `None` when the input ended early.
    pub found: Option<char>,
    /// Labels of the matchers that were expected instead.
    pub expected: Vec<String>,
    /// Full matcher paths of the failed expectations.
    pub paths: Vec<MatcherPath>,
    /// An optional free-form message for errors with no located expectation.
    pub message: Option<String>,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.found {
            Some(c) => write!(f, "Invalid input '{}'", c.escape_default())?,
            None => write!(f, "Unexpected end of input")?,
        }
        if !self.expected.is_empty() {
            write!(f, ", expected one of: [{}]", self.expected.join(", "))?;
        }
        if let Some(ref message) = self.message {
            write!(f, ", {}", message)?;
        }
        write!(f, " ({})", self.position)
    }
}

impl std::error::Error for ParseError {}

/// A failure that aborts the parse: either a precondition violation in the
/// calling code or a semantic action failing with a host error.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum MatchError {
    /// An engine operation was called in a state it is not valid in, e.g.
    /// `get_match` outside a sequence action or node skipping reaching the
    /// root. These are programmer errors and are never caught internally.
    #[error("illegal call to {call}: {reason}")]
    IllegalUsage {
        call: &'static str,
        reason: String,
    },
    /// A semantic action failed with a host error. The failure is wrapped
    /// exactly once with the matcher path and input position; an error that
    /// is already a `MatchError` passes through unwrapped.
    #[error("error while running {path} at {position}: {source}")]
    Runtime {
        path: MatcherPath,
        index: usize,
        position: Position,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}
