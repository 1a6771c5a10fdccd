//! The drivers that set up and execute complete parses.
//!
//! All runners borrow an immutable [`Grammar`] and build an independent
//! [`ParseRun`] per input, so one grammar can serve many parses at once.
//! They differ in how much work they invest into failures:
//!
//! * [`BasicParseRunner`]: one pass, no error analysis. Fastest; a failed
//!   parse tells you nothing beyond "no match".
//! * [`ReportingParseRunner`]: a basic pass first; only if that fails, two
//!   more passes locate the error and collect what was expected there.
//! * [`RecoveringParseRunner`]: repairs the input one character at a time,
//!   recording a [`ParseError`] per defect, until the parse goes through.
//!
//! Per the escalation rule, the first pass of every runner matches string
//! literals atomically; the error-oriented passes re-run with per-character
//! string matching so failure indices land on the exact character.

use serde_derive::{Deserialize, Serialize};

use super::buffer::{InputBuffer, EOI};
use super::context::ParseRun;
use super::errors::{MatchError, MatcherPath, ParseError};
use super::grammar::{Grammar, MatcherId};
use super::handler::{BasicMatchHandler, ErrorLocatingHandler, ErrorReportingHandler};
use super::stack::ValueStack;

/// A half-open character range `[start, end)` of the input.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, index: usize) -> bool {
        self.start <= index && index < self.end
    }
}

/// One node of the parse tree: the matcher that produced it, the input span
/// it covers, the value-stack top at creation time and the child nodes in
/// input order.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ParseNode<V> {
    pub matcher: MatcherId,
    pub label: String,
    pub span: Span,
    pub value: Option<V>,
    pub has_error: bool,
    pub children: Vec<ParseNode<V>>,
}

impl<V> ParseNode<V> {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// The input text this node covers.
    pub fn text(&self, input: &InputBuffer) -> String {
        input.extract(self.span.start, self.span.end)
    }

    /// The spans of the subtree's leaves, in subtree order.
    pub fn leaf_spans(&self) -> Vec<Span> {
        let mut spans = Vec::new();
        self.collect_leaf_spans(&mut spans);
        spans
    }

    fn collect_leaf_spans(&self, spans: &mut Vec<Span>) {
        if self.is_leaf() {
            spans.push(self.span);
        } else {
            for child in &self.children {
                child.collect_leaf_spans(spans);
            }
        }
    }

    /// The concatenated text of the subtree's leaves, in subtree order.
    pub fn leaf_text(&self, input: &InputBuffer) -> String {
        self.leaf_spans()
            .iter()
            .map(|span| input.extract(span.start, span.end))
            .collect()
    }
}

/// Everything a finished parse produced.
#[derive(Debug)]
pub struct ParseResult<V> {
    /// Whether the root matcher matched.
    pub matched: bool,
    /// The parse tree, when the root matched and was not node-suppressed.
    pub root_node: Option<ParseNode<V>>,
    /// The syntax errors collected by reporting/recovering runs.
    pub parse_errors: Vec<ParseError>,
    /// The final value stack.
    pub value_stack: ValueStack<V>,
    /// The top of the final value stack, if any.
    pub result_value: Option<V>,
}

fn finish_run<V: Clone>(mut run: ParseRun<'_, V>, matched: bool) -> ParseResult<V> {
    let root_node = if matched { run.take_root_node() } else { None };
    let parse_errors = run.take_parse_errors();
    let value_stack = run.into_stack();
    let result_value = value_stack.peek().cloned();
    ParseResult {
        matched,
        root_node,
        parse_errors,
        value_stack,
        result_value,
    }
}

fn unmatched_result<V: Clone>(parse_errors: Vec<ParseError>) -> ParseResult<V> {
    ParseResult {
        matched: false,
        root_node: None,
        parse_errors,
        value_stack: ValueStack::new(),
        result_value: None,
    }
}

/// Builds the error reported at `index` from the failed terminal paths the
/// reporting pass collected there.
fn invalid_input_error(
    input: &InputBuffer,
    index: usize,
    paths: Vec<MatcherPath>,
) -> ParseError {
    let found = match input.char_at(index) {
        EOI => None,
        c => Some(c),
    };
    let mut expected: Vec<String> = Vec::new();
    for path in &paths {
        if let Some(label) = path.last_label() {
            if !expected.iter().any(|e| e == label) {
                expected.push(label.to_string());
            }
        }
    }
    ParseError {
        index,
        position: input.position_of(index),
        found,
        expected,
        paths,
        message: None,
    }
}

fn unlocatable_error(input: &InputBuffer) -> ParseError {
    ParseError {
        index: 0,
        position: input.position_of(0),
        found: match input.char_at(0) {
            EOI => None,
            c => Some(c),
        },
        expected: Vec::new(),
        paths: Vec::new(),
        message: Some("the input does not match the grammar".to_string()),
    }
}

/// The single-pass runner: fast string matching on, no error collection.
pub struct BasicParseRunner<'g, V> {
    grammar: &'g Grammar<V>,
}

impl<'g, V: Clone> BasicParseRunner<'g, V> {
    pub fn new(grammar: &'g Grammar<V>) -> BasicParseRunner<'g, V> {
        BasicParseRunner { grammar }
    }

    pub fn run(&self, input: &str) -> Result<ParseResult<V>, MatchError> {
        let buffer = InputBuffer::new(input);
        self.run_buffer(&buffer)
    }

    pub fn run_buffer(&self, buffer: &InputBuffer) -> Result<ParseResult<V>, MatchError> {
        let mut run = ParseRun::new(self.grammar, buffer, true);
        let mut handler = BasicMatchHandler;
        let matched = run.run(&mut handler)?;
        Ok(finish_run(run, matched))
    }
}

/// The two-stage runner: a basic pass, escalating on failure to a locating
/// pass and a reporting pass that produce a single [`ParseError`] describing
/// the deepest failure.
pub struct ReportingParseRunner<'g, V> {
    grammar: &'g Grammar<V>,
}

impl<'g, V: Clone> ReportingParseRunner<'g, V> {
    pub fn new(grammar: &'g Grammar<V>) -> ReportingParseRunner<'g, V> {
        ReportingParseRunner { grammar }
    }

    pub fn run(&self, input: &str) -> Result<ParseResult<V>, MatchError> {
        let buffer = InputBuffer::new(input);
        self.run_buffer(&buffer)
    }

    pub fn run_buffer(&self, buffer: &InputBuffer) -> Result<ParseResult<V>, MatchError> {
        {
            let mut run = ParseRun::new(self.grammar, buffer, true);
            let mut handler = BasicMatchHandler;
            if run.run(&mut handler)? {
                return Ok(finish_run(run, true));
            }
        }

        let mut locating = ErrorLocatingHandler::new();
        {
            let mut run = ParseRun::new(self.grammar, buffer, false);
            if run.run(&mut locating)? {
                // a parse that only succeeds with slow string matching would
                // be a grammar inconsistency; accept it rather than lie
                return Ok(finish_run(run, true));
            }
        }
        let error_index = match locating.error_index() {
            Some(index) => index,
            None => {
                // every failure was inside a predicate; there is no
                // expectation to report, just the bare mismatch
                return Ok(unmatched_result(vec![unlocatable_error(buffer)]));
            }
        };

        let mut reporting = ErrorReportingHandler::new(error_index);
        let mut run = ParseRun::new(self.grammar, buffer, false);
        let matched = run.run(&mut reporting)?;
        let error = invalid_input_error(buffer, error_index, reporting.into_failed_paths());
        run.push_parse_error(error);
        Ok(finish_run(run, matched))
    }
}

/// The error-recovering runner.
///
/// Each round runs the grammar over a working copy of the input; on failure
/// the error is located and reported exactly like [`ReportingParseRunner`]
/// does, then the offending character is deleted from the working copy and
/// the parse retried. Error positions are always reported against the
/// *original* input. When a repaired copy finally matches, the result is
/// `matched` with the accumulated errors and an error-marked tree, so
/// `root.has_error` agrees with `!parse_errors.is_empty()`.
///
/// Recovery by resynchronization rules is a concern of richer embedding
/// hosts; deletion is the strategy this runner ships.
pub struct RecoveringParseRunner<'g, V> {
    grammar: &'g Grammar<V>,
}

impl<'g, V: Clone> RecoveringParseRunner<'g, V> {
    pub fn new(grammar: &'g Grammar<V>) -> RecoveringParseRunner<'g, V> {
        RecoveringParseRunner { grammar }
    }

    pub fn run(&self, input: &str) -> Result<ParseResult<V>, MatchError> {
        let original = InputBuffer::new(input);
        let mut working: Vec<char> = input.chars().collect();
        // original indices of the characters deleted so far, ascending
        let mut deleted: Vec<usize> = Vec::new();
        // error anchors in (current) working-copy coordinates, for marking
        // the final tree
        let mut error_marks: Vec<usize> = Vec::new();
        let mut parse_errors: Vec<ParseError> = Vec::new();

        loop {
            let text: String = working.iter().collect();
            let buffer = InputBuffer::new(&text);

            {
                let fast = parse_errors.is_empty();
                let mut run = ParseRun::new(self.grammar, &buffer, fast);
                let mut handler = BasicMatchHandler;
                if run.run(&mut handler)? {
                    let mut result = finish_run(run, true);
                    if !parse_errors.is_empty() {
                        if let Some(root) = result.root_node.as_mut() {
                            mark_error_spans(root, &error_marks);
                            root.has_error = true;
                        }
                    }
                    result.parse_errors = parse_errors;
                    return Ok(result);
                }
            }

            let mut locating = ErrorLocatingHandler::new();
            {
                let mut run = ParseRun::new(self.grammar, &buffer, false);
                run.run(&mut locating)?;
            }
            let working_index = match locating.error_index() {
                Some(index) => index,
                None => {
                    parse_errors.push(unlocatable_error(&original));
                    return Ok(unmatched_result(parse_errors));
                }
            };

            let mut reporting = ErrorReportingHandler::new(working_index);
            {
                let mut run = ParseRun::new(self.grammar, &buffer, false);
                run.run(&mut reporting)?;
            }
            let original_index = map_to_original(working_index, &deleted);
            parse_errors.push(invalid_input_error(
                &original,
                original_index,
                reporting.into_failed_paths(),
            ));

            if working_index >= working.len() {
                // the failure is at end of input: nothing left to delete
                return Ok(unmatched_result(parse_errors));
            }

            working.remove(working_index);
            match deleted.binary_search(&original_index) {
                Ok(_) => {
                    // deleting the same original character twice cannot
                    // happen; bail out rather than loop
                    return Ok(unmatched_result(parse_errors));
                }
                Err(pos) => deleted.insert(pos, original_index),
            }
            for mark in error_marks.iter_mut() {
                if *mark > working_index {
                    *mark -= 1;
                }
            }
            error_marks.push(working_index);
        }
    }
}

/// Maps an index in the working copy back to the original input, accounting
/// for every character deleted before it.
fn map_to_original(working_index: usize, deleted: &[usize]) -> usize {
    let mut original = working_index;
    for &d in deleted {
        if d <= original {
            original += 1;
        } else {
            break;
        }
    }
    original
}

/// Error-marks every node whose span contains one of the anchors, plus all
/// its ancestors.
fn mark_error_spans<V>(node: &mut ParseNode<V>, marks: &[usize]) -> bool {
    let mut hit = marks.iter().any(|&mark| node.span.contains(mark));
    for child in node.children.iter_mut() {
        if mark_error_spans(child, marks) {
            hit = true;
        }
    }
    if hit {
        node.has_error = true;
    }
    hit
}
