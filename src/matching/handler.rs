//! The strategy seam between a frame and its matcher.
//!
//! Every frame executes its matcher through a [`MatchHandler`], which is
//! what lets the runners swap in progressively more error-aware behavior
//! without the engine knowing: the basic handler calls straight through,
//! while the locating and reporting handlers observe failures on the way
//! out to pinpoint and describe syntax errors.

use super::context::ParseRun;
use super::errors::{MatchError, MatcherPath};

/// Executes the matcher of one frame.
///
/// Implementations must run the frame's matcher exactly once per invocation
/// (via [`ParseRun::execute_matcher`]) and must not leak position or
/// value-stack mutations on a `false` result: the calling frame takes care
/// of the value-stack restore, and a handler must not bypass that by
/// erroring instead of returning `false`.
///
/// [`ParseRun::execute_matcher`]: struct.ParseRun.html#method.execute_matcher
pub trait MatchHandler<V> {
    fn match_frame(
        &mut self,
        run: &mut ParseRun<'_, V>,
        level: usize,
    ) -> Result<bool, MatchError>;
}

/// The plain strategy: dispatch to the matcher, nothing else.
#[derive(Clone, Copy, Debug, Default)]
pub struct BasicMatchHandler;

impl<V: Clone> MatchHandler<V> for BasicMatchHandler {
    fn match_frame(
        &mut self,
        run: &mut ParseRun<'_, V>,
        level: usize,
    ) -> Result<bool, MatchError> {
        run.execute_matcher(self, level)
    }
}

/// Finds the input index of the deepest mismatch of a failed parse.
///
/// Failures inside `Test`/`TestNot` sub-parses don't count: a failing
/// lookahead is how predicates *succeed*, not a syntax error.
#[derive(Debug, Default)]
pub struct ErrorLocatingHandler {
    error_index: Option<usize>,
}

impl ErrorLocatingHandler {
    pub fn new() -> ErrorLocatingHandler {
        ErrorLocatingHandler { error_index: None }
    }

    /// The furthest input index a matcher failed at, if any failure was seen
    /// outside predicates.
    pub fn error_index(&self) -> Option<usize> {
        self.error_index
    }
}

impl<V: Clone> MatchHandler<V> for ErrorLocatingHandler {
    fn match_frame(
        &mut self,
        run: &mut ParseRun<'_, V>,
        level: usize,
    ) -> Result<bool, MatchError> {
        let matched = run.execute_matcher(self, level)?;
        if !matched && !run.in_predicate(level) {
            let index = run.frame_current_index(level);
            if self.error_index.map_or(true, |furthest| index > furthest) {
                self.error_index = Some(index);
            }
        }
        Ok(matched)
    }
}

/// Collects what was *expected* at a previously located error index: the
/// matcher paths of every terminal matcher that fails starting exactly
/// there, outside predicates. Frames recorded this way are error-marked so
/// the flag propagates to the root.
#[derive(Debug)]
pub struct ErrorReportingHandler {
    error_index: usize,
    failed_paths: Vec<MatcherPath>,
}

impl ErrorReportingHandler {
    pub fn new(error_index: usize) -> ErrorReportingHandler {
        ErrorReportingHandler {
            error_index,
            failed_paths: Vec::new(),
        }
    }

    pub fn failed_paths(&self) -> &[MatcherPath] {
        &self.failed_paths
    }

    pub fn into_failed_paths(self) -> Vec<MatcherPath> {
        self.failed_paths
    }
}

impl<V: Clone> MatchHandler<V> for ErrorReportingHandler {
    fn match_frame(
        &mut self,
        run: &mut ParseRun<'_, V>,
        level: usize,
    ) -> Result<bool, MatchError> {
        let matched = run.execute_matcher(self, level)?;
        if !matched
            && run.frame_start_index(level) == self.error_index
            && !run.in_predicate(level)
        {
            let is_terminal = run
                .frame_matcher(level)
                .map(|id| run.grammar().matcher(id).is_terminal())
                .unwrap_or(false);
            if is_terminal {
                run.mark_error(level);
                let path = run.matcher_path(level);
                if !self.failed_paths.contains(&path) {
                    self.failed_paths.push(path);
                }
            }
        }
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::buffer::InputBuffer;
    use crate::matching::grammar::GrammarBuilder;

    #[test]
    fn locating_handler_finds_the_deepest_failure() {
        // "abc" "de" against "abcdx" fails on the 'e', four characters in
        let mut b = GrammarBuilder::<()>::new();
        let abc = b.string("abc");
        let de = b.string("de");
        let seq = b.sequence(vec![abc, de]);
        let grammar = b.build(seq).unwrap();
        let input = InputBuffer::new("abcdx");

        let mut handler = ErrorLocatingHandler::new();
        let mut run = crate::matching::ParseRun::new(&grammar, &input, false);
        assert!(!run.run(&mut handler).unwrap());
        assert_eq!(handler.error_index(), Some(4));
    }

    #[test]
    fn locating_handler_ignores_predicate_failures() {
        // TestNot('x') ANY: on "a" the inner 'x' failure is what makes the
        // parse succeed and must not register as an error
        let mut b = GrammarBuilder::<()>::new();
        let x = b.ch('x');
        let not_x = b.test_not(x);
        let any = b.any();
        let seq = b.sequence(vec![not_x, any]);
        let grammar = b.build(seq).unwrap();
        let input = InputBuffer::new("a");

        let mut handler = ErrorLocatingHandler::new();
        let mut run = crate::matching::ParseRun::new(&grammar, &input, false);
        assert!(run.run(&mut handler).unwrap());
        assert_eq!(handler.error_index(), None);
    }

    #[test]
    fn reporting_handler_collects_terminal_paths_and_marks_the_root() {
        let mut b = GrammarBuilder::<()>::new();
        let a = b.string("apple");
        let o = b.string("orange");
        let alt = b.first_of(vec![a, o]);
        b.label(alt, "Fruit");
        let grammar = b.build(alt).unwrap();
        let input = InputBuffer::new("pear");

        let mut handler = ErrorReportingHandler::new(0);
        let mut run = crate::matching::ParseRun::new(&grammar, &input, false);
        assert!(!run.run(&mut handler).unwrap());
        assert!(run.root_has_error());

        let labels: Vec<_> = handler
            .failed_paths()
            .iter()
            .filter_map(|p| p.last_label())
            .collect();
        assert!(labels.contains(&"'a'"));
        assert!(labels.contains(&"'o'"));
    }
}
