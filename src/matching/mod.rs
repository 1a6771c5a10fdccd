//! Everything for running a parsing expression grammar against a text:
//! building the matcher graph, executing it with backtracking, evaluating
//! semantic actions against the value stack, and reporting or recovering
//! from syntax errors.
//!
//! The usual flow is: assemble a [`Grammar`] with a [`GrammarBuilder`], then
//! hand it together with the input to one of the runners:
//! [`BasicParseRunner`] for a plain matched/unmatched answer,
//! [`ReportingParseRunner`] for a described syntax error, or
//! [`RecoveringParseRunner`] to parse past defects. The [`ParseResult`]
//! carries the parse tree, the collected errors and the final value stack.

pub mod buffer;
pub mod context;
pub mod errors;
pub mod grammar;
pub mod handler;
pub mod matcher;
pub mod runner;
pub mod stack;

pub use self::buffer::{InputBuffer, Position, EOI};
pub use self::context::{ActionContext, ParseRun};
pub use self::errors::{MatchError, MatcherPath, ParseError, PathElement};
pub use self::grammar::{Grammar, GrammarBuilder, GrammarError, MatcherId};
pub use self::handler::{
    BasicMatchHandler, ErrorLocatingHandler, ErrorReportingHandler, MatchHandler,
};
pub use self::matcher::{
    ActionError, ActionFn, CharSet, Matcher, MatcherFlags, MatcherKind, MatcherVisitor,
};
pub use self::runner::{
    BasicParseRunner, ParseNode, ParseResult, RecoveringParseRunner, ReportingParseRunner, Span,
};
pub use self::stack::{Snapshot, ValueStack};
