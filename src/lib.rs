//! Welcome to the pegmatite docs.
//!
//! Pegmatite is the execution core of a PEG (parsing expression grammar)
//! runtime: you assemble a grammar as a graph of composable matchers, point
//! a runner at some text, and get back whether it matched, a parse tree,
//! any collected syntax errors and the value stack your semantic actions
//! built up.
//!
//! Almost everything lives in the [`matching`] module; a good place to
//! start is the docs for [`matching::GrammarBuilder`] and the runners in
//! [`matching::runner`]. The [`util`] module has helpers for dumping parse
//! trees while debugging a grammar.
//!
//! ```
//! use pegmatite::matching::{GrammarBuilder, ReportingParseRunner};
//!
//! // Greeting = "hello" (' ' "world")?
//! let mut b = GrammarBuilder::<()>::new();
//! let hello = b.string("hello");
//! let space = b.ch(' ');
//! let world = b.string("world");
//! let rest = b.sequence(vec![space, world]);
//! let opt_rest = b.optional(rest);
//! let greeting = b.sequence(vec![hello, opt_rest]);
//! b.label(greeting, "Greeting");
//! let grammar = b.build(greeting).unwrap();
//!
//! let result = ReportingParseRunner::new(&grammar).run("hello world").unwrap();
//! assert!(result.matched);
//! assert_eq!(result.root_node.unwrap().label, "Greeting");
//! ```
//!
//! [`matching`]: matching/index.html
//! [`matching::GrammarBuilder`]: matching/struct.GrammarBuilder.html
//! [`matching::runner`]: matching/runner/index.html
//! [`util`]: util/index.html

#![doc(html_root_url = "https://docs.rs/pegmatite/0.1.0")]

#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;

pub mod matching;
pub mod util;
