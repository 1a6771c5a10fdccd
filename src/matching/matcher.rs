//! The matcher variants a grammar graph is built from.
//!
//! Matchers are pure data plus, for [`MatcherKind::Action`], a user closure.
//! They carry no run-specific state whatsoever, which is what allows one
//! grammar to serve any number of concurrent parses.

use bitflags::bitflags;
use std::fmt;
use std::sync::Arc;

use super::context::ActionContext;
use super::grammar::MatcherId;

bitflags! {
    /// Static per-matcher properties consulted when building the parse tree.
    pub struct MatcherFlags: u8 {
        /// No parse-tree node is created for this matcher or its descendants.
        const NODE_SUPPRESSED = 1 << 0;
        /// No node is created for this matcher itself; the nodes its
        /// sub-matchers produce attach to the nearest non-skipped ancestor.
        const NODE_SKIPPED = 1 << 1;
        /// Nodes of this matcher's descendants are suppressed, but not its own.
        const SUBNODES_SUPPRESSED = 1 << 2;
    }
}

/// The error type a semantic action may fail with. Failures are wrapped once
/// by the engine into [`MatchError::Runtime`] with the matcher path and input
/// position attached.
///
/// [`MatchError::Runtime`]: enum.MatchError.html#variant.Runtime
pub type ActionError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A semantic action: a user predicate that may inspect and mutate the value
/// stack through its [`ActionContext`]. Returning `Ok(false)` is an ordinary
/// mismatch; returning `Err` aborts the parse.
pub type ActionFn<V> =
    Arc<dyn Fn(&mut ActionContext<'_, '_, V>) -> Result<bool, ActionError> + Send + Sync>;

/// A set of characters for [`MatcherKind::AnyOf`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CharSet {
    chars: Vec<char>,
}

impl CharSet {
    pub fn new(chars: &str) -> CharSet {
        let mut chars: Vec<char> = chars.chars().collect();
        chars.sort_unstable();
        chars.dedup();
        CharSet { chars }
    }

    pub fn contains(&self, c: char) -> bool {
        self.chars.binary_search(&c).is_ok()
    }

    pub fn chars(&self) -> &[char] {
        &self.chars
    }
}

impl fmt::Display for CharSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for &c in &self.chars {
            write!(f, "{}", c.escape_default())?;
        }
        write!(f, "]")
    }
}

/// The closed set of matcher variants.
///
/// Composite variants reference their sub-matchers by [`MatcherId`] into the
/// grammar arena; the graph may be cyclic through [`Proxy`] entries.
///
/// [`Proxy`]: #variant.Proxy
pub enum MatcherKind<V> {
    /// Matches one character equal to the given one.
    Char(char),
    /// Matches one character contained in the set.
    AnyOf(CharSet),
    /// Matches one character in the inclusive range.
    CharRange(char, char),
    /// Matches any single character except end-of-input.
    Any,
    /// Matches a literal string. With fast string matching the literal is
    /// compared atomically; otherwise the pre-built `chars` sub-matchers are
    /// run as a sequence, which pins mismatches to the exact character.
    Str {
        literal: Vec<char>,
        chars: Vec<MatcherId>,
    },
    /// Matches every sub-matcher in order; fails on the first failure.
    Sequence(Vec<MatcherId>),
    /// Tries each sub-matcher in order and commits to the first success.
    FirstOf(Vec<MatcherId>),
    /// Greedily matches the sub-matcher as often as possible, at least once.
    OneOrMore(MatcherId),
    /// Greedily matches the sub-matcher as often as possible; never fails.
    ZeroOrMore(MatcherId),
    /// Attempts the sub-matcher once; never fails.
    Optional(MatcherId),
    /// Positive lookahead: succeeds iff the sub-matcher succeeds, consuming
    /// nothing and keeping no value-stack effects.
    Test(MatcherId),
    /// Negative lookahead: succeeds iff the sub-matcher fails.
    TestNot(MatcherId),
    /// Evaluates a user predicate against the value stack.
    Action(ActionFn<V>),
    /// Never matches.
    Nothing,
    /// Always matches without consuming anything.
    Empty,
    /// A forwarding placeholder used to express recursion while the grammar
    /// is under construction; resolved before the grammar is built.
    Proxy(Option<MatcherId>),
    /// Scopes the named local grammar variables around the inner matcher;
    /// otherwise transparent.
    VarFraming {
        inner: MatcherId,
        vars: Vec<String>,
    },
}

/// One node of the grammar graph: a [`MatcherKind`] with its label and
/// static flags.
pub struct Matcher<V> {
    label: String,
    flags: MatcherFlags,
    kind: MatcherKind<V>,
}

impl<V> Matcher<V> {
    pub(crate) fn new(label: String, flags: MatcherFlags, kind: MatcherKind<V>) -> Matcher<V> {
        Matcher { label, flags, kind }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind(&self) -> &MatcherKind<V> {
        &self.kind
    }

    pub fn flags(&self) -> MatcherFlags {
        self.flags
    }

    pub fn is_node_suppressed(&self) -> bool {
        self.flags.contains(MatcherFlags::NODE_SUPPRESSED)
    }

    pub fn is_node_skipped(&self) -> bool {
        self.flags.contains(MatcherFlags::NODE_SKIPPED)
    }

    pub fn are_subnodes_suppressed(&self) -> bool {
        self.flags.contains(MatcherFlags::SUBNODES_SUPPRESSED)
    }

    /// Whether this matcher directly inspects input characters. Terminal
    /// matchers are what error reporting names in its expected-set.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            MatcherKind::Char(_)
                | MatcherKind::AnyOf(_)
                | MatcherKind::CharRange(_, _)
                | MatcherKind::Any
                | MatcherKind::Str { .. }
                | MatcherKind::Nothing
        )
    }

    pub(crate) fn set_label(&mut self, label: String) {
        self.label = label;
    }

    pub(crate) fn add_flags(&mut self, flags: MatcherFlags) {
        self.flags |= flags;
    }

    pub(crate) fn kind_mut(&mut self) -> &mut MatcherKind<V> {
        &mut self.kind
    }

    /// Dispatches to the visitor method matching this matcher's variant.
    pub fn accept<M: MatcherVisitor<V>>(&self, visitor: &mut M) -> M::Output {
        match &self.kind {
            MatcherKind::Char(c) => visitor.visit_char(*c),
            MatcherKind::AnyOf(set) => visitor.visit_any_of(set),
            MatcherKind::CharRange(lo, hi) => visitor.visit_char_range(*lo, *hi),
            MatcherKind::Any => visitor.visit_any(),
            MatcherKind::Str { literal, chars } => visitor.visit_str(literal, chars),
            MatcherKind::Sequence(children) => visitor.visit_sequence(children),
            MatcherKind::FirstOf(children) => visitor.visit_first_of(children),
            MatcherKind::OneOrMore(child) => visitor.visit_one_or_more(*child),
            MatcherKind::ZeroOrMore(child) => visitor.visit_zero_or_more(*child),
            MatcherKind::Optional(child) => visitor.visit_optional(*child),
            MatcherKind::Test(child) => visitor.visit_test(*child),
            MatcherKind::TestNot(child) => visitor.visit_test_not(*child),
            MatcherKind::Action(_) => visitor.visit_action(),
            MatcherKind::Nothing => visitor.visit_nothing(),
            MatcherKind::Empty => visitor.visit_empty(),
            MatcherKind::Proxy(target) => visitor.visit_proxy(*target),
            MatcherKind::VarFraming { inner, vars } => visitor.visit_var_framing(*inner, vars),
        }
    }
}

impl<V> fmt::Debug for Matcher<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Matcher")
            .field("label", &self.label)
            .field("flags", &self.flags)
            .field("kind", &self.kind)
            .finish()
    }
}

impl<V> fmt::Debug for MatcherKind<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatcherKind::Char(c) => f.debug_tuple("Char").field(c).finish(),
            MatcherKind::AnyOf(set) => f.debug_tuple("AnyOf").field(set).finish(),
            MatcherKind::CharRange(lo, hi) => {
                f.debug_tuple("CharRange").field(lo).field(hi).finish()
            }
            MatcherKind::Any => write!(f, "Any"),
            MatcherKind::Str { literal, .. } => f.debug_tuple("Str").field(literal).finish(),
            MatcherKind::Sequence(children) => f.debug_tuple("Sequence").field(children).finish(),
            MatcherKind::FirstOf(children) => f.debug_tuple("FirstOf").field(children).finish(),
            MatcherKind::OneOrMore(child) => f.debug_tuple("OneOrMore").field(child).finish(),
            MatcherKind::ZeroOrMore(child) => f.debug_tuple("ZeroOrMore").field(child).finish(),
            MatcherKind::Optional(child) => f.debug_tuple("Optional").field(child).finish(),
            MatcherKind::Test(child) => f.debug_tuple("Test").field(child).finish(),
            MatcherKind::TestNot(child) => f.debug_tuple("TestNot").field(child).finish(),
            MatcherKind::Action(_) => write!(f, "Action"),
            MatcherKind::Nothing => write!(f, "Nothing"),
            MatcherKind::Empty => write!(f, "Empty"),
            MatcherKind::Proxy(target) => f.debug_tuple("Proxy").field(target).finish(),
            MatcherKind::VarFraming { inner, vars } => f
                .debug_struct("VarFraming")
                .field("inner", inner)
                .field("vars", vars)
                .finish(),
        }
    }
}

/// A visitor over the closed set of matcher variants, dispatched by
/// [`Matcher::accept`].
pub trait MatcherVisitor<V> {
    type Output;

    fn visit_char(&mut self, c: char) -> Self::Output;
    fn visit_any_of(&mut self, set: &CharSet) -> Self::Output;
    fn visit_char_range(&mut self, lo: char, hi: char) -> Self::Output;
    fn visit_any(&mut self) -> Self::Output;
    fn visit_str(&mut self, literal: &[char], chars: &[MatcherId]) -> Self::Output;
    fn visit_sequence(&mut self, children: &[MatcherId]) -> Self::Output;
    fn visit_first_of(&mut self, children: &[MatcherId]) -> Self::Output;
    fn visit_one_or_more(&mut self, child: MatcherId) -> Self::Output;
    fn visit_zero_or_more(&mut self, child: MatcherId) -> Self::Output;
    fn visit_optional(&mut self, child: MatcherId) -> Self::Output;
    fn visit_test(&mut self, child: MatcherId) -> Self::Output;
    fn visit_test_not(&mut self, child: MatcherId) -> Self::Output;
    fn visit_action(&mut self) -> Self::Output;
    fn visit_nothing(&mut self) -> Self::Output;
    fn visit_empty(&mut self) -> Self::Output;
    fn visit_proxy(&mut self, target: Option<MatcherId>) -> Self::Output;
    fn visit_var_framing(&mut self, inner: MatcherId, vars: &[String]) -> Self::Output;
}
