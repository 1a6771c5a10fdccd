//! The arena holding a grammar's matcher graph.
//!
//! Recursion makes the matcher graph cyclic, so matchers do not own each
//! other: they all live in a [`Grammar`] arena and reference one another by
//! [`MatcherId`]. Cycles are expressed while building through [`proxy`]
//! placeholders that are resolved to their targets before [`build`] seals
//! the grammar; after building, the arena is immutable and can be shared by
//! any number of concurrent parses.
//!
//! [`proxy`]: struct.GrammarBuilder.html#method.proxy
//! [`build`]: struct.GrammarBuilder.html#method.build

use fnv::FnvHashMap;
use serde_derive::{Deserialize, Serialize};

use super::context::ActionContext;
use super::matcher::{ActionError, CharSet, Matcher, MatcherFlags, MatcherKind, MatcherVisitor};

/// An opaque handle to a [`Matcher`] within its [`Grammar`].
///
/// Ids are only meaningful for the grammar that issued them; using one
/// against a different grammar yields nonsense.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct MatcherId(pub(crate) usize);

/// Errors detected when sealing a grammar with [`GrammarBuilder::build`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum GrammarError {
    /// A proxy was created but never resolved to a target matcher.
    #[error("grammar contains the unresolved proxy '{0}'")]
    UnresolvedProxy(String),
    /// The root matcher is marked node-skipped, which would leave its
    /// sub-nodes with no ancestor to attach to.
    #[error("the root matcher '{0}' must not be node-skipped")]
    SkippedRoot(String),
    /// A repetition loops over a sub-matcher that can succeed without
    /// consuming input and would never terminate.
    #[error("matcher '{0}' repeats a sub-matcher that can match without consuming input")]
    RepeatedEmptyMatch(String),
}

/// An immutable, linked grammar: the matcher arena plus the root.
///
/// Build one with a [`GrammarBuilder`]. The grammar carries no run-specific
/// state, so one instance can back concurrent parses on multiple threads.
#[derive(Debug)]
pub struct Grammar<V> {
    matchers: Vec<Matcher<V>>,
    root: MatcherId,
}

impl<V> Grammar<V> {
    /// The matcher behind `id`.
    pub fn matcher(&self, id: MatcherId) -> &Matcher<V> {
        &self.matchers[id.0]
    }

    /// The root matcher the grammar was built with.
    pub fn root(&self) -> MatcherId {
        self.root
    }

    /// The number of matchers in the arena, hidden `Str` sub-matchers
    /// included.
    pub fn matcher_count(&self) -> usize {
        self.matchers.len()
    }

    /// Follows proxy forwards until a non-proxy matcher is reached.
    /// Idempotent.
    pub fn unwrap_proxies(&self, id: MatcherId) -> MatcherId {
        unwrap_proxies_in(&self.matchers, id)
    }

    /// Follows both proxy forwards and variable framings to the underlying
    /// matcher. This is the unwrapping identity checks use; it is idempotent,
    /// and the two unwrapping steps commute.
    pub fn unwrap(&self, id: MatcherId) -> MatcherId {
        let mut id = id;
        loop {
            match self.matchers[id.0].kind() {
                MatcherKind::Proxy(Some(target)) => id = *target,
                MatcherKind::VarFraming { inner, .. } => id = *inner,
                _ => return id,
            }
        }
    }
}

fn unwrap_proxies_in<V>(matchers: &[Matcher<V>], id: MatcherId) -> MatcherId {
    let mut id = id;
    while let MatcherKind::Proxy(Some(target)) = matchers[id.0].kind() {
        id = *target;
    }
    id
}

/// Builds a [`Grammar`] by allocating matchers into the arena.
///
/// Every constructor returns the [`MatcherId`] of the new matcher; composite
/// constructors take the ids of their sub-matchers. Recursive rules are tied
/// with [`proxy`]/[`resolve_proxy`]. Labels and node-construction flags can
/// be adjusted after the fact with the decorator methods.
///
/// ```
/// use pegmatite::matching::GrammarBuilder;
///
/// let mut b = GrammarBuilder::<()>::new();
/// let digit = b.char_range('0', '9');
/// let number = b.one_or_more(digit);
/// b.label(number, "Number");
/// let grammar = b.build(number).unwrap();
/// assert_eq!(grammar.matcher(grammar.root()).label(), "Number");
/// ```
///
/// [`proxy`]: #method.proxy
/// [`resolve_proxy`]: #method.resolve_proxy
pub struct GrammarBuilder<V> {
    matchers: Vec<Matcher<V>>,
    // Char matchers backing string literals are interned so that "true" and
    // "trace" share their 't'/'r'/'e' sub-matchers.
    literal_chars: FnvHashMap<char, MatcherId>,
}

impl<V> GrammarBuilder<V> {
    pub fn new() -> GrammarBuilder<V> {
        GrammarBuilder {
            matchers: Vec::new(),
            literal_chars: FnvHashMap::default(),
        }
    }

    fn push(&mut self, label: String, flags: MatcherFlags, kind: MatcherKind<V>) -> MatcherId {
        let id = MatcherId(self.matchers.len());
        self.matchers.push(Matcher::new(label, flags, kind));
        id
    }

    /// A matcher for the single character `c`.
    pub fn ch(&mut self, c: char) -> MatcherId {
        self.push(
            format!("'{}'", c.escape_default()),
            MatcherFlags::empty(),
            MatcherKind::Char(c),
        )
    }

    /// A matcher for end-of-input.
    pub fn eoi(&mut self) -> MatcherId {
        self.push(
            "EOI".to_string(),
            MatcherFlags::empty(),
            MatcherKind::Char(super::buffer::EOI),
        )
    }

    /// A matcher for any single character contained in `chars`.
    pub fn any_of(&mut self, chars: &str) -> MatcherId {
        let set = CharSet::new(chars);
        self.push(set.to_string(), MatcherFlags::empty(), MatcherKind::AnyOf(set))
    }

    /// A matcher for any single character in the inclusive range `lo..=hi`.
    pub fn char_range(&mut self, lo: char, hi: char) -> MatcherId {
        self.push(
            format!("{}..{}", lo.escape_default(), hi.escape_default()),
            MatcherFlags::empty(),
            MatcherKind::CharRange(lo, hi),
        )
    }

    /// A matcher for any single character except end-of-input.
    pub fn any(&mut self) -> MatcherId {
        self.push("ANY".to_string(), MatcherFlags::empty(), MatcherKind::Any)
    }

    /// A matcher for the literal string `s`.
    pub fn string(&mut self, s: &str) -> MatcherId {
        let literal: Vec<char> = s.chars().collect();
        let chars: Vec<MatcherId> = literal.iter().map(|&c| self.literal_char(c)).collect();
        self.push(
            format!("\"{}\"", s.escape_default()),
            MatcherFlags::empty(),
            MatcherKind::Str { literal, chars },
        )
    }

    fn literal_char(&mut self, c: char) -> MatcherId {
        if let Some(&id) = self.literal_chars.get(&c) {
            return id;
        }
        let id = self.ch(c);
        self.literal_chars.insert(c, id);
        id
    }

    /// A matcher running each of `children` in order.
    pub fn sequence(&mut self, children: Vec<MatcherId>) -> MatcherId {
        self.push(
            "Sequence".to_string(),
            MatcherFlags::empty(),
            MatcherKind::Sequence(children),
        )
    }

    /// A matcher committing to the first of `children` that matches.
    pub fn first_of(&mut self, children: Vec<MatcherId>) -> MatcherId {
        self.push(
            "FirstOf".to_string(),
            MatcherFlags::empty(),
            MatcherKind::FirstOf(children),
        )
    }

    /// A greedy one-or-more repetition of `child`.
    pub fn one_or_more(&mut self, child: MatcherId) -> MatcherId {
        self.push(
            "OneOrMore".to_string(),
            MatcherFlags::empty(),
            MatcherKind::OneOrMore(child),
        )
    }

    /// A greedy zero-or-more repetition of `child`.
    pub fn zero_or_more(&mut self, child: MatcherId) -> MatcherId {
        self.push(
            "ZeroOrMore".to_string(),
            MatcherFlags::empty(),
            MatcherKind::ZeroOrMore(child),
        )
    }

    /// An optional occurrence of `child`.
    pub fn optional(&mut self, child: MatcherId) -> MatcherId {
        self.push(
            "Optional".to_string(),
            MatcherFlags::empty(),
            MatcherKind::Optional(child),
        )
    }

    /// A positive lookahead on `child`.
    pub fn test(&mut self, child: MatcherId) -> MatcherId {
        // predicate sub-parses never contribute parse-tree nodes
        self.push(
            "Test".to_string(),
            MatcherFlags::SUBNODES_SUPPRESSED,
            MatcherKind::Test(child),
        )
    }

    /// A negative lookahead on `child`.
    pub fn test_not(&mut self, child: MatcherId) -> MatcherId {
        self.push(
            "TestNot".to_string(),
            MatcherFlags::SUBNODES_SUPPRESSED,
            MatcherKind::TestNot(child),
        )
    }

    /// A semantic action evaluating `f` against the value stack.
    pub fn action<F>(&mut self, label: &str, f: F) -> MatcherId
    where
        F: Fn(&mut ActionContext<'_, '_, V>) -> Result<bool, ActionError>
            + Send
            + Sync
            + 'static,
    {
        self.push(
            label.to_string(),
            MatcherFlags::empty(),
            MatcherKind::Action(std::sync::Arc::new(f)),
        )
    }

    /// A matcher that never matches.
    pub fn nothing(&mut self) -> MatcherId {
        self.push("NOTHING".to_string(), MatcherFlags::empty(), MatcherKind::Nothing)
    }

    /// A matcher that always matches without consuming input.
    pub fn empty(&mut self) -> MatcherId {
        self.push("EMPTY".to_string(), MatcherFlags::empty(), MatcherKind::Empty)
    }

    /// A forwarding placeholder for a rule that is not built yet, letting
    /// recursive rules reference themselves. Must be resolved with
    /// [`resolve_proxy`] before [`build`].
    ///
    /// [`resolve_proxy`]: #method.resolve_proxy
    /// [`build`]: #method.build
    pub fn proxy(&mut self, label: &str) -> MatcherId {
        self.push(label.to_string(), MatcherFlags::empty(), MatcherKind::Proxy(None))
    }

    /// Points the proxy at its target matcher.
    ///
    /// # Panics
    ///
    /// Panics if `proxy` does not name a proxy created by [`proxy`], since
    /// that is a grammar-construction bug.
    ///
    /// [`proxy`]: #method.proxy
    pub fn resolve_proxy(&mut self, proxy: MatcherId, target: MatcherId) {
        match self.matchers[proxy.0].kind_mut() {
            MatcherKind::Proxy(slot) => *slot = Some(target),
            _ => panic!(
                "resolve_proxy called on '{}', which is not a proxy",
                self.matchers[proxy.0].label()
            ),
        }
    }

    /// Scopes the named local grammar variables around `inner`. The variable
    /// frames live on the parse run; actions under `inner` reach them through
    /// `ActionContext::get_var`/`set_var`.
    pub fn var_framing(&mut self, inner: MatcherId, vars: Vec<String>) -> MatcherId {
        let label = self.matchers[inner.0].label().to_string();
        self.push(label, MatcherFlags::empty(), MatcherKind::VarFraming { inner, vars })
    }

    /// Renames the matcher. Returns `id` for chaining.
    pub fn label(&mut self, id: MatcherId, label: &str) -> MatcherId {
        self.matchers[id.0].set_label(label.to_string());
        id
    }

    /// Suppresses parse-tree nodes for the matcher and everything under it.
    pub fn suppress_node(&mut self, id: MatcherId) -> MatcherId {
        self.matchers[id.0].add_flags(MatcherFlags::NODE_SUPPRESSED);
        id
    }

    /// Suppresses parse-tree nodes for the matcher's descendants only.
    pub fn suppress_subnodes(&mut self, id: MatcherId) -> MatcherId {
        self.matchers[id.0].add_flags(MatcherFlags::SUBNODES_SUPPRESSED);
        id
    }

    /// Skips the matcher's own node: nodes of its sub-matchers attach to the
    /// nearest non-skipped ancestor instead.
    pub fn skip_node(&mut self, id: MatcherId) -> MatcherId {
        self.matchers[id.0].add_flags(MatcherFlags::NODE_SKIPPED);
        id
    }

    /// Seals the grammar with `root` as its start matcher.
    ///
    /// Verifies that every proxy has been resolved, that the root is not
    /// node-skipped, and that no repetition loops over a sub-matcher that
    /// can succeed on empty input.
    pub fn build(self, root: MatcherId) -> Result<Grammar<V>, GrammarError> {
        for matcher in &self.matchers {
            if let MatcherKind::Proxy(None) = matcher.kind() {
                return Err(GrammarError::UnresolvedProxy(matcher.label().to_string()));
            }
        }

        let resolved_root = unwrap_proxies_in(&self.matchers, root);
        if self.matchers[resolved_root.0].is_node_skipped() {
            return Err(GrammarError::SkippedRoot(
                self.matchers[resolved_root.0].label().to_string(),
            ));
        }

        let mut analysis = CanMatchEmpty {
            matchers: &self.matchers,
            visiting: vec![false; self.matchers.len()],
        };
        for matcher in &self.matchers {
            let child = match *matcher.kind() {
                MatcherKind::OneOrMore(child) | MatcherKind::ZeroOrMore(child) => child,
                _ => continue,
            };
            if analysis.check(child) {
                return Err(GrammarError::RepeatedEmptyMatch(matcher.label().to_string()));
            }
        }

        Ok(Grammar {
            matchers: self.matchers,
            root,
        })
    }
}

impl<V> Default for GrammarBuilder<V> {
    fn default() -> GrammarBuilder<V> {
        GrammarBuilder::new()
    }
}

/// Decides whether a matcher can succeed without consuming any input.
///
/// Conservative on recursion: a cycle is treated as consuming, since a
/// recursive rule has to consume something before re-entering itself.
struct CanMatchEmpty<'g, V> {
    matchers: &'g [Matcher<V>],
    visiting: Vec<bool>,
}

impl<'g, V> CanMatchEmpty<'g, V> {
    fn check(&mut self, id: MatcherId) -> bool {
        if self.visiting[id.0] {
            return false;
        }
        self.visiting[id.0] = true;
        let matchers = self.matchers;
        let result = matchers[id.0].accept(self);
        self.visiting[id.0] = false;
        result
    }
}

impl<'g, V> MatcherVisitor<V> for CanMatchEmpty<'g, V> {
    type Output = bool;

    fn visit_char(&mut self, _c: char) -> bool {
        false
    }

    fn visit_any_of(&mut self, _set: &CharSet) -> bool {
        false
    }

    fn visit_char_range(&mut self, _lo: char, _hi: char) -> bool {
        false
    }

    fn visit_any(&mut self) -> bool {
        false
    }

    fn visit_str(&mut self, literal: &[char], _chars: &[MatcherId]) -> bool {
        literal.is_empty()
    }

    fn visit_sequence(&mut self, children: &[MatcherId]) -> bool {
        children.iter().all(|&c| self.check(c))
    }

    fn visit_first_of(&mut self, children: &[MatcherId]) -> bool {
        children.iter().any(|&c| self.check(c))
    }

    fn visit_one_or_more(&mut self, child: MatcherId) -> bool {
        self.check(child)
    }

    fn visit_zero_or_more(&mut self, _child: MatcherId) -> bool {
        true
    }

    fn visit_optional(&mut self, _child: MatcherId) -> bool {
        true
    }

    fn visit_test(&mut self, _child: MatcherId) -> bool {
        true
    }

    fn visit_test_not(&mut self, _child: MatcherId) -> bool {
        true
    }

    fn visit_action(&mut self) -> bool {
        true
    }

    fn visit_nothing(&mut self) -> bool {
        false
    }

    fn visit_empty(&mut self) -> bool {
        true
    }

    fn visit_proxy(&mut self, target: Option<MatcherId>) -> bool {
        match target {
            Some(target) => self.check(target),
            None => false,
        }
    }

    fn visit_var_framing(&mut self, inner: MatcherId, _vars: &[String]) -> bool {
        self.check(inner)
    }
}
