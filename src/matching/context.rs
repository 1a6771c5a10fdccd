//! The matcher-context machine: the execution core of a parse.
//!
//! To understand the implementation, here's an overview of how a parse
//! actually runs.
//!
//! A [`ParseRun`] holds everything one parse mutates: a list of frames, the
//! value stack, the collected parse errors and the local-variable store. The
//! frame list is the call stack of the parse: `frames[0]` belongs to the
//! root matcher, `frames[1]` to whichever sub-matcher it is currently
//! running, and so on. A frame at depth N is allocated the first time the
//! parse reaches depth N and is then *reused* for every sibling that later
//! runs at that depth: entering a sub-matcher just reinitializes the frame's
//! per-invocation fields. A parse that nests D matchers deep therefore
//! allocates D+1 frames total, no matter how much input it churns through.
//!
//! A frame is *active* while its matcher is set. [`run_matcher`] snapshots
//! the value stack, asks the match handler to execute the frame's matcher,
//! and then settles the outcome: on success the frame's input position is
//! propagated into the parent, on failure the value stack is rolled back to
//! the snapshot. Either way the frame is *retired* (its matcher cleared) and
//! left in place for the next sibling. Backtracking is therefore O(1): a
//! failed sub-match simply never propagated anything, and the stack restore
//! is a pointer assignment.
//!
//! Semantic actions get a deliberately different frame initialization: an
//! action's frame keeps the span fields of the sibling that last used the
//! slot, which is what lets the action read that sibling's matched text
//! through [`ActionContext::get_match`].
//!
//! [`run_matcher`]: struct.ParseRun.html#method.run
//! [`ActionContext::get_match`]: struct.ActionContext.html#method.get_match

use fnv::FnvHashMap;

use super::buffer::{InputBuffer, Position, EOI};
use super::errors::{MatchError, MatcherPath, ParseError, PathElement};
use super::grammar::{Grammar, MatcherId};
use super::handler::MatchHandler;
use super::matcher::{ActionError, MatcherKind};
use super::runner::{ParseNode, Span};
use super::stack::ValueStack;

/// Per-depth execution state; see the module docs.
pub(crate) struct Frame<V> {
    /// The matcher currently running in this frame; `None` once retired.
    matcher: Option<MatcherId>,
    start_index: usize,
    current_index: usize,
    current_char: char,
    /// The built parse tree; only ever set on the root frame.
    node: Option<ParseNode<V>>,
    /// Span of the node this frame most recently built, kept across the
    /// basic (action) reinitialization for `get_match` under errors.
    node_span: Option<Span>,
    sub_nodes: SubNodes<V>,
    /// Matcher-private counter; a sequence keeps the number of completed
    /// elder siblings here while a child runs.
    int_tag: usize,
    has_error: bool,
    node_suppressed: bool,
}

impl<V> Frame<V> {
    fn unused() -> Frame<V> {
        Frame {
            matcher: None,
            start_index: 0,
            current_index: 0,
            current_char: EOI,
            node: None,
            node_span: None,
            sub_nodes: SubNodes::Empty,
            int_tag: 0,
            has_error: false,
            node_suppressed: false,
        }
    }
}

/// Accumulated child nodes of a frame. Most frames collect zero or one node,
/// so the first insertion is stored inline and the representation promotes
/// to a growable buffer on the second.
pub(crate) enum SubNodes<V> {
    Empty,
    One(ParseNode<V>),
    Many(Vec<ParseNode<V>>),
}

impl<V> SubNodes<V> {
    fn push(&mut self, node: ParseNode<V>) {
        match std::mem::replace(self, SubNodes::Empty) {
            SubNodes::Empty => *self = SubNodes::One(node),
            SubNodes::One(first) => *self = SubNodes::Many(vec![first, node]),
            SubNodes::Many(mut nodes) => {
                nodes.push(node);
                *self = SubNodes::Many(nodes);
            }
        }
    }

    fn take_all(&mut self) -> Vec<ParseNode<V>> {
        match std::mem::replace(self, SubNodes::Empty) {
            SubNodes::Empty => Vec::new(),
            SubNodes::One(node) => vec![node],
            SubNodes::Many(nodes) => nodes,
        }
    }
}

/// One parse in progress: the frame list plus all state shared by the
/// frames.
///
/// A `ParseRun` borrows its grammar and input immutably, so any number of
/// runs over the same grammar can be live at once (on the same thread or on
/// many). Most callers never touch this type directly and go through the
/// runners in [`runner`]; it is public for match-handler implementations,
/// which receive it in [`MatchHandler::match_frame`].
///
/// [`runner`]: ../runner/index.html
/// [`MatchHandler::match_frame`]: trait.MatchHandler.html#tymethod.match_frame
pub struct ParseRun<'a, V> {
    grammar: &'a Grammar<V>,
    input: &'a InputBuffer,
    frames: Vec<Frame<V>>,
    stack: ValueStack<V>,
    errors: Vec<ParseError>,
    vars: FnvHashMap<String, Vec<Option<V>>>,
    fast_string_matching: bool,
}

impl<'a, V: Clone> ParseRun<'a, V> {
    /// Sets up a run with the root frame initialized at input position 0.
    ///
    /// `fast_string_matching` selects whether `Str` matchers compare their
    /// literal atomically or descend into per-character sub-matchers;
    /// error-oriented passes use the slow mode to pin failures to the exact
    /// character.
    pub fn new(
        grammar: &'a Grammar<V>,
        input: &'a InputBuffer,
        fast_string_matching: bool,
    ) -> ParseRun<'a, V> {
        let root = grammar.unwrap_proxies(grammar.root());
        let root_frame = Frame {
            matcher: Some(root),
            start_index: 0,
            current_index: 0,
            current_char: input.char_at(0),
            node: None,
            node_span: None,
            sub_nodes: SubNodes::Empty,
            int_tag: 0,
            has_error: false,
            node_suppressed: grammar.matcher(root).is_node_suppressed(),
        };
        ParseRun {
            grammar,
            input,
            frames: vec![root_frame],
            stack: ValueStack::new(),
            errors: Vec::new(),
            vars: FnvHashMap::default(),
            fast_string_matching,
        }
    }

    /// Runs the root matcher through `handler` and reports whether it
    /// matched.
    pub fn run(&mut self, handler: &mut dyn MatchHandler<V>) -> Result<bool, MatchError> {
        self.run_matcher(handler, 0)
    }

    pub fn grammar(&self) -> &'a Grammar<V> {
        self.grammar
    }

    pub fn input(&self) -> &'a InputBuffer {
        self.input
    }

    pub fn fast_string_matching(&self) -> bool {
        self.fast_string_matching
    }

    /// The matcher the frame at `level` is currently running, if the frame
    /// is active.
    pub fn frame_matcher(&self, level: usize) -> Option<MatcherId> {
        self.frames[level].matcher
    }

    pub fn frame_start_index(&self, level: usize) -> usize {
        self.frames[level].start_index
    }

    pub fn frame_current_index(&self, level: usize) -> usize {
        self.frames[level].current_index
    }

    /// Whether the root frame has been error-marked.
    pub fn root_has_error(&self) -> bool {
        self.frames[0].has_error
    }

    /// True when the frame at `level` or any of its ancestors is a predicate
    /// (`Test`/`TestNot`) sub-parse.
    pub fn in_predicate(&self, level: usize) -> bool {
        for l in (0..=level).rev() {
            if let Some(id) = self.frames[l].matcher {
                match self.grammar.matcher(id).kind() {
                    MatcherKind::Test(_) | MatcherKind::TestNot(_) => return true,
                    _ => {}
                }
            }
        }
        false
    }

    /// Error-marks the frame at `level` and all its ancestors, stopping at
    /// the first frame already marked.
    pub fn mark_error(&mut self, level: usize) {
        let mut l = level;
        loop {
            if self.frames[l].has_error {
                break;
            }
            self.frames[l].has_error = true;
            if l == 0 {
                break;
            }
            l -= 1;
        }
    }

    /// Clears node suppression on the frame at `level` and keeps clearing
    /// upward as long as each ancestor was suppressed.
    pub fn clear_node_suppression(&mut self, level: usize) {
        let mut l = level;
        loop {
            if !self.frames[l].node_suppressed {
                break;
            }
            self.frames[l].node_suppressed = false;
            if l == 0 {
                break;
            }
            l -= 1;
        }
    }

    /// The chain of active matchers from the root down to `level`.
    pub fn matcher_path(&self, level: usize) -> MatcherPath {
        let elements = (0..=level.min(self.frames.len() - 1))
            .filter_map(|l| {
                let frame = &self.frames[l];
                frame.matcher.map(|id| PathElement {
                    label: self.grammar.matcher(id).label().to_string(),
                    start_index: frame.start_index,
                })
            })
            .collect();
        MatcherPath { elements }
    }

    /// Records a parse error on the run's shared error list.
    pub fn push_parse_error(&mut self, error: ParseError) {
        self.errors.push(error);
    }

    pub fn parse_errors(&self) -> &[ParseError] {
        &self.errors
    }

    pub(crate) fn take_parse_errors(&mut self) -> Vec<ParseError> {
        std::mem::replace(&mut self.errors, Vec::new())
    }

    /// Removes and returns the parse tree built by the root matcher, if one
    /// was built.
    pub fn take_root_node(&mut self) -> Option<ParseNode<V>> {
        self.frames[0].node.take()
    }

    /// Consumes the run, yielding the final value stack.
    pub fn into_stack(self) -> ValueStack<V> {
        self.stack
    }

    /// Executes the frame at `level`: snapshots the value stack, dispatches
    /// the frame's matcher through `handler`, and settles the outcome. On
    /// success the input position propagates into the parent frame; on
    /// failure the value stack is restored. The frame is retired either way.
    pub(crate) fn run_matcher(
        &mut self,
        handler: &mut dyn MatchHandler<V>,
        level: usize,
    ) -> Result<bool, MatchError> {
        let snapshot = self.stack.take_snapshot();
        let matched = handler.match_frame(self, level)?;
        if matched {
            if level > 0 {
                let (current_index, current_char) = {
                    let frame = &self.frames[level];
                    (frame.current_index, frame.current_char)
                };
                let parent = &mut self.frames[level - 1];
                parent.current_index = current_index;
                parent.current_char = current_char;
            }
        } else {
            self.stack.restore_snapshot(snapshot);
        }
        self.frames[level].matcher = None;
        Ok(matched)
    }

    /// Runs the matching algorithm of the frame's matcher. Handlers call
    /// this exactly once per [`MatchHandler::match_frame`] invocation,
    /// wrapping it with whatever bookkeeping they need.
    ///
    /// [`MatchHandler::match_frame`]: trait.MatchHandler.html#tymethod.match_frame
    pub fn execute_matcher(
        &mut self,
        handler: &mut dyn MatchHandler<V>,
        level: usize,
    ) -> Result<bool, MatchError> {
        let id = match self.frames[level].matcher {
            Some(id) => id,
            None => {
                return Err(MatchError::IllegalUsage {
                    call: "execute_matcher",
                    reason: "the frame has already been retired".to_string(),
                });
            }
        };
        self.dispatch(handler, level, id)
    }

    fn dispatch(
        &mut self,
        handler: &mut dyn MatchHandler<V>,
        level: usize,
        id: MatcherId,
    ) -> Result<bool, MatchError> {
        let g = self.grammar;
        match g.matcher(id).kind() {
            MatcherKind::Char(c) => {
                if self.frames[level].current_char == *c {
                    self.advance_index(level, 1);
                    self.create_node(level)?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            MatcherKind::AnyOf(set) => {
                let current = self.frames[level].current_char;
                if current != EOI && set.contains(current) {
                    self.advance_index(level, 1);
                    self.create_node(level)?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            MatcherKind::CharRange(lo, hi) => {
                let current = self.frames[level].current_char;
                if current != EOI && *lo <= current && current <= *hi {
                    self.advance_index(level, 1);
                    self.create_node(level)?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            MatcherKind::Any => {
                if self.frames[level].current_char != EOI {
                    self.advance_index(level, 1);
                    self.create_node(level)?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            MatcherKind::Str { literal, chars } => {
                if self.fast_string_matching {
                    let start = self.frames[level].current_index;
                    let matches = literal
                        .iter()
                        .enumerate()
                        .all(|(i, &c)| self.input.char_at(start + i) == c);
                    if matches {
                        self.advance_index(level, literal.len());
                        self.create_node(level)?;
                        Ok(true)
                    } else {
                        Ok(false)
                    }
                } else {
                    self.match_sequence(handler, level, chars)
                }
            }
            MatcherKind::Sequence(children) => self.match_sequence(handler, level, children),
            MatcherKind::FirstOf(children) => {
                for &child in children {
                    let child_level = self.acquire_sub_context(level, child);
                    if self.run_matcher(handler, child_level)? {
                        self.create_node(level)?;
                        return Ok(true);
                    }
                    // position and value stack are already back where they
                    // were; just try the next alternative
                }
                Ok(false)
            }
            MatcherKind::OneOrMore(child) => {
                let child = *child;
                let child_level = self.acquire_sub_context(level, child);
                if !self.run_matcher(handler, child_level)? {
                    return Ok(false);
                }
                self.repeat_from_current(handler, level, child)?;
                self.create_node(level)?;
                Ok(true)
            }
            MatcherKind::ZeroOrMore(child) => {
                let child = *child;
                self.repeat_from_current(handler, level, child)?;
                self.create_node(level)?;
                Ok(true)
            }
            MatcherKind::Optional(child) => {
                let child_level = self.acquire_sub_context(level, *child);
                self.run_matcher(handler, child_level)?;
                self.create_node(level)?;
                Ok(true)
            }
            MatcherKind::Test(child) => {
                let saved_index = self.frames[level].current_index;
                let snapshot = self.stack.take_snapshot();
                let child_level = self.acquire_sub_context(level, *child);
                let matched = self.run_matcher(handler, child_level)?;
                // reset any progress the lookahead made
                self.set_current_index(level, saved_index);
                self.stack.restore_snapshot(snapshot);
                Ok(matched)
            }
            MatcherKind::TestNot(child) => {
                let saved_index = self.frames[level].current_index;
                let snapshot = self.stack.take_snapshot();
                let child_level = self.acquire_sub_context(level, *child);
                let matched = self.run_matcher(handler, child_level)?;
                self.set_current_index(level, saved_index);
                self.stack.restore_snapshot(snapshot);
                Ok(!matched)
            }
            MatcherKind::Action(f) => {
                // the action context is anchored at the parent frame, so the
                // predicate sees the enclosing matcher's state
                let anchor = if level == 0 { 0 } else { level - 1 };
                let outcome = {
                    let mut ctx = ActionContext {
                        run: &mut *self,
                        level: anchor,
                    };
                    (**f)(&mut ctx)
                };
                match outcome {
                    Ok(result) => Ok(result),
                    Err(source) => Err(self.wrap_action_failure(source, level)),
                }
            }
            MatcherKind::Nothing => Ok(false),
            MatcherKind::Empty => {
                self.create_node(level)?;
                Ok(true)
            }
            MatcherKind::Proxy(target) => match target {
                Some(target) => {
                    let resolved = g.unwrap_proxies(*target);
                    self.frames[level].matcher = Some(resolved);
                    self.dispatch(handler, level, resolved)
                }
                None => Err(MatchError::IllegalUsage {
                    call: "execute_matcher",
                    reason: format!("the proxy '{}' was never resolved", g.matcher(id).label()),
                }),
            },
            MatcherKind::VarFraming { inner, vars } => {
                for name in vars {
                    self.vars
                        .entry(name.clone())
                        .or_insert_with(Vec::new)
                        .push(None);
                }
                // the framing is transparent from here on: the frame behaves
                // as the framed matcher
                let inner = g.unwrap_proxies(*inner);
                self.frames[level].matcher = Some(inner);
                let result = self.dispatch(handler, level, inner);
                for name in vars {
                    if let Some(frames) = self.vars.get_mut(name) {
                        frames.pop();
                    }
                }
                result
            }
        }
    }

    fn match_sequence(
        &mut self,
        handler: &mut dyn MatchHandler<V>,
        level: usize,
        children: &[MatcherId],
    ) -> Result<bool, MatchError> {
        for (i, &child) in children.iter().enumerate() {
            // the number of completed elder siblings, observable by actions
            self.frames[level].int_tag = i;
            let child_level = self.acquire_sub_context(level, child);
            if !self.run_matcher(handler, child_level)? {
                return Ok(false);
            }
        }
        self.create_node(level)?;
        Ok(true)
    }

    /// The shared tail of both repetitions: greedily re-runs `child` from
    /// the frame's current position, stopping on the first failure or on a
    /// match that consumed nothing (which would otherwise loop forever).
    fn repeat_from_current(
        &mut self,
        handler: &mut dyn MatchHandler<V>,
        level: usize,
        child: MatcherId,
    ) -> Result<(), MatchError> {
        let mut last_index = self.frames[level].current_index;
        loop {
            let child_level = self.acquire_sub_context(level, child);
            if !self.run_matcher(handler, child_level)? {
                break;
            }
            let current = self.frames[level].current_index;
            if current == last_index {
                break;
            }
            last_index = current;
        }
        Ok(())
    }

    /// Acquires the reusable child frame for `child`. Actions keep the
    /// previous occupant's span fields (see the module docs); everything
    /// else gets a full reinitialization.
    fn acquire_sub_context(&mut self, level: usize, child: MatcherId) -> usize {
        let g = self.grammar;
        let resolved = g.unwrap_proxies(child);
        match g.matcher(resolved).kind() {
            MatcherKind::Action(_) => self.get_basic_sub_context(level, resolved),
            _ => self.get_sub_context(level, resolved),
        }
    }

    /// Fully reinitializes the child frame for `matcher`: the child starts
    /// where the parent currently is, with suppression inherited from the
    /// parent's own flag, the parent matcher's sub-node suppression and the
    /// child matcher's node suppression.
    fn get_sub_context(&mut self, level: usize, matcher: MatcherId) -> usize {
        let g = self.grammar;
        let child_level = level + 1;
        self.ensure_frame(child_level);
        let (current_index, current_char, parent_suppressed, parent_matcher) = {
            let frame = &self.frames[level];
            (
                frame.current_index,
                frame.current_char,
                frame.node_suppressed,
                frame.matcher,
            )
        };
        let suppressed = parent_suppressed
            || parent_matcher
                .map(|id| g.matcher(id).are_subnodes_suppressed())
                .unwrap_or(false)
            || g.matcher(matcher).is_node_suppressed();
        let child = &mut self.frames[child_level];
        child.matcher = Some(matcher);
        child.start_index = current_index;
        child.current_index = current_index;
        child.current_char = current_char;
        child.node = None;
        child.node_span = None;
        child.sub_nodes = SubNodes::Empty;
        child.int_tag = 0;
        child.has_error = false;
        child.node_suppressed = suppressed;
        child_level
    }

    /// The reduced reinitialization used for action frames: only the matcher
    /// is set and the input position synced; the span fields of the sibling
    /// that last used the slot stay put for `get_match`.
    fn get_basic_sub_context(&mut self, level: usize, matcher: MatcherId) -> usize {
        let child_level = level + 1;
        self.ensure_frame(child_level);
        let (current_index, current_char) = {
            let frame = &self.frames[level];
            (frame.current_index, frame.current_char)
        };
        let child = &mut self.frames[child_level];
        child.matcher = Some(matcher);
        child.current_index = current_index;
        child.current_char = current_char;
        child_level
    }

    fn ensure_frame(&mut self, level: usize) {
        while self.frames.len() <= level {
            self.frames.push(Frame::unused());
        }
    }

    /// Sets the frame's input position and refreshes its current character.
    pub fn set_current_index(&mut self, level: usize, index: usize) {
        let input = self.input;
        let frame = &mut self.frames[level];
        frame.current_index = index;
        frame.current_char = input.char_at(index);
    }

    /// Sets the frame's match start position.
    pub fn set_start_index(&mut self, level: usize, index: usize) {
        self.frames[level].start_index = index;
    }

    /// Appends a finished child node to the frame's sub-node list.
    pub(crate) fn add_child_node(&mut self, level: usize, node: ParseNode<V>) {
        self.frames[level].sub_nodes.push(node);
    }

    /// Advances the frame's input position by `delta` characters, unless the
    /// frame is already at end-of-input.
    pub fn advance_index(&mut self, level: usize, delta: usize) {
        let input = self.input;
        let frame = &mut self.frames[level];
        if frame.current_char != EOI {
            frame.current_index += delta;
            frame.current_char = input.char_at(frame.current_index);
        }
    }

    /// Builds the parse-tree node for the frame at `level` and attaches it
    /// to the nearest non-skipped ancestor, unless node construction is
    /// suppressed or skipped for this frame.
    pub(crate) fn create_node(&mut self, level: usize) -> Result<(), MatchError> {
        let g = self.grammar;
        let id = match self.frames[level].matcher {
            Some(id) => id,
            None => return Ok(()),
        };
        let matcher = g.matcher(id);
        if self.frames[level].node_suppressed || matcher.is_node_skipped() {
            return Ok(());
        }
        let (start, end, has_error) = {
            let frame = &self.frames[level];
            (frame.start_index, frame.current_index, frame.has_error)
        };
        let value = self.stack.peek().cloned();
        let children = self.frames[level].sub_nodes.take_all();
        let span = Span { start, end };
        self.frames[level].node_span = Some(span);
        let node = ParseNode {
            matcher: id,
            label: matcher.label().to_string(),
            span,
            value,
            has_error,
            children,
        };
        if level == 0 {
            self.frames[0].node = Some(node);
            return Ok(());
        }
        let mut target = level - 1;
        loop {
            let skipped = self.frames[target]
                .matcher
                .map(|id| g.matcher(id).is_node_skipped())
                .unwrap_or(false);
            if !skipped {
                break;
            }
            if target == 0 {
                return Err(MatchError::IllegalUsage {
                    call: "create_node",
                    reason: "node skipping reached the root".to_string(),
                });
            }
            target -= 1;
        }
        self.add_child_node(target, node);
        Ok(())
    }

    fn wrap_action_failure(&self, source: ActionError, level: usize) -> MatchError {
        // an already-wrapped failure passes through verbatim
        match source.downcast::<MatchError>() {
            Ok(already_wrapped) => *already_wrapped,
            Err(source) => {
                let index = self.frames[level].current_index;
                MatchError::Runtime {
                    path: self.matcher_path(level),
                    index,
                    position: self.input.position_of(index),
                    source,
                }
            }
        }
    }
}

/// The view of the running parse handed to semantic actions.
///
/// The context is anchored at the frame of the sequence (or other composite)
/// directly enclosing the action, so `current_index` and friends report that
/// frame's state. The `get_match` family reads the text matched by the
/// action's preceding sibling; it is only valid in actions that are not the
/// first element of their enclosing [`Sequence`].
///
/// [`Sequence`]: enum.MatcherKind.html#variant.Sequence
pub struct ActionContext<'r, 'a, V> {
    run: &'r mut ParseRun<'a, V>,
    level: usize,
}

impl<'r, 'a, V: Clone> ActionContext<'r, 'a, V> {
    /// The input position the enclosing frame is currently at.
    pub fn current_index(&self) -> usize {
        self.run.frames[self.level].current_index
    }

    /// The character at [`current_index`].
    ///
    /// [`current_index`]: #method.current_index
    pub fn current_char(&self) -> char {
        self.run.frames[self.level].current_char
    }

    /// The input position the enclosing frame started matching at.
    pub fn start_index(&self) -> usize {
        self.run.frames[self.level].start_index
    }

    /// The depth of the enclosing frame.
    pub fn level(&self) -> usize {
        self.level
    }

    /// Line/column of the current input position.
    pub fn position(&self) -> Position {
        self.run.input.position_of(self.current_index())
    }

    /// The input buffer being parsed.
    pub fn input(&self) -> &InputBuffer {
        self.run.input
    }

    /// Extracts input text; see [`InputBuffer::extract`].
    ///
    /// [`InputBuffer::extract`]: struct.InputBuffer.html#method.extract
    pub fn extract(&self, start: usize, end: usize) -> String {
        self.run.input.extract(start, end)
    }

    /// True when the action runs inside a `Test`/`TestNot` lookahead, where
    /// any stack effects will be discarded.
    pub fn in_predicate(&self) -> bool {
        self.run.in_predicate(self.level)
    }

    pub fn stack(&self) -> &ValueStack<V> {
        &self.run.stack
    }

    pub fn stack_mut(&mut self) -> &mut ValueStack<V> {
        &mut self.run.stack
    }

    /// Reads the innermost in-scope value of the local grammar variable
    /// `name`, or `None` if it is unset or out of scope.
    pub fn get_var(&self, name: &str) -> Option<&V> {
        self.run
            .vars
            .get(name)
            .and_then(|frames| frames.last())
            .and_then(|slot| slot.as_ref())
    }

    /// Sets the innermost in-scope value of the local grammar variable
    /// `name`. Fails if no enclosing `VarFraming` declares it.
    pub fn set_var(&mut self, name: &str, value: V) -> Result<(), MatchError> {
        match self.run.vars.get_mut(name).and_then(|frames| frames.last_mut()) {
            Some(slot) => {
                *slot = Some(value);
                Ok(())
            }
            None => Err(MatchError::IllegalUsage {
                call: "set_var",
                reason: format!("no variable frame named '{}' is in scope", name),
            }),
        }
    }

    /// The text matched by the action's preceding sibling in the enclosing
    /// sequence.
    ///
    /// With the enclosing frame error-marked, this falls back to the span of
    /// the node the sibling built (the empty string if it built none).
    pub fn get_match(&self) -> Result<String, MatchError> {
        let slot = self.prev_sequence_slot()?;
        let run = &*self.run;
        if run.frames[self.level].has_error {
            return Ok(match run.frames[slot].node_span {
                Some(span) => run.input.extract(span.start, span.end),
                None => String::new(),
            });
        }
        let frame = &run.frames[slot];
        Ok(run.input.extract(frame.start_index, frame.current_index))
    }

    /// The input index the preceding sibling started matching at.
    pub fn get_match_start_index(&self) -> Result<usize, MatchError> {
        let slot = self.prev_sequence_slot()?;
        Ok(self.run.frames[slot].start_index)
    }

    /// The input index just past the preceding sibling's match.
    pub fn get_match_end_index(&self) -> Result<usize, MatchError> {
        let slot = self.prev_sequence_slot()?;
        Ok(self.run.frames[slot].current_index)
    }

    /// The preceding sibling's span as a `(start, end)` pair.
    pub fn get_match_range(&self) -> Result<(usize, usize), MatchError> {
        let slot = self.prev_sequence_slot()?;
        let frame = &self.run.frames[slot];
        Ok((frame.start_index, frame.current_index))
    }

    /// Walks from the anchor down to the deepest active frame (the action
    /// itself) and validates that its parent is a sequence past its first
    /// element; the action's own slot still carries the previous sibling's
    /// span.
    fn prev_sequence_slot(&self) -> Result<usize, MatchError> {
        let run = &*self.run;
        let mut deepest = self.level;
        while deepest + 1 < run.frames.len() && run.frames[deepest + 1].matcher.is_some() {
            deepest += 1;
        }
        let illegal = || MatchError::IllegalUsage {
            call: "get_match",
            reason: "only valid in sequence actions that are not in first position".to_string(),
        };
        if deepest == 0 {
            return Err(illegal());
        }
        let sequence_level = deepest - 1;
        let sequence_frame = &run.frames[sequence_level];
        let sequence_id = match sequence_frame.matcher {
            Some(id) => id,
            None => return Err(illegal()),
        };
        let resolved = run.grammar.unwrap(sequence_id);
        let is_sequence = matches!(
            run.grammar.matcher(resolved).kind(),
            MatcherKind::Sequence(_)
        );
        if !is_sequence || sequence_frame.int_tag == 0 {
            return Err(illegal());
        }
        Ok(deepest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::grammar::GrammarBuilder;
    use crate::matching::handler::BasicMatchHandler;

    fn basic_run<V: Clone>(
        grammar: &Grammar<V>,
        input: &InputBuffer,
    ) -> (bool, ValueStack<V>, Option<ParseNode<V>>, usize, usize) {
        let mut run = ParseRun::new(grammar, input, true);
        let mut handler = BasicMatchHandler;
        let matched = run.run(&mut handler).unwrap();
        let node = run.take_root_node();
        let end = run.frame_current_index(0);
        let depth = run.frames.len();
        (matched, run.into_stack(), node, end, depth)
    }

    #[test]
    fn char_match_builds_the_root_node() {
        let mut b = GrammarBuilder::<()>::new();
        let a = b.ch('a');
        let grammar = b.build(a).unwrap();
        let input = InputBuffer::new("a");

        let (matched, stack, node, _, _) = basic_run(&grammar, &input);
        assert!(matched);
        assert!(stack.is_empty());
        let node = node.unwrap();
        assert_eq!(node.label, "'a'");
        assert_eq!(node.span, Span { start: 0, end: 1 });
        assert!(!node.has_error);
    }

    #[test]
    fn char_mismatch_fails_without_moving() {
        let mut b = GrammarBuilder::<()>::new();
        let a = b.ch('a');
        let grammar = b.build(a).unwrap();
        let input = InputBuffer::new("b");

        let (matched, _, node, end, _) = basic_run(&grammar, &input);
        assert!(!matched);
        assert!(node.is_none());
        assert_eq!(end, 0);
    }

    #[test]
    fn first_of_backtracks_to_the_start_of_the_alternative() {
        // 'a' 'b' / 'a' 'c' against "ac": the first alternative consumes the
        // 'a' and fails on 'b'; the second must start over from position 0
        let mut b = GrammarBuilder::<()>::new();
        let a = b.ch('a');
        let bb = b.ch('b');
        let c = b.ch('c');
        let ab = b.sequence(vec![a, bb]);
        let ac = b.sequence(vec![a, c]);
        let alt = b.first_of(vec![ab, ac]);
        let grammar = b.build(alt).unwrap();
        let input = InputBuffer::new("ac");

        let (matched, _, node, end, _) = basic_run(&grammar, &input);
        assert!(matched);
        assert_eq!(end, 2);
        let node = node.unwrap();
        assert_eq!(node.span, Span { start: 0, end: 2 });
        assert_eq!(node.children.len(), 1);
        let seq = &node.children[0];
        assert_eq!(seq.span, Span { start: 0, end: 2 });
        assert_eq!(seq.children.len(), 2);
        assert_eq!(seq.children[0].label, "'a'");
        assert_eq!(seq.children[1].label, "'c'");
    }

    #[test]
    fn zero_or_more_is_greedy_and_stops_cleanly() {
        let mut b = GrammarBuilder::<()>::new();
        let a = b.ch('a');
        let rep = b.zero_or_more(a);
        let grammar = b.build(rep).unwrap();
        let input = InputBuffer::new("aaab");

        let (matched, _, node, end, _) = basic_run(&grammar, &input);
        assert!(matched);
        assert_eq!(end, 3);
        let node = node.unwrap();
        assert_eq!(node.span, Span { start: 0, end: 3 });
        assert_eq!(node.children.len(), 3);
    }

    #[test]
    fn one_or_more_requires_a_first_match() {
        let mut b = GrammarBuilder::<()>::new();
        let a = b.ch('a');
        let rep = b.one_or_more(a);
        let grammar = b.build(rep).unwrap();

        let input = InputBuffer::new("b");
        let (matched, _, _, _, _) = basic_run(&grammar, &input);
        assert!(!matched);

        let input = InputBuffer::new("aa");
        let (matched, _, _, end, _) = basic_run(&grammar, &input);
        assert!(matched);
        assert_eq!(end, 2);
    }

    #[test]
    fn negative_lookahead_gates_without_consuming() {
        let mut b = GrammarBuilder::<i32>::new();
        let x = b.ch('x');
        let not_x = b.test_not(x);
        let any = b.any();
        let seq = b.sequence(vec![not_x, any]);
        let grammar = b.build(seq).unwrap();

        let input = InputBuffer::new("a");
        let (matched, _, _, end, _) = basic_run(&grammar, &input);
        assert!(matched);
        assert_eq!(end, 1);

        let input = InputBuffer::new("x");
        let (matched, stack, node, end, _) = basic_run(&grammar, &input);
        assert!(!matched);
        assert!(stack.is_empty());
        assert!(node.is_none());
        assert_eq!(end, 0);
    }

    #[test]
    fn lookaheads_discard_stack_effects_even_on_success() {
        let mut b = GrammarBuilder::<i32>::new();
        let push = b.action("PushOne", |ctx| {
            ctx.stack_mut().push(1);
            Ok(true)
        });
        let probe = b.test(push);
        let any = b.any();
        let seq = b.sequence(vec![probe, any]);
        let grammar = b.build(seq).unwrap();
        let input = InputBuffer::new("z");

        let (matched, stack, _, _, _) = basic_run(&grammar, &input);
        assert!(matched);
        assert!(stack.is_empty());
    }

    #[test]
    fn action_reads_the_previous_siblings_match() {
        let mut b = GrammarBuilder::<i64>::new();
        let digit = b.char_range('0', '9');
        let digits = b.one_or_more(digit);
        b.label(digits, "Digits");
        let to_number = b.action("ToNumber", |ctx| {
            let text = ctx.get_match()?;
            let number: i64 = text.parse()?;
            ctx.stack_mut().push(number);
            Ok(true)
        });
        let seq = b.sequence(vec![digits, to_number]);
        let grammar = b.build(seq).unwrap();
        let input = InputBuffer::new("123");

        let (matched, stack, _, _, _) = basic_run(&grammar, &input);
        assert!(matched);
        assert_eq!(stack.peek(), Some(&123));
    }

    #[test]
    fn get_match_indices_span_the_previous_sibling() {
        let mut b = GrammarBuilder::<(usize, usize)>::new();
        let x = b.ch('x');
        let digit = b.char_range('0', '9');
        let digits = b.one_or_more(digit);
        let spans = b.action("Spans", |ctx| {
            let range = ctx.get_match_range()?;
            assert_eq!(range.0, ctx.get_match_start_index()?);
            assert_eq!(range.1, ctx.get_match_end_index()?);
            ctx.stack_mut().push(range);
            Ok(true)
        });
        let seq = b.sequence(vec![x, digits, spans]);
        let grammar = b.build(seq).unwrap();
        let input = InputBuffer::new("x42");

        let (matched, stack, _, _, _) = basic_run(&grammar, &input);
        assert!(matched);
        assert_eq!(stack.peek(), Some(&(1, 3)));
    }

    #[test]
    fn action_effects_roll_back_when_the_sequence_fails() {
        let mut b = GrammarBuilder::<i64>::new();
        let digit = b.char_range('0', '9');
        let digits = b.one_or_more(digit);
        let push = b.action("Push", |ctx| {
            let number: i64 = ctx.get_match()?.parse()?;
            ctx.stack_mut().push(number);
            Ok(true)
        });
        let x = b.ch('x');
        let seq = b.sequence(vec![digits, push, x]);
        let grammar = b.build(seq).unwrap();
        let input = InputBuffer::new("12");

        let (matched, stack, _, _, _) = basic_run(&grammar, &input);
        assert!(!matched);
        assert!(stack.is_empty());
    }

    #[test]
    fn get_match_is_rejected_in_first_position() {
        let mut b = GrammarBuilder::<i64>::new();
        let bad = b.action("Bad", |ctx| {
            let _ = ctx.get_match()?;
            Ok(true)
        });
        let a = b.ch('a');
        let seq = b.sequence(vec![bad, a]);
        let grammar = b.build(seq).unwrap();
        let input = InputBuffer::new("a");

        let mut run = ParseRun::new(&grammar, &input, true);
        let mut handler = BasicMatchHandler;
        let err = run.run(&mut handler).unwrap_err();
        assert!(matches!(err, MatchError::IllegalUsage { .. }));
    }

    #[test]
    fn action_failures_are_wrapped_once_with_path_and_position() {
        let mut b = GrammarBuilder::<i64>::new();
        let a = b.ch('a');
        let boom = b.action("Boom", |_ctx| Err("boom".into()));
        let inner = b.sequence(vec![a, boom]);
        b.label(inner, "Inner");
        let outer = b.sequence(vec![inner]);
        b.label(outer, "Outer");
        let grammar = b.build(outer).unwrap();
        let input = InputBuffer::new("a");

        let mut run = ParseRun::new(&grammar, &input, true);
        let mut handler = BasicMatchHandler;
        let err = run.run(&mut handler).unwrap_err();
        match err {
            MatchError::Runtime { path, index, source, .. } => {
                assert_eq!(path.to_string(), "Outer/Inner/Boom");
                assert_eq!(index, 1);
                assert_eq!(source.to_string(), "boom");
            }
            other => panic!("expected a runtime wrap, got {:?}", other),
        }
    }

    #[test]
    fn a_parse_of_depth_d_allocates_d_plus_one_frames() {
        // OneOrMore -> Sequence -> Char nests three deep; many repetitions
        // must reuse the same three frames
        let mut b = GrammarBuilder::<()>::new();
        let a = b.ch('a');
        let seq = b.sequence(vec![a]);
        let rep = b.one_or_more(seq);
        let grammar = b.build(rep).unwrap();
        let input = InputBuffer::new("aaaaaaaaaa");

        let (matched, _, _, end, depth) = basic_run(&grammar, &input);
        assert!(matched);
        assert_eq!(end, 10);
        assert_eq!(depth, 3);
    }

    #[test]
    fn skipped_matchers_hand_their_children_to_the_ancestor() {
        let mut b = GrammarBuilder::<()>::new();
        let a = b.ch('a');
        let bb = b.ch('b');
        let inner = b.sequence(vec![a, bb]);
        b.skip_node(inner);
        let c = b.ch('c');
        let outer = b.sequence(vec![inner, c]);
        let grammar = b.build(outer).unwrap();
        let input = InputBuffer::new("abc");

        let (matched, _, node, _, _) = basic_run(&grammar, &input);
        assert!(matched);
        let node = node.unwrap();
        // no node references the skipped sequence; its children surface in
        // order next to their would-be uncle
        let labels: Vec<&str> = node.children.iter().map(|n| n.label.as_str()).collect();
        assert_eq!(labels, vec!["'a'", "'b'", "'c'"]);
    }

    #[test]
    fn suppressed_matchers_produce_no_nodes_at_all() {
        let mut b = GrammarBuilder::<()>::new();
        let a = b.ch('a');
        let bb = b.ch('b');
        let inner = b.sequence(vec![a, bb]);
        b.suppress_node(inner);
        let c = b.ch('c');
        let outer = b.sequence(vec![inner, c]);
        let grammar = b.build(outer).unwrap();
        let input = InputBuffer::new("abc");

        let (matched, _, node, _, _) = basic_run(&grammar, &input);
        assert!(matched);
        let node = node.unwrap();
        let labels: Vec<&str> = node.children.iter().map(|n| n.label.as_str()).collect();
        assert_eq!(labels, vec!["'c'"]);
    }

    #[test]
    fn subnode_suppression_keeps_the_node_but_drops_its_children() {
        let mut b = GrammarBuilder::<()>::new();
        let a = b.ch('a');
        let bb = b.ch('b');
        let inner = b.sequence(vec![a, bb]);
        b.label(inner, "Inner");
        b.suppress_subnodes(inner);
        let grammar = b.build(inner).unwrap();
        let input = InputBuffer::new("ab");

        let (matched, _, node, _, _) = basic_run(&grammar, &input);
        assert!(matched);
        let node = node.unwrap();
        assert_eq!(node.label, "Inner");
        assert!(node.children.is_empty());
    }

    #[test]
    fn slow_string_matching_descends_into_characters() {
        let mut b = GrammarBuilder::<()>::new();
        let lit = b.string("abc");
        let grammar = b.build(lit).unwrap();
        let input = InputBuffer::new("abc");

        let mut run = ParseRun::new(&grammar, &input, true);
        let mut handler = BasicMatchHandler;
        assert!(run.run(&mut handler).unwrap());
        let fast_node = run.take_root_node().unwrap();
        assert!(fast_node.children.is_empty());
        assert_eq!(fast_node.span, Span { start: 0, end: 3 });

        let mut run = ParseRun::new(&grammar, &input, false);
        let mut handler = BasicMatchHandler;
        assert!(run.run(&mut handler).unwrap());
        let slow_node = run.take_root_node().unwrap();
        assert_eq!(slow_node.children.len(), 3);
        assert_eq!(slow_node.span, Span { start: 0, end: 3 });
    }

    #[test]
    fn empty_matches_nothing_fails() {
        let mut b = GrammarBuilder::<()>::new();
        let empty = b.empty();
        let grammar = b.build(empty).unwrap();
        let input = InputBuffer::new("xyz");
        let (matched, _, node, end, _) = basic_run(&grammar, &input);
        assert!(matched);
        assert_eq!(end, 0);
        assert_eq!(node.unwrap().span, Span { start: 0, end: 0 });

        let mut b = GrammarBuilder::<()>::new();
        let nothing = b.nothing();
        let grammar = b.build(nothing).unwrap();
        let input = InputBuffer::new("xyz");
        let (matched, _, _, _, _) = basic_run(&grammar, &input);
        assert!(!matched);
    }

    #[test]
    fn eoi_matches_only_at_the_end() {
        let mut b = GrammarBuilder::<()>::new();
        let a = b.ch('a');
        let eoi = b.eoi();
        let seq = b.sequence(vec![a, eoi]);
        let grammar = b.build(seq).unwrap();

        let input = InputBuffer::new("a");
        let (matched, _, _, end, _) = basic_run(&grammar, &input);
        assert!(matched);
        assert_eq!(end, 1);

        let input = InputBuffer::new("ab");
        let (matched, _, _, _, _) = basic_run(&grammar, &input);
        assert!(!matched);
    }

    #[test]
    fn actions_observe_predicate_contexts() {
        let mut b = GrammarBuilder::<()>::new();
        let in_pred = b.action("InPredicate", |ctx| Ok(ctx.in_predicate()));
        let probe = b.test(in_pred);
        let any = b.any();
        let seq = b.sequence(vec![probe, any]);
        let grammar = b.build(seq).unwrap();
        let input = InputBuffer::new("q");
        let (matched, _, _, _, _) = basic_run(&grammar, &input);
        assert!(matched);

        let mut b = GrammarBuilder::<()>::new();
        let outside = b.action("Outside", |ctx| Ok(!ctx.in_predicate()));
        let any = b.any();
        let seq = b.sequence(vec![outside, any]);
        let grammar = b.build(seq).unwrap();
        let input = InputBuffer::new("q");
        let (matched, _, _, _, _) = basic_run(&grammar, &input);
        assert!(matched);
    }

    #[test]
    fn var_framing_scopes_variables_around_the_sub_parse() {
        let mut b = GrammarBuilder::<i32>::new();
        let set = b.action("Set", |ctx| {
            ctx.set_var("acc", 42)?;
            Ok(true)
        });
        let get = b.action("Get", |ctx| {
            let value = ctx.get_var("acc").copied().unwrap_or(-1);
            ctx.stack_mut().push(value);
            Ok(true)
        });
        let a = b.ch('a');
        let body = b.sequence(vec![a, set, get]);
        let framed = b.var_framing(body, vec!["acc".to_string()]);
        let grammar = b.build(framed).unwrap();
        let input = InputBuffer::new("a");

        let (matched, stack, _, _, _) = basic_run(&grammar, &input);
        assert!(matched);
        assert_eq!(stack.peek(), Some(&42));
    }

    #[test]
    fn setting_a_variable_out_of_scope_is_an_illegal_usage() {
        let mut b = GrammarBuilder::<i32>::new();
        let a = b.ch('a');
        let set = b.action("Set", |ctx| {
            ctx.set_var("nope", 1)?;
            Ok(true)
        });
        let seq = b.sequence(vec![a, set]);
        let grammar = b.build(seq).unwrap();
        let input = InputBuffer::new("a");

        let mut run = ParseRun::new(&grammar, &input, true);
        let mut handler = BasicMatchHandler;
        let err = run.run(&mut handler).unwrap_err();
        assert!(matches!(err, MatchError::IllegalUsage { call: "set_var", .. }));
    }

    #[test]
    fn recursive_grammars_run_through_proxies() {
        // Parens = '(' Parens ')' / EMPTY
        let mut b = GrammarBuilder::<()>::new();
        let parens = b.proxy("Parens");
        let open = b.ch('(');
        let close = b.ch(')');
        let nested = b.sequence(vec![open, parens, close]);
        let empty = b.empty();
        let body = b.first_of(vec![nested, empty]);
        b.resolve_proxy(parens, body);
        let grammar = b.build(parens).unwrap();

        let input = InputBuffer::new("((()))");
        let (matched, _, _, end, _) = basic_run(&grammar, &input);
        assert!(matched);
        assert_eq!(end, 6);

        let input = InputBuffer::new("(()");
        let (matched, _, _, end, _) = basic_run(&grammar, &input);
        // the unbalanced prefix falls back to the empty alternative
        assert!(matched);
        assert_eq!(end, 0);
    }

    #[test]
    fn clear_node_suppression_walks_up_while_suppressed() {
        let mut b = GrammarBuilder::<()>::new();
        let a = b.ch('a');
        let inner = b.sequence(vec![a]);
        b.suppress_node(inner);
        let outer = b.sequence(vec![inner]);
        let grammar = b.build(outer).unwrap();
        let input = InputBuffer::new("a");

        let mut run = ParseRun::new(&grammar, &input, true);
        let inner_level = run.get_sub_context(0, inner);
        assert!(run.frames[inner_level].node_suppressed);
        let a_level = run.get_sub_context(inner_level, a);
        assert!(run.frames[a_level].node_suppressed);

        run.clear_node_suppression(a_level);
        assert!(!run.frames[a_level].node_suppressed);
        assert!(!run.frames[inner_level].node_suppressed);
        assert!(!run.frames[0].node_suppressed);
    }

    /// Error-marks the frame of every matched occurrence of one label, the
    /// way reporting handlers mark frames they record errors against.
    struct MarkOnMatch {
        target: &'static str,
    }

    impl<V: Clone> MatchHandler<V> for MarkOnMatch {
        fn match_frame(
            &mut self,
            run: &mut ParseRun<'_, V>,
            level: usize,
        ) -> Result<bool, MatchError> {
            let matched = run.execute_matcher(self, level)?;
            let is_target = run
                .frame_matcher(level)
                .map(|id| run.grammar().matcher(id).label() == self.target)
                .unwrap_or(false);
            if matched && is_target {
                run.mark_error(level);
            }
            Ok(matched)
        }
    }

    #[test]
    fn get_match_under_error_reads_the_siblings_node_span() {
        let mut b = GrammarBuilder::<String>::new();
        let lit = b.string("ab");
        let grab = b.action("Grab", |ctx| {
            let text = ctx.get_match()?;
            ctx.stack_mut().push(text);
            Ok(true)
        });
        let seq = b.sequence(vec![lit, grab]);
        let grammar = b.build(seq).unwrap();
        let input = InputBuffer::new("ab");

        let mut run = ParseRun::new(&grammar, &input, true);
        let mut handler = MarkOnMatch { target: "\"ab\"" };
        assert!(run.run(&mut handler).unwrap());
        // the sibling built a node, so the error fallback still sees its text
        assert_eq!(run.stack.peek(), Some(&"ab".to_string()));
    }

    #[test]
    fn get_match_under_error_is_empty_when_the_sibling_built_no_node() {
        let mut b = GrammarBuilder::<String>::new();
        let lit = b.string("ab");
        b.suppress_node(lit);
        let grab = b.action("Grab", |ctx| {
            let text = ctx.get_match()?;
            ctx.stack_mut().push(text);
            Ok(true)
        });
        let seq = b.sequence(vec![lit, grab]);
        let grammar = b.build(seq).unwrap();
        let input = InputBuffer::new("ab");

        let mut run = ParseRun::new(&grammar, &input, true);
        let mut handler = MarkOnMatch { target: "\"ab\"" };
        assert!(run.run(&mut handler).unwrap());
        assert_eq!(run.stack.peek(), Some(&String::new()));
    }

    #[test]
    fn node_values_capture_the_stack_top() {
        let mut b = GrammarBuilder::<i64>::new();
        let digit = b.char_range('0', '9');
        let digits = b.one_or_more(digit);
        let push = b.action("Push", |ctx| {
            let number: i64 = ctx.get_match()?.parse()?;
            ctx.stack_mut().push(number);
            Ok(true)
        });
        let seq = b.sequence(vec![digits, push]);
        b.label(seq, "Number");
        let grammar = b.build(seq).unwrap();
        let input = InputBuffer::new("7");

        let (matched, _, node, _, _) = basic_run(&grammar, &input);
        assert!(matched);
        assert_eq!(node.unwrap().value, Some(7));
    }
}
