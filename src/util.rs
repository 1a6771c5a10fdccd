//! Convenient helper functions for common use cases:
//! * Printing parse trees to the terminal
//! * Rendering parse trees into strings for snapshots and logs

use crate::matching::{InputBuffer, ParseNode};
use std::fmt::Write;

/// Renders a parse tree as an indented list of labels, spans and matched
/// text fragments. Long fragments are elided to keep lines readable.
///
/// ```
/// use pegmatite::matching::{BasicParseRunner, GrammarBuilder, InputBuffer};
/// use pegmatite::util::write_node_tree;
///
/// let mut b = GrammarBuilder::<()>::new();
/// let a = b.ch('a');
/// let reps = b.one_or_more(a);
/// b.label(reps, "As");
/// let grammar = b.build(reps).unwrap();
///
/// let buffer = InputBuffer::new("aa");
/// let result = BasicParseRunner::new(&grammar).run_buffer(&buffer).unwrap();
/// let tree = write_node_tree(&result.root_node.unwrap(), &buffer);
/// assert_eq!(tree.lines().next(), Some("As [0..2] \"aa\""));
/// ```
pub fn write_node_tree<V>(node: &ParseNode<V>, input: &InputBuffer) -> String {
    let mut out = String::new();
    write_level(node, input, 0, &mut out);
    out
}

/// Print out a parse tree with one line per node. Obviously for debugging.
pub fn print_node_tree<V>(node: &ParseNode<V>, input: &InputBuffer) {
    print!("{}", write_node_tree(node, input));
}

fn write_level<V>(node: &ParseNode<V>, input: &InputBuffer, depth: usize, out: &mut String) {
    let text = node.text(input);
    let elided = text.chars().count() > 20;
    let shown: String = text.chars().take(20).collect();
    let mut escaped: String = shown.chars().flat_map(|c| c.escape_default()).collect();
    if elided {
        escaped.push('…');
    }
    writeln!(
        out,
        "{: <1$}{2} [{3}..{4}] \"{5}\"{6}",
        "",
        depth * 2,
        node.label,
        node.span.start,
        node.span.end,
        escaped,
        if node.has_error { " !" } else { "" }
    )
    .unwrap();
    for child in &node.children {
        write_level(child, input, depth + 1, out);
    }
}
