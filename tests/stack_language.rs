//! Integration tests for the stack language driving real graphs.

use moviola::error::Error;
use moviola::node::Node;
use moviola::stack::Stack;
use std::sync::Arc;

/// A failed push must leave the stack exactly as deep as before, and a
/// later unrelated pop must behave as if the bad tokens never happened.
#[test]
fn test_failed_push_restores_invariants() {
    let mut stack = Stack::standard();
    stack.push("test:").unwrap();
    let depth = stack.depth();

    // Bad factor token: fails on the forcing push that follows.
    stack.push("bogus:input").unwrap();
    assert!(stack.push("1").is_err());
    assert_eq!(stack.depth(), depth);

    // A bad filter discards whatever it consumed.
    stack.push("filter:nosuchfilter").unwrap();
    assert!(matches!(stack.pop(), Err(Error::UnresolvedToken(_))));

    // The original item is still there and intact.
    let node = stack.pop().unwrap();
    assert_eq!(node.uri(), "test:");
    assert_eq!(stack.depth(), 0);
}

#[test]
fn test_arithmetic_results_are_textual() {
    let mut stack = Stack::standard();
    stack.push("1 1 +").unwrap();
    assert_eq!(stack.pop().unwrap().uri(), "2");

    stack.push("1 0 /").unwrap();
    assert_eq!(stack.pop().unwrap().uri(), "inf");

    stack.push("7 2 *").unwrap();
    assert_eq!(stack.pop().unwrap().uri(), "14");

    stack.push("10 4 -").unwrap();
    assert_eq!(stack.pop().unwrap().uri(), "6");
}

#[test]
fn test_depth_query_sees_prior_pushes() {
    let mut stack = Stack::standard();
    stack.push("test: depth?").unwrap();
    assert_eq!(stack.pop().unwrap().uri(), "1");
    assert_eq!(stack.pop().unwrap().uri(), "test:");
}

#[test]
fn test_word_redefinition_rebinds_future_calls() {
    let mut stack = Stack::standard();
    stack.push(": colour 100 + ;").unwrap();
    stack.push("1 colour").unwrap();
    let first = stack.pop().unwrap().uri();

    stack.push(": colour 100 - ;").unwrap();
    stack.push("1 colour").unwrap();
    let second = stack.pop().unwrap().uri();

    assert_eq!(first, "101");
    assert_eq!(second, "-99");
}

#[test]
fn test_pick_is_reference_sharing() {
    let mut stack = Stack::standard();
    stack.push("test: 0 pick").unwrap();
    let top = stack.pop().unwrap();
    let below = stack.pop().unwrap();
    assert!(Arc::ptr_eq(&top, &below));
}

#[test]
fn test_manipulation_underflow_errors() {
    let mut stack = Stack::standard();
    assert!(matches!(stack.push("drop"), Err(Error::StackUnderflow)));
    assert!(matches!(stack.push("0 pick"), Err(Error::StackUnderflow)));

    stack.push("1 2").unwrap();
    assert!(matches!(stack.push("2 roll"), Err(Error::StackUnderflow)));
    assert!(matches!(stack.push("2 shift"), Err(Error::StackUnderflow)));
    // Depth intact after each failure (the count operand was consumed,
    // the items were not).
    assert_eq!(stack.depth(), 2);
}

#[test]
fn test_decap_unwinds_filter() {
    let mut stack = Stack::standard();
    stack.push("test: filter:clip in=5 decap").unwrap();
    // Clip removed, its one connected slot returned.
    assert_eq!(stack.depth(), 1);
    assert_eq!(stack.pop().unwrap().uri(), "test:");

    stack.push("test: decap").unwrap();
    assert_eq!(stack.depth(), 1);
    assert_eq!(stack.pop().unwrap().uri(), "test:");
}

#[test]
fn test_graph_built_from_program_fetches() {
    let mut stack = Stack::standard();
    stack.push("test: filter:clip in=10 out=20").unwrap();
    let graph = stack.release().unwrap().unwrap();

    assert_eq!(graph.frames(), 10);
    graph.seek(3, false);
    let frame = graph.fetch().unwrap();
    assert_eq!(frame.position(), 3);
    assert!(!frame.in_error());
}

#[test]
fn test_length_query_reports_clipped_count() {
    let mut stack = Stack::standard();
    stack.push("test: filter:clip out=25 length?").unwrap();
    assert_eq!(stack.pop().unwrap().uri(), "25");
    assert_eq!(stack.pop().unwrap().uri(), "clip");
}

#[test]
fn test_substitution_feeds_properties() {
    let mut stack = Stack::standard();
    stack.push(": preview filter:clip out=%s ;").unwrap();
    stack.push("test: 25 preview").unwrap();
    let graph = stack.release().unwrap().unwrap();
    assert_eq!(graph.frames(), 25);
}

#[test]
fn test_distributor_graph_from_program() {
    let mut stack = Stack::standard();
    stack
        .push("test: filter:clip out=40 filter:distributor threads=2 queue=8")
        .unwrap();
    let graph = stack.release().unwrap().unwrap();
    assert_eq!(graph.uri(), "distributor");
    assert_eq!(graph.frames(), 40);

    for position in 0..10 {
        graph.seek(position, false);
        let frame = graph.fetch().unwrap();
        assert_eq!(frame.position(), position);
        assert!(!frame.in_error(), "errors: {:?}", frame.errors());
    }
}

#[test]
fn test_release_on_empty_stack() {
    let mut stack = Stack::standard();
    assert!(stack.release().unwrap().is_none());
}

#[test]
fn test_comment_lines_in_programs() {
    let mut stack = Stack::standard();
    stack
        .push("# build a clipped graph\ntest: filter:clip out=5 # trailing note\n")
        .unwrap();
    let graph = stack.release().unwrap().unwrap();
    assert_eq!(graph.frames(), 5);
}
