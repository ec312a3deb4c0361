//! Lazy node streams returned by `fetch`.
//!
//! A stream is an ordinary boxed iterator. Dropping it early is the
//! cancellation mechanism: sources release their cursor when the iterator is
//! dropped, so a consumer such as `Take` can stop after `limit` nodes without
//! materializing the rest of the table.

use crate::data::Node;

/// Boxed, forward-only stream of nodes borrowed from an operator.
pub type Stream<'a> = Box<dyn Iterator<Item = Node> + 'a>;

/// An empty stream.
#[must_use]
pub fn empty<'a>() -> Stream<'a> {
    Box::new(std::iter::empty())
}

/// Pulls the first node and drops the rest of the stream.
#[must_use]
pub fn first(mut stream: Stream<'_>) -> Option<Node> {
    stream.next()
}

/// Pulls at most `n` nodes and drops the rest of the stream.
#[must_use]
pub fn take(stream: Stream<'_>, n: usize) -> Vec<Node> {
    stream.take(n).collect()
}
