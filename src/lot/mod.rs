//! Large objects: byte streams spanning many pages, routed by cumulative byte counts.

mod dump;
pub(crate) mod node;
mod tree;

pub(crate) use dump::dump_tree;
pub(crate) use tree::{Frame, LargeObject, TreePath};
