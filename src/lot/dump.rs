use crate::error::Result;
use crate::id::PageId;
use crate::lot::node::INode;
use crate::pager::{BufferPool, PageType};
use anyhow::anyhow;
use std::io::Write;

const LEAF_BYTES_PER_LINE: usize = 32;
const LEAF_PREVIEW_LINES: usize = 4;

/// Prints a large object in preorder: a node, then each of its children in entry order.
pub(crate) fn dump_tree(pool: &BufferPool, root: PageId, out: &mut dyn Write) -> Result<()> {
    writeln!(out, "large object {root}")?;
    dump_internal(pool, root, 0, out)
}

fn dump_internal(pool: &BufferPool, pgid: PageId, depth: usize, out: &mut dyn Write) -> Result<()> {
    let node = {
        let page = pool.pin_read(pgid)?;
        INode::read(&page)?
    };
    let indent = "  ".repeat(depth);
    writeln!(
        out,
        "{indent}node {pgid} height={} entries={}",
        node.height,
        node.entries.len()
    )?;
    for entry in &node.entries {
        writeln!(out, "{indent}  [spid={:>8} count={:>12}]", entry.spid, entry.count)?;
    }

    for i in 0..node.entries.len() {
        let child = node.child(pgid, i);
        if node.height == 1 {
            dump_leaf(pool, child, node.child_count(i), depth + 1, out)?;
        } else {
            dump_internal(pool, child, depth + 1, out)?;
        }
    }
    Ok(())
}

fn dump_leaf(
    pool: &BufferPool,
    pgid: PageId,
    count: u64,
    depth: usize,
    out: &mut dyn Write,
) -> Result<()> {
    let page = pool.pin_read(pgid)?;
    if page.kind() != PageType::LotLeaf {
        return Err(anyhow!("page {pgid} is not a large object leaf").into());
    }
    let indent = "  ".repeat(depth);
    writeln!(out, "{indent}leaf {pgid} count={count}")?;

    let body = page.body();
    let data = body.get(..count as usize).unwrap_or(body);
    for line in data.chunks(LEAF_BYTES_PER_LINE).take(LEAF_PREVIEW_LINES) {
        let text = line
            .iter()
            .map(|b| if b.is_ascii_graphic() { *b as char } else { '.' })
            .collect::<String>();
        writeln!(out, "{indent}  {text}")?;
    }
    if data.len() > LEAF_BYTES_PER_LINE * LEAF_PREVIEW_LINES {
        writeln!(out, "{indent}  ...")?;
    }
    if count > body.len() as u64 {
        writeln!(out, "{indent}  (truncated, the page holds {} bytes)", body.len())?;
    }
    Ok(())
}
