//! Size index - top-down splay tree over free blocks
//!
//! Nodes are free blocks addressed by segment offset; the key is
//! `(block size, block offset)`, which is unique and orders equal sizes by
//! address so best-fit prefers lower blocks. Links are raw `u32` offsets,
//! `NIL` for none.

use super::block;
use crate::segment::{Segment, NIL};

type Key = (u32, u32);

#[inline]
fn key(segment: &Segment, node: u32) -> Key {
    (block::size(segment, crate::segment::Offset::new(node as usize)), node)
}

/// Splay the node closest to `k` to the top of the tree rooted at `t`
///
/// Afterwards the root is `k` itself if present, otherwise its in-order
/// predecessor or successor.
fn splay(segment: &mut Segment, mut t: u32, k: Key) -> u32 {
    if t == NIL {
        return NIL;
    }

    // Roots of the assembled left and right trees, and their attach points
    let mut left_root = NIL;
    let mut right_root = NIL;
    let mut left_max = NIL;
    let mut right_min = NIL;

    loop {
        let tk = key(segment, t);
        if k < tk {
            let mut tl = block::left(segment, t);
            if tl == NIL {
                break;
            }
            if k < key(segment, tl) {
                // rotate right
                block::set_left(segment, t, block::right(segment, tl));
                block::set_right(segment, tl, t);
                t = tl;
                tl = block::left(segment, t);
                if tl == NIL {
                    break;
                }
            }
            // link right
            if right_min == NIL {
                right_root = t;
            } else {
                block::set_left(segment, right_min, t);
            }
            right_min = t;
            t = tl;
        } else if k > tk {
            let mut tr = block::right(segment, t);
            if tr == NIL {
                break;
            }
            if k > key(segment, tr) {
                // rotate left
                block::set_right(segment, t, block::left(segment, tr));
                block::set_left(segment, tr, t);
                t = tr;
                tr = block::right(segment, t);
                if tr == NIL {
                    break;
                }
            }
            // link left
            if left_max == NIL {
                left_root = t;
            } else {
                block::set_right(segment, left_max, t);
            }
            left_max = t;
            t = tr;
        } else {
            break;
        }
    }

    // assemble
    let tl = block::left(segment, t);
    let tr = block::right(segment, t);
    if left_max == NIL {
        left_root = tl;
    } else {
        block::set_right(segment, left_max, tl);
    }
    if right_min == NIL {
        right_root = tr;
    } else {
        block::set_left(segment, right_min, tr);
    }
    block::set_left(segment, t, left_root);
    block::set_right(segment, t, right_root);
    t
}

/// Insert free block `node`; its header must already carry the final size
pub(super) fn insert(segment: &mut Segment, root: &mut u32, node: u32) {
    if *root == NIL {
        block::set_left(segment, node, NIL);
        block::set_right(segment, node, NIL);
        *root = node;
        return;
    }

    let k = key(segment, node);
    let t = splay(segment, *root, k);
    debug_assert!(key(segment, t) != k, "free block inserted twice");
    if k < key(segment, t) {
        block::set_left(segment, node, block::left(segment, t));
        block::set_right(segment, node, t);
        block::set_left(segment, t, NIL);
    } else {
        block::set_right(segment, node, block::right(segment, t));
        block::set_left(segment, node, t);
        block::set_right(segment, t, NIL);
    }
    *root = node;
}

/// Remove `node`, which must be in the tree
pub(super) fn remove(segment: &mut Segment, root: &mut u32, node: u32) {
    let k = key(segment, node);
    let t = splay(segment, *root, k);
    debug_assert_eq!(t, node, "removing a block that is not in the size tree");

    let tl = block::left(segment, t);
    let tr = block::right(segment, t);
    *root = if tl == NIL {
        tr
    } else {
        // every key on the left is smaller, so this lifts the maximum
        let m = splay(segment, tl, k);
        block::set_right(segment, m, tr);
        m
    };
}

/// Smallest free block whose size is at least `size`
pub(super) fn smallest_at_least(segment: &mut Segment, root: &mut u32, size: u32) -> Option<u32> {
    if *root == NIL {
        return None;
    }

    let k = (size, 0);
    *root = splay(segment, *root, k);
    if key(segment, *root) >= k {
        return Some(*root);
    }

    // root is the predecessor; the answer is the leftmost node on its right
    let mut n = block::right(segment, *root);
    if n == NIL {
        return None;
    }
    loop {
        let l = block::left(segment, n);
        if l == NIL {
            return Some(n);
        }
        n = l;
    }
}

/// Visit every node in key order
pub(super) fn for_each(segment: &Segment, root: u32, mut visit: impl FnMut(u32)) {
    let mut stack = Vec::new();
    let mut n = root;
    while n != NIL || !stack.is_empty() {
        while n != NIL {
            stack.push(n);
            n = block::left(segment, n);
        }
        if let Some(top) = stack.pop() {
            visit(top);
            n = block::right(segment, top);
        }
    }
}
