//! Balanced index over the record arena.
//!
//! An AVL tree in the classic Adelson-Velskij & Landis formulation (see
//! Knuth, The Art of Computer Programming vol. 3). The tree owns nothing: its
//! nodes are the `IndexNode` fields embedded in each record, addressed by
//! arena slot, so lookup and insertion run without any allocation. Insertion
//! happens inside the write-path critical section and must stay strictly
//! O(log n).

use crate::key::RegisterKey;
use crate::record::{IndexNode, RegisterRecord};

/// Inserts `slot` into the tree rooted at `root` and returns the new root.
/// The slot's key must not already be present in the tree.
pub fn insert(records: &mut [RegisterRecord], root: Option<usize>, slot: usize) -> Option<usize> {
    records[slot].node = IndexNode::default();
    match root {
        None => Some(slot),
        Some(r) => {
            let (r, _) = insert_at(records, r, slot);
            Some(r)
        }
    }
}

/// Removes the slot carrying `key`, if present, and returns the new root.
pub fn remove(
    records: &mut [RegisterRecord],
    root: Option<usize>,
    key: RegisterKey,
) -> Option<usize> {
    match root {
        None => None,
        Some(r) => remove_at(records, r, key).0,
    }
}

/// Detaches the root node and returns the new root.
pub fn remove_root(records: &mut [RegisterRecord], root: Option<usize>) -> Option<usize> {
    match root {
        None => None,
        Some(r) => remove_root_at(records, r).0,
    }
}

/// Exact lookup, a range visit with `low == high`.
pub fn find(
    records: &[RegisterRecord],
    root: Option<usize>,
    key: RegisterKey,
) -> Option<usize> {
    let mut found = None;
    visit_range(records, root, key, key, &mut |slot| {
        found = Some(slot);
        false
    });
    found
}

/// Visits every slot with `low <= key <= high` in key order. The visitor
/// returns `false` to stop early; the function reports whether the walk ran
/// to completion.
pub fn visit_range<F>(
    records: &[RegisterRecord],
    node: Option<usize>,
    low: RegisterKey,
    high: RegisterKey,
    visit: &mut F,
) -> bool
where
    F: FnMut(usize) -> bool,
{
    let Some(n) = node else {
        return true;
    };
    let key = records[n].key;
    if key > low && !visit_range(records, records[n].node.left, low, high, visit) {
        return false;
    }
    if key >= low && key <= high && !visit(n) {
        return false;
    }
    if key < high && !visit_range(records, records[n].node.right, low, high, visit) {
        return false;
    }
    true
}

/// In-order walk over the whole tree with early termination.
pub fn visit_in_order<F>(records: &[RegisterRecord], node: Option<usize>, visit: &mut F) -> bool
where
    F: FnMut(usize) -> bool,
{
    let Some(n) = node else {
        return true;
    };
    visit_in_order(records, records[n].node.left, visit)
        && visit(n)
        && visit_in_order(records, records[n].node.right, visit)
}

/// Left rotation around `a`; balance factors are the caller's business.
fn rotate_left(records: &mut [RegisterRecord], a: usize) -> usize {
    let b = records[a]
        .node
        .right
        .expect("left rotation requires a right child");
    records[a].node.right = records[b].node.left;
    records[b].node.left = Some(a);
    b
}

/// Right rotation around `a`; balance factors are the caller's business.
fn rotate_right(records: &mut [RegisterRecord], a: usize) -> usize {
    let b = records[a]
        .node
        .left
        .expect("right rotation requires a left child");
    records[a].node.left = records[b].node.right;
    records[b].node.right = Some(a);
    b
}

/// Balance fix-up after a double rotation: the new root's own balance tells
/// which side absorbed the middle subtree.
fn fix_after_double(records: &mut [RegisterRecord], root: usize) {
    let left = records[root].node.left.expect("double rotation has children");
    let right = records[root]
        .node
        .right
        .expect("double rotation has children");
    match records[root].node.balance {
        -1 => {
            records[left].node.balance = 0;
            records[right].node.balance = 1;
        }
        1 => {
            records[left].node.balance = -1;
            records[right].node.balance = 0;
        }
        _ => {
            records[left].node.balance = 0;
            records[right].node.balance = 0;
        }
    }
    records[root].node.balance = 0;
}

/// Recursive insert below `r`. Returns the subtree's new root and whether its
/// height grew, so each level can decide whether rebalancing continues.
fn insert_at(records: &mut [RegisterRecord], r: usize, slot: usize) -> (usize, bool) {
    if records[slot].key < records[r].key {
        match records[r].node.left {
            Some(l) => {
                let (nl, grew) = insert_at(records, l, slot);
                records[r].node.left = Some(nl);
                if !grew {
                    return (r, false);
                }
                let old = records[r].node.balance;
                records[r].node.balance = old - 1;
                match old {
                    1 => (r, false),
                    0 => (r, true),
                    _ => (rebalance_left_heavy(records, r), false),
                }
            }
            None => {
                records[r].node.left = Some(slot);
                let old = records[r].node.balance;
                records[r].node.balance = old - 1;
                (r, old == 0)
            }
        }
    } else {
        match records[r].node.right {
            Some(rt) => {
                let (nr, grew) = insert_at(records, rt, slot);
                records[r].node.right = Some(nr);
                if !grew {
                    return (r, false);
                }
                let old = records[r].node.balance;
                records[r].node.balance = old + 1;
                match old {
                    -1 => (r, false),
                    0 => (r, true),
                    _ => (rebalance_right_heavy(records, r), false),
                }
            }
            None => {
                records[r].node.right = Some(slot);
                let old = records[r].node.balance;
                records[r].node.balance = old + 1;
                (r, old == 0)
            }
        }
    }
}

/// `r` just went to balance -2. Simple rotation when the left child leans the
/// same way, double rotation otherwise.
fn rebalance_left_heavy(records: &mut [RegisterRecord], r: usize) -> usize {
    let l = records[r].node.left.expect("left-heavy node has a left child");
    if records[l].node.balance < 0 {
        let root = rotate_right(records, r);
        records[root].node.balance = 0;
        records[r].node.balance = 0;
        root
    } else {
        let nl = rotate_left(records, l);
        records[r].node.left = Some(nl);
        let root = rotate_right(records, r);
        fix_after_double(records, root);
        root
    }
}

/// Mirror of `rebalance_left_heavy` for balance +2.
fn rebalance_right_heavy(records: &mut [RegisterRecord], r: usize) -> usize {
    let rt = records[r]
        .node
        .right
        .expect("right-heavy node has a right child");
    if records[rt].node.balance > 0 {
        let root = rotate_left(records, r);
        records[root].node.balance = 0;
        records[r].node.balance = 0;
        root
    } else {
        let nr = rotate_right(records, rt);
        records[r].node.right = Some(nr);
        let root = rotate_left(records, r);
        fix_after_double(records, root);
        root
    }
}

/// Recursive removal below `r`. Returns the subtree's new root and whether
/// its height shrank. A key that is not present leaves the subtree untouched.
fn remove_at(
    records: &mut [RegisterRecord],
    r: usize,
    key: RegisterKey,
) -> (Option<usize>, bool) {
    if records[r].key == key {
        return remove_root_at(records, r);
    }
    if key < records[r].key {
        let Some(l) = records[r].node.left else {
            return (Some(r), false);
        };
        let (nl, shrunk) = remove_at(records, l, key);
        records[r].node.left = nl;
        if !shrunk {
            return (Some(r), false);
        }
        let old = records[r].node.balance;
        records[r].node.balance = old + 1;
        match old {
            -1 => (Some(r), true),
            0 => (Some(r), false),
            _ => {
                // now at +2; the right child decides the rotation shape
                let rt = records[r]
                    .node
                    .right
                    .expect("right-heavy node has a right child");
                match records[rt].node.balance {
                    0 => {
                        let root = rotate_left(records, r);
                        records[root].node.balance = -1;
                        records[r].node.balance = 1;
                        (Some(root), false)
                    }
                    1 => {
                        let root = rotate_left(records, r);
                        records[root].node.balance = 0;
                        records[r].node.balance = 0;
                        (Some(root), true)
                    }
                    _ => {
                        let nr = rotate_right(records, rt);
                        records[r].node.right = Some(nr);
                        let root = rotate_left(records, r);
                        fix_after_double(records, root);
                        (Some(root), true)
                    }
                }
            }
        }
    } else {
        let Some(rt) = records[r].node.right else {
            return (Some(r), false);
        };
        let (nr, shrunk) = remove_at(records, rt, key);
        records[r].node.right = nr;
        if !shrunk {
            return (Some(r), false);
        }
        let old = records[r].node.balance;
        records[r].node.balance = old - 1;
        match old {
            1 => (Some(r), true),
            0 => (Some(r), false),
            _ => {
                let l = records[r].node.left.expect("left-heavy node has a left child");
                match records[l].node.balance {
                    0 => {
                        let root = rotate_right(records, r);
                        records[root].node.balance = 1;
                        records[r].node.balance = -1;
                        (Some(root), false)
                    }
                    -1 => {
                        let root = rotate_right(records, r);
                        records[root].node.balance = 0;
                        records[r].node.balance = 0;
                        (Some(root), true)
                    }
                    _ => {
                        let nl = rotate_left(records, l);
                        records[r].node.left = Some(nl);
                        let root = rotate_right(records, r);
                        fix_after_double(records, root);
                        (Some(root), true)
                    }
                }
            }
        }
    }
}

/// Detaches `r` from its subtree. With two children, the in-order neighbour
/// on the taller side is removed from below and takes over `r`'s links, so
/// the root's balance can only move toward zero and `r` itself never rotates
/// away mid-removal.
fn remove_root_at(records: &mut [RegisterRecord], r: usize) -> (Option<usize>, bool) {
    let node = records[r].node;
    match (node.left, node.right) {
        (None, None) => (None, true),
        (None, Some(rt)) => (Some(rt), true),
        (Some(l), None) => (Some(l), true),
        (Some(l), Some(rt)) => {
            let successor = if node.balance < 0 {
                rightmost(records, l)
            } else {
                leftmost(records, rt)
            };
            let key = records[successor].key;
            let (root, shrunk) = remove_at(records, r, key);
            debug_assert_eq!(root, Some(r));
            records[successor].node = records[r].node;
            if records[successor].node.balance == 0 {
                (Some(successor), shrunk)
            } else {
                (Some(successor), false)
            }
        }
    }
}

fn leftmost(records: &[RegisterRecord], mut n: usize) -> usize {
    while let Some(l) = records[n].node.left {
        n = l;
    }
    n
}

fn rightmost(records: &[RegisterRecord], mut n: usize) -> usize {
    while let Some(r) = records[n].node.right {
        n = r;
    }
    n
}
