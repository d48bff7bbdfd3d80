//! Stage 5: spread flush work across NUMA nodes and workers
//!
//! A cluster is flushed by a worker on its leaf's node, so the leaf color
//! decides where the work lands. Inter-node balancing recolors whole leaves
//! (or splits one at a cluster boundary and recolors the tail) until no node
//! carries more than `avg + avg/8` ops. Intra-node balancing then deals each
//! node's clusters out to its workers in key order, splitting a leaf when a
//! worker's share ends inside it. Neither side of a split is ever smaller
//! than `MIN_PIECE` ops; smaller moves go whole or not at all.

use std::collections::VecDeque;

use tracing::trace;

use crate::error::{Result, TierError};
use crate::leaf::{LeafStore, LEAF_FANOUT};

use super::cluster::Cluster;

const MIN_PIECE: usize = LEAF_FANOUT / 2;

/// Flush assignment produced by balancing
#[derive(Debug, Default)]
pub(crate) struct Plan {
    /// Clusters per worker (worker `w` runs on node `w / workers_per_node`)
    pub per_worker: Vec<Vec<Cluster>>,
    /// Ops moved to another node
    pub moved: usize,
    /// Leaves split or recolored
    pub reshaped: usize,
}

pub(crate) fn balance(leaves: &LeafStore, clusters: Vec<Cluster>, nodes: usize, per_node: usize) -> Result<Plan> {
    let mut plan = Plan::default();

    let mut by_node: Vec<Vec<Cluster>> = (0..nodes).map(|_| Vec::new()).collect();
    for c in clusters {
        by_node[c.leaf.color()].push(c);
    }

    if nodes > 1 {
        balance_nodes(leaves, &mut by_node, &mut plan)?;
    }

    for (node, mut list) in by_node.into_iter().enumerate() {
        list.sort_unstable_by(|a, b| a.ops[0].key.cmp(&b.ops[0].key));
        let shares = split_among_workers(leaves, list, node, per_node, &mut plan)?;
        plan.per_worker.extend(shares);
    }
    Ok(plan)
}

fn load(list: &[Cluster]) -> usize {
    list.iter().map(Cluster::len).sum()
}

// =============================================================================
// Inter-node
// =============================================================================

fn balance_nodes(leaves: &LeafStore, by_node: &mut [Vec<Cluster>], plan: &mut Plan) -> Result<()> {
    let nodes = by_node.len();
    let mut loads: Vec<usize> = by_node.iter().map(|l| load(l)).collect();
    let total: usize = loads.iter().sum();
    let avg = total / nodes;
    let max = avg + avg / 8;

    loop {
        let over = (0..nodes).max_by_key(|&n| loads[n]).unwrap_or(0);
        let victim = (0..nodes).min_by_key(|&n| loads[n]).unwrap_or(0);
        if loads[over] <= max || over == victim {
            break;
        }
        let amount = (loads[over] - avg).min(max.saturating_sub(loads[victim]));
        if amount == 0 {
            break;
        }

        let (from, to) = pair_mut(by_node, over, victim);
        let moved = move_ops(leaves, from, to, amount, over, victim, plan)?;
        if moved == 0 {
            break;
        }
        loads[over] -= moved;
        loads[victim] += moved;
        plan.moved += moved;
        trace!(from = over, to = victim, moved, "rebalanced nodes");
    }
    Ok(())
}

/// Move about `amount` ops from `from` (color `fc`) to `to` (color `tc`)
fn move_ops(
    leaves: &LeafStore,
    from: &mut Vec<Cluster>,
    to: &mut Vec<Cluster>,
    amount: usize,
    fc: usize,
    tc: usize,
    plan: &mut Plan,
) -> Result<usize> {
    let mut moved = 0;
    let mut skipped = Vec::new();
    while moved < amount {
        let Some(mut c) = from.pop() else {
            break;
        };
        let want = amount - moved;
        if c.len() <= want {
            let (leaf, _) = leaves.split_and_recolor(c.leaf, None, tc, tc)?;
            c.leaf = leaf;
            moved += c.len();
            to.push(c);
        } else if want >= MIN_PIECE && c.len() - want >= MIN_PIECE {
            let keep = c.len() - want;
            let tail = c.ops.split_off(keep);
            let (left, right) = leaves.split_and_recolor(c.leaf, Some(tail[0].key), fc, tc)?;
            let right = right.ok_or_else(|| TierError::Corruption("split produced one leaf".to_string()))?;
            from.push(Cluster { leaf: left, ops: c.ops });
            to.push(Cluster { leaf: right, ops: tail });
            moved += want;
        } else {
            skipped.push(c);
            continue;
        }
        plan.reshaped += 1;
    }
    from.extend(skipped.into_iter().rev());
    Ok(moved)
}

fn pair_mut<T>(items: &mut [T], a: usize, b: usize) -> (&mut T, &mut T) {
    debug_assert_ne!(a, b);
    if a < b {
        let (lo, hi) = items.split_at_mut(b);
        (&mut lo[a], &mut hi[0])
    } else {
        let (lo, hi) = items.split_at_mut(a);
        (&mut hi[0], &mut lo[b])
    }
}

// =============================================================================
// Intra-node
// =============================================================================

/// Deal a node's key-ordered clusters to its workers in contiguous shares
fn split_among_workers(
    leaves: &LeafStore,
    list: Vec<Cluster>,
    color: usize,
    per_node: usize,
    plan: &mut Plan,
) -> Result<Vec<Vec<Cluster>>> {
    let mut shares: Vec<Vec<Cluster>> = (0..per_node).map(|_| Vec::new()).collect();
    let target = load(&list).div_ceil(per_node).max(1);
    let mut queue: VecDeque<Cluster> = list.into();
    let mut worker = 0;
    let mut filled = 0;

    while let Some(mut c) = queue.pop_front() {
        let last = worker + 1 == per_node;
        let room = target.saturating_sub(filled);
        if room >= MIN_PIECE && c.len() > room && c.len() - room >= MIN_PIECE && !last {
            let tail = c.ops.split_off(room);
            let (left, right) = leaves.split_and_recolor(c.leaf, Some(tail[0].key), color, color)?;
            let right = right.ok_or_else(|| TierError::Corruption("split produced one leaf".to_string()))?;
            plan.reshaped += 1;
            shares[worker].push(Cluster { leaf: left, ops: c.ops });
            queue.push_front(Cluster { leaf: right, ops: tail });
            filled = target;
        } else if last || filled == 0 || c.len() <= room {
            filled += c.len();
            shares[worker].push(c);
        } else {
            // not worth a split; the next worker takes it
            queue.push_front(c);
            filled = target;
        }
        if !last && filled >= target {
            worker += 1;
            filled = 0;
        }
    }
    Ok(shares)
}
