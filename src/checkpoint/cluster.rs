//! Stage 4: sample sort, deduplicate and group operations by leaf
//!
//! Three pool rounds with the coordinator in between:
//!
//! 1. each worker sorts its harvest and draws evenly spaced sample keys;
//! 2. the coordinator picks `workers - 1` key splitters, and each worker
//!    cuts its sorted run into one bucket per worker;
//! 3. worker `b` merges bucket `b` from everyone, keeps the newest record
//!    per key and groups the survivors into per-leaf clusters.
//!
//! Splitters are keys, so every record of a key meets in one bucket.

use std::sync::Arc;

use crate::error::{Result, TierError};
use crate::key::Key;
use crate::leaf::{BatchOp, LeafId};
use crate::log::LogRecord;

use super::pool::WorkerPool;
use super::Stores;

/// Samples drawn per worker, per destination bucket
const OVERSAMPLE: usize = 4;

/// Deduplicated operations bound for one leaf, in key order
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Cluster {
    pub leaf: LeafId,
    pub ops: Vec<BatchOp>,
}

impl Cluster {
    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Output of the cluster stage
#[derive(Debug, Default)]
pub(crate) struct Clustered {
    /// Every cluster, in key order, one per leaf
    pub clusters: Vec<Cluster>,
    /// Highest stamp seen (replay restarts the clock after it)
    pub max_stamp: u64,
}

pub(crate) fn cluster(pool: &WorkerPool, stores: &Arc<Stores>, runs: Vec<Vec<LogRecord>>) -> Result<Clustered> {
    let workers = pool.len();

    // round 1: local sort and sampling
    let sampled = pool.map(runs, move |_, mut run| {
        run.sort_unstable_by(|a, b| a.key.cmp(&b.key).then(a.stamp.cmp(&b.stamp)));
        let samples = sample(&run, workers * OVERSAMPLE);
        Ok((run, samples))
    })?;

    let mut samples: Vec<Key> = sampled.iter().flat_map(|(_, s)| s.iter().copied()).collect();
    samples.sort_unstable();
    samples.dedup();
    let splitters = Arc::new(pick_splitters(&samples, workers));

    // round 2: partition by splitter
    let runs: Vec<Vec<LogRecord>> = sampled.into_iter().map(|(run, _)| run).collect();
    let split = Arc::clone(&splitters);
    let partitioned = pool.map(runs, move |_, run| Ok(partition(run, &split, workers)))?;

    let mut buckets: Vec<Vec<Vec<LogRecord>>> = (0..workers).map(|_| Vec::new()).collect();
    for parts in partitioned {
        for (b, part) in parts.into_iter().enumerate() {
            if !part.is_empty() {
                buckets[b].push(part);
            }
        }
    }

    // round 3: merge, dedup, group by leaf
    let stores = Arc::clone(stores);
    let grouped = pool.map(buckets, move |_, parts| {
        let mut records: Vec<LogRecord> = parts.into_iter().flatten().collect();
        records.sort_unstable_by(|a, b| a.key.cmp(&b.key).then(a.stamp.cmp(&b.stamp)));
        let max_stamp = records.iter().map(|r| r.stamp).max().unwrap_or(0);
        let ops = newest_per_key(records);
        Ok((group_by_leaf(&stores, ops)?, max_stamp))
    })?;

    let mut out = Clustered::default();
    for (clusters, max_stamp) in grouped {
        out.max_stamp = out.max_stamp.max(max_stamp);
        for c in clusters {
            // a leaf straddling a splitter arrives in two pieces
            match out.clusters.last_mut() {
                Some(last) if last.leaf == c.leaf => last.ops.extend(c.ops),
                _ => out.clusters.push(c),
            }
        }
    }
    Ok(out)
}

/// `count` evenly spaced keys from a sorted run
fn sample(run: &[LogRecord], count: usize) -> Vec<Key> {
    if run.is_empty() || count == 0 {
        return Vec::new();
    }
    let step = (run.len() / count).max(1);
    run.iter().step_by(step).take(count).map(|r| r.key).collect()
}

/// `buckets - 1` splitters at regular ranks of the sorted sample
fn pick_splitters(samples: &[Key], buckets: usize) -> Vec<Key> {
    if samples.is_empty() || buckets < 2 {
        return Vec::new();
    }
    (1..buckets)
        .map(|i| samples[(i * samples.len() / buckets).min(samples.len() - 1)])
        .collect()
}

/// Cut a sorted run so that bucket `b` holds `splitters[b-1] <= key < splitters[b]`
fn partition(run: Vec<LogRecord>, splitters: &[Key], buckets: usize) -> Vec<Vec<LogRecord>> {
    let mut out: Vec<Vec<LogRecord>> = (0..buckets).map(|_| Vec::new()).collect();
    let mut b = 0;
    for record in run {
        while b < splitters.len() && record.key >= splitters[b] {
            b += 1;
        }
        out[b].push(record);
    }
    out
}

/// Collapse a `(key, stamp)`-sorted run to the newest record per key
fn newest_per_key(records: Vec<LogRecord>) -> Vec<BatchOp> {
    let mut ops: Vec<BatchOp> = Vec::with_capacity(records.len());
    for r in records {
        let op = BatchOp {
            key: r.key,
            value: r.value,
            kind: r.kind,
        };
        match ops.last_mut() {
            Some(last) if last.key == r.key => *last = op,
            _ => ops.push(op),
        }
    }
    ops
}

/// Split sorted ops into runs that each fall inside one leaf
fn group_by_leaf(stores: &Stores, ops: Vec<BatchOp>) -> Result<Vec<Cluster>> {
    let mut clusters: Vec<Cluster> = Vec::new();
    let mut rfence = Key::MIN;
    for op in ops {
        match clusters.last_mut() {
            Some(cur) if op.key < rfence => cur.ops.push(op),
            _ => {
                let leaf = stores
                    .shim
                    .leaf_of(&op.key)
                    .ok_or_else(|| TierError::Corruption(format!("no leaf owns {:?}", op.key)))?;
                rfence = stores.leaves.rfence(leaf);
                clusters.push(Cluster { leaf, ops: vec![op] });
            }
        }
    }
    Ok(clusters)
}

