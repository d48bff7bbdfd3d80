//! Stage 3: harvest the previous generation from every lane

use std::sync::Arc;

use crate::error::Result;
use crate::log::LogRecord;

use super::pool::WorkerPool;
use super::Stores;

/// What one worker pulled out of its lanes
#[derive(Debug, Default)]
pub(crate) struct Harvest {
    pub records: Vec<LogRecord>,
    /// `(lane, new_start)` to publish at cleanup
    pub cursors: Vec<(usize, u64)>,
}

/// Lanes a worker reads: those on its node, dealt round-robin among the
/// node's workers.
pub(crate) fn lanes_of(worker: usize, pool: &WorkerPool, stores: &Stores) -> Vec<usize> {
    let node = pool.node_of(worker);
    let rank = worker % pool.per_node();
    (0..stores.log.lane_count())
        .filter(|&lane| stores.log.lane_node(lane) == node)
        .enumerate()
        .filter(|(i, _)| i % pool.per_node() == rank)
        .map(|(_, lane)| lane)
        .collect()
}

/// Fetch generation `flip` from every lane, or every unconsumed record when
/// `flip` is `None` (replay).
pub(crate) fn fetch(pool: &WorkerPool, stores: &Arc<Stores>, flip: Option<bool>) -> Result<Vec<Harvest>> {
    let inputs: Vec<Vec<usize>> = (0..pool.len()).map(|w| lanes_of(w, pool, stores)).collect();
    let stores = Arc::clone(stores);
    pool.map(inputs, move |_, lanes| {
        let mut harvest = Harvest::default();
        for lane in lanes {
            let fetched = match flip {
                Some(flip) => stores.log.fetch(lane, flip)?,
                None => stores.log.fetch_all(lane)?,
            };
            harvest.records.extend(fetched.records);
            harvest.cursors.push((lane, fetched.new_start));
        }
        Ok(harvest)
    })
}
