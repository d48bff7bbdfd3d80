//! Reading records back: point reads by id and generation fetches

use std::sync::atomic::Ordering;

use crate::error::{Result, TierError};

use super::record::{LogId, LogRecord, RECORD_WORDS};
use super::LogLayer;

/// Records harvested from one lane
#[derive(Debug, Default)]
pub struct Fetched {
    pub lane: usize,
    pub records: Vec<LogRecord>,
    /// Start cursor to publish once the records are applied
    pub new_start: u64,
}

impl LogLayer {
    /// Read the record at `id`, from the ring or the staging buffer.
    ///
    /// The caller must be inside a QSBR operation and have obtained `id`
    /// from a live inode slot, so the record cannot have been consumed.
    pub fn read(&self, id: LogId) -> Result<LogRecord> {
        let lane = &self.lanes[id.lane()];
        let pos = id.pos();
        let words = lane.seq.read(|| {
            let end = lane.end.load(Ordering::Acquire);
            let mut words = [0u64; RECORD_WORDS];
            if pos < end {
                self.regions[lane.node].read_into(lane.ring_word(pos), &mut words);
            } else {
                let idx = ((pos - end) as usize).min(lane.staging_cap() - 1);
                for (w, a) in words.iter_mut().zip(lane.staging_slot(idx)) {
                    *w = a.load(Ordering::Relaxed);
                }
            }
            words
        });
        LogRecord::from_words(&words)
            .ok_or_else(|| TierError::Corruption(format!("no record at {:?}", id)))
    }

    /// Durable records of generation `flip` from the lane's start, stopping
    /// at the first record of the other generation.
    pub fn fetch(&self, lane: usize, flip: bool) -> Result<Fetched> {
        self.fetch_where(lane, |r| r.flip == flip)
    }

    /// Every unconsumed durable record of the lane (recovery)
    pub fn fetch_all(&self, lane: usize) -> Result<Fetched> {
        self.fetch_where(lane, |_| true)
    }

    fn fetch_where(&self, lane_id: usize, mut keep: impl FnMut(&LogRecord) -> bool) -> Result<Fetched> {
        let lane = &self.lanes[lane_id];
        let start = lane.start.load(Ordering::Acquire);
        let end = lane.end.load(Ordering::Acquire);
        let region = &self.regions[lane.node];

        let mut records = Vec::with_capacity((end - start) as usize);
        let mut words = [0u64; RECORD_WORDS];
        let mut pos = start;
        while pos < end {
            region.read_into(lane.ring_word(pos), &mut words);
            let record = LogRecord::from_words(&words).ok_or_else(|| {
                TierError::Corruption(format!("lane {} position {} holds no record", lane_id, pos))
            })?;
            if !keep(&record) {
                break;
            }
            records.push(record);
            pos += 1;
        }

        Ok(Fetched {
            lane: lane_id,
            records,
            new_start: pos,
        })
    }
}
