// TIMEOUT TABLE
// ORDERED (BY THRESHOLD_SECONDS, ASCENDING) COLLECTION OF COMMAND BUCKETS.
// THRESHOLD 0 IS RESERVED FOR THE RESET BUCKET AND IS NEVER RETURNED BY
// next() OR TOUCHED BY exec_range().

use std::fmt::Write as _;

use crate::daemon;

/// Commands registered at a single threshold, in input order.
#[derive(Debug, Default, Clone)]
pub struct Bucket {
    pub threshold_secs: u32,
    pub commands: Vec<String>,
}

#[derive(Debug, Default)]
pub struct TimeoutTable {
    buckets: Vec<Bucket>,
}

impl TimeoutTable {
    pub fn new() -> Self {
        Self { buckets: Vec::new() }
    }

    fn find_slot(&self, threshold_secs: u32) -> Result<usize, usize> {
        self.buckets
            .binary_search_by_key(&threshold_secs, |b| b.threshold_secs)
    }

    /// Appends `cmd` to the bucket for `threshold_secs`, creating it if absent.
    /// Commands within a bucket retain insertion order (invariant 4, spec §8).
    pub fn append(&mut self, threshold_secs: u32, cmd: String) {
        match self.find_slot(threshold_secs) {
            Ok(idx) => self.buckets[idx].commands.push(cmd),
            Err(idx) => self.buckets.insert(
                idx,
                Bucket { threshold_secs, commands: vec![cmd] },
            ),
        }
    }

    pub fn get(&self, threshold_secs: u32) -> Option<&Bucket> {
        self.find_slot(threshold_secs).ok().map(|idx| &self.buckets[idx])
    }

    /// Smallest threshold strictly greater than `after`, skipping 0.
    pub fn next(&self, after: u32) -> Option<u32> {
        let start = self.buckets.partition_point(|b| b.threshold_secs <= after);
        self.buckets[start..]
            .iter()
            .find(|b| b.threshold_secs > 0)
            .map(|b| b.threshold_secs)
    }

    /// Fires every non-zero bucket with threshold in `(from, to]`, ascending.
    /// Returns the number of commands spawned.
    pub fn exec_range(&self, from: u32, to: u32) -> usize {
        let mut count = 0;
        for bucket in &self.buckets {
            if bucket.threshold_secs == 0 {
                continue;
            }
            if bucket.threshold_secs > to {
                break;
            }
            if bucket.threshold_secs > from {
                count += exec_bucket(bucket);
            }
        }
        count
    }

    pub fn exec_reset(&self) -> usize {
        match self.get(0) {
            Some(bucket) => exec_bucket(bucket),
            None => 0,
        }
    }

    pub fn inspect(&self) -> String {
        let mut out = String::new();
        let _ = write!(out, "{{");
        for (i, bucket) in self.buckets.iter().enumerate() {
            if i != 0 {
                let _ = write!(out, ", ");
            }
            let _ = write!(out, "{}: [", bucket.threshold_secs);
            for (j, cmd) in bucket.commands.iter().enumerate() {
                if j != 0 {
                    let _ = write!(out, ", ");
                }
                let _ = write!(out, "{cmd:?}");
            }
            let _ = write!(out, "]");
        }
        let _ = write!(out, "}}");
        out
    }
}

fn exec_bucket(bucket: &Bucket) -> usize {
    let mut count = 0;
    for cmd in &bucket.commands {
        if let Err(err) = daemon::spawn_detached(cmd) {
            tracing::warn!(%cmd, error = %err, "failed to spawn command");
            continue;
        }
        count += 1;
    }
    count
}
