// tally - in-process telemetry aggregation
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./shard_test.rs"]
mod shard_test;

use crate::key::AggregationKey;
use crate::multi::SharedMultiValue;
use crate::observation::MetricGroup;
use ahash::HashMap;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};

//
// Shard
//

#[derive(Default)]
pub struct Shard {
  entries: Mutex<HashMap<AggregationKey, SharedMultiValue>>,
}

impl Shard {
  pub fn lock(&self) -> MutexGuard<'_, HashMap<AggregationKey, SharedMultiValue>> {
    self.entries.lock()
  }

  // Only usable once the owning buffer is out of the writer slot.
  pub fn drain(&mut self) -> impl Iterator<Item = (AggregationKey, SharedMultiValue)> + '_ {
    self.entries.get_mut().drain()
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.entries.lock().len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

//
// Buffer
//

// One complete window worth of dimensions, partitioned by group and then by label hash.
pub struct Buffer {
  shards: Vec<Vec<Shard>>,
  active_dimensions: AtomicU64,
  active_points: AtomicU64,
}

impl Buffer {
  #[must_use]
  pub fn new(shard_count: usize) -> Self {
    let shard_count = shard_count.max(1);
    Self {
      shards: MetricGroup::ALL
        .iter()
        .map(|_| (0 .. shard_count).map(|_| Shard::default()).collect())
        .collect(),
      active_dimensions: AtomicU64::new(0),
      active_points: AtomicU64::new(0),
    }
  }

  #[must_use]
  pub fn shard_count(&self) -> usize {
    self.shards[0].len()
  }

  #[must_use]
  pub fn shard(&self, key: &AggregationKey) -> &Shard {
    let shards = &self.shards[key.group().index()];
    // The modulus is bounded by the shard count so the cast back cannot truncate.
    #[allow(clippy::cast_possible_truncation)]
    let index = (key.labels_hash() % shards.len() as u64) as usize;
    &shards[index]
  }

  pub fn shards_mut(&mut self) -> impl Iterator<Item = &mut Shard> {
    self.shards.iter_mut().flatten()
  }

  pub fn add_dimension(&self, point_count: usize) {
    self.active_dimensions.fetch_add(1, Ordering::Relaxed);
    self
      .active_points
      .fetch_add(point_count as u64, Ordering::Relaxed);
  }

  #[must_use]
  pub fn active_dimensions(&self) -> u64 {
    self.active_dimensions.load(Ordering::Relaxed)
  }

  #[must_use]
  pub fn active_points(&self) -> u64 {
    self.active_points.load(Ordering::Relaxed)
  }

  // Returns the (dimensions, points) totals that were cleared.
  pub fn reset_totals(&mut self) -> (u64, u64) {
    (
      std::mem::take(self.active_dimensions.get_mut()),
      std::mem::take(self.active_points.get_mut()),
    )
  }
}
