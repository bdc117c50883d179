// tally - in-process telemetry aggregation
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./pool_test.rs"]
mod pool_test;

use crate::buckets::BucketProvider;
use crate::key::AggregationKey;
use crate::multi::{MultiValue, SharedMultiValue};
use crate::observation::Observation;
use crate::point::Point;
use crossbeam::queue::ArrayQueue;

//
// Recycle
//

// Anything that can be returned to a pool. reset() must leave the object indistinguishable from a
// freshly defaulted one as far as the next user can observe.
pub trait Recycle: Default {
  fn reset(&mut self);
}

impl Recycle for Point {
  fn reset(&mut self) {
    Self::reset(self);
  }
}

//
// Pool
//

// Bounded lock free free list. Objects are reset on the way in, so anything handed out is clean.
// Returns beyond capacity are dropped and a zero capacity pool never retains anything.
pub struct Pool<T: Recycle> {
  free: Option<ArrayQueue<T>>,
}

impl<T: Recycle> Pool<T> {
  #[must_use]
  pub fn new(capacity: usize) -> Self {
    Self {
      free: (capacity > 0).then(|| ArrayQueue::new(capacity)),
    }
  }

  pub fn get(&self) -> T {
    self
      .free
      .as_ref()
      .and_then(ArrayQueue::pop)
      .unwrap_or_default()
  }

  pub fn put(&self, mut item: T) {
    let Some(free) = &self.free else {
      return;
    };
    item.reset();
    // Full, let it drop.
    let _ignored = free.push(item);
  }

  #[must_use]
  pub fn available(&self) -> usize {
    self.free.as_ref().map_or(0, ArrayQueue::len)
  }
}

//
// Pools
//

// The free lists shared by every aggregator of one processor.
pub struct Pools {
  multi_values: Pool<SharedMultiValue>,
  points: Pool<Point>,
}

impl Pools {
  #[must_use]
  pub fn new(capacity: usize) -> Self {
    Self {
      multi_values: Pool::new(capacity),
      points: Pool::new(capacity),
    }
  }

  // Build the storage for a new dimension from pooled objects, shaped after its first
  // observation.
  pub fn acquire<O: Observation + ?Sized>(
    &self,
    key: AggregationKey,
    observation: &O,
    buckets: &dyn BucketProvider,
  ) -> SharedMultiValue {
    let multi_value = self.multi_values.get();
    multi_value
      .lock()
      .bind(key, observation, &self.points, buckets);
    multi_value
  }

  // Return a drained dimension and its points. The caller must hold the only reference.
  pub fn release(&self, multi_value: SharedMultiValue) {
    multi_value.lock().release_points(&self.points);
    self.multi_values.put(multi_value);
  }

  #[must_use]
  pub fn available_multi_values(&self) -> usize {
    self.multi_values.available()
  }

  #[must_use]
  pub fn available_points(&self) -> usize {
    self.points.available()
  }
}
