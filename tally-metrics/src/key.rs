// tally - in-process telemetry aggregation
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./key_test.rs"]
mod key_test;

use crate::observation::{MetricGroup, Observation};
use xxhash_rust::xxh64::Xxh64;

//
// AggregationKey
//

// Fixed size fingerprint of one dimension. Only hashes and lengths are compared, so two distinct
// dimensions with colliding hashes and equal lengths are aggregated together. There is no full
// label comparison behind the key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct AggregationKey {
  group: MetricGroup,
  labels_hash: u64,
  labels_len: usize,
  point_count: usize,
  // Always zero for the RPC groups.
  names_hash: u64,
  names_len: usize,
}

impl AggregationKey {
  #[must_use]
  pub fn from_observation<O: Observation + ?Sized>(observation: &O) -> Self {
    let group = observation.group();

    let mut hasher = Xxh64::new(0);
    let mut labels_len = 0;
    for i in 0 .. observation.label_count() {
      let value = observation.label_value(i);
      hasher.update(&(value.len() as u64).to_le_bytes());
      hasher.update(value.as_bytes());
      labels_len += value.len();
    }
    let labels_hash = hasher.digest();

    let point_count = observation.point_count();
    let (names_hash, names_len) = if group.is_rpc() {
      (0, 0)
    } else {
      let mut hasher = Xxh64::new(0);
      let mut names_len = 0;
      for i in 0 .. point_count {
        let name = observation.point_name(i);
        hasher.update(&(name.len() as u64).to_le_bytes());
        hasher.update(name.as_bytes());
        names_len += name.len();
      }
      (hasher.digest(), names_len)
    };

    Self {
      group,
      labels_hash,
      labels_len,
      point_count,
      names_hash,
      names_len,
    }
  }

  #[must_use]
  pub const fn group(&self) -> MetricGroup {
    self.group
  }

  // Also the dimension fingerprint used for shard selection and sampling.
  #[must_use]
  pub const fn labels_hash(&self) -> u64 {
    self.labels_hash
  }

  #[must_use]
  pub const fn point_count(&self) -> usize {
    self.point_count
  }
}
