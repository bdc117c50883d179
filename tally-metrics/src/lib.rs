// tally - in-process telemetry aggregation
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

pub mod aggregator;
pub mod buckets;
pub mod config;
pub mod export;
pub mod key;
pub mod multi;
pub mod observation;
pub mod point;
pub mod pool;
pub mod processor;
pub mod sampler;
pub mod shard;
#[cfg(test)]
pub mod test;
pub mod time;

#[cfg(test)]
#[ctor::ctor]
fn test_global_init() {
  use tally_common::global_initialize;

  global_initialize();
}
