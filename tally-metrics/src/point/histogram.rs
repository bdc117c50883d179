// tally - in-process telemetry aggregation
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./histogram_test.rs"]
mod histogram_test;

use super::rescale_count;
use crate::buckets::{BucketLayout, BucketProvider};
use crate::export::ExportSink;
use crate::observation::AggregationKind;
use std::sync::Arc;

//
// HistogramAggregation
//

// Sum, count and per bucket counts for one histogram point. Bucket counts are only tracked while
// a usable layout is bound. A layout change drops the bucket counts, they are never remapped onto
// new boundaries.
pub(super) struct HistogramAggregation {
  sum: f64,
  count: u64,
  layout: Option<Arc<BucketLayout>>,
  counts: Vec<u64>,
  // Provider generation observed at the last bind or refresh.
  generation: u64,
}

impl HistogramAggregation {
  pub(super) const fn new() -> Self {
    Self {
      sum: 0.0,
      count: 0,
      layout: None,
      counts: Vec::new(),
      generation: 0,
    }
  }

  pub(super) fn bind(&mut self, name: &str, buckets: &dyn BucketProvider) {
    self.sum = 0.0;
    self.count = 0;
    self.generation = buckets.generation();
    let layout = buckets.layout(name);
    if layout.is_none() {
      log::debug!("no bucket layout for histogram '{name}', tracking sum and count only");
    }
    self.install(layout);
  }

  pub(super) fn reset(&mut self) {
    self.sum = 0.0;
    self.count = 0;
    self.layout = None;
    self.counts.clear();
    self.generation = 0;
  }

  fn install(&mut self, layout: Option<Arc<BucketLayout>>) {
    self.counts.clear();
    if let Some(layout) = &layout {
      self.counts.resize(layout.len(), 0);
    }
    self.layout = layout;
  }

  // Compare the live layout with the bound one and rebuild on any identity change.
  pub(super) fn refresh(&mut self, name: &str, buckets: &dyn BucketProvider) {
    self.generation = buckets.generation();
    let live = buckets.layout(name);
    let bound_key = self.layout.as_ref().map(|layout| layout.key());
    let live_key = live.as_ref().map(|layout| layout.key());
    if bound_key != live_key {
      log::debug!(
        "bucket layout for histogram '{name}' changed from {bound_key:?} to {live_key:?}, \
         discarding bucket counts"
      );
      self.install(live);
    }
  }

  pub(super) fn update(&mut self, value: f64, name: &str, buckets: &dyn BucketProvider) {
    if buckets.generation() != self.generation {
      self.refresh(name, buckets);
    }

    self.sum += value;
    self.count += 1;
    if let Some(layout) = &self.layout {
      self.counts[layout.bucket_index(value)] += 1;
    }
  }

  // Emits <name>_sum, <name>_count and one <name>_bucket output per non-empty bucket, then zeroes
  // the accumulated state while keeping the layout.
  pub(super) fn drain<S: ExportSink + Default>(&mut self, name: &str, out: &mut Vec<S>) -> usize {
    let mut sum = S::default();
    sum.set_name(&format!("{name}_sum"));
    sum.set_aggregation(AggregationKind::Histogram);
    sum.set_value(std::mem::take(&mut self.sum));
    out.push(sum);

    let mut count = S::default();
    count.set_name(&format!("{name}_count"));
    count.set_aggregation(AggregationKind::Histogram);
    count.set_count(std::mem::take(&mut self.count));
    out.push(count);

    let mut emitted = 2;
    if let Some(layout) = &self.layout {
      let bucket_name = format!("{name}_bucket");
      for (index, bucket_count) in self.counts.iter_mut().enumerate() {
        if *bucket_count == 0 {
          continue;
        }
        let mut bucket = S::default();
        bucket.set_name(&bucket_name);
        bucket.set_aggregation(AggregationKind::Histogram);
        bucket.set_histogram(layout.range(index), std::mem::take(bucket_count));
        out.push(bucket);
        emitted += 1;
      }
    }
    emitted
  }

  pub(super) fn rescale(&mut self, factor: f64) {
    self.sum *= factor;
    self.count = rescale_count(self.count, factor);
    for bucket_count in &mut self.counts {
      *bucket_count = rescale_count(*bucket_count, factor);
    }
  }
}
