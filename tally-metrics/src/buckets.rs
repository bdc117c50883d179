// tally - in-process telemetry aggregation
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./buckets_test.rs"]
mod buckets_test;

use crate::config::HistogramConfig;
use ahash::HashMap;
use parking_lot::RwLock;
use std::fmt::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

//
// BucketLayout
//

// An immutable, shareable histogram bucket configuration. Bucket i covers
// [boundaries[i], boundaries[i + 1]) and the last bucket is open ended. Values below the first
// boundary are counted in the first bucket.
#[derive(Debug, PartialEq)]
pub struct BucketLayout {
  key: String,
  boundaries: Vec<f64>,
  ranges: Vec<String>,
}

impl BucketLayout {
  // Returns None for an empty or non-finite boundary set. Boundaries are sorted, deduplicated and
  // get an implicit 0 prepended when every boundary is positive.
  #[must_use]
  pub fn new(boundaries: &[f64]) -> Option<Arc<Self>> {
    let boundaries = normalize(boundaries)?;
    let key = layout_key(&boundaries);
    let ranges = boundaries
      .iter()
      .enumerate()
      .map(|(i, lower)| {
        boundaries.get(i + 1).map_or_else(
          || format!("[{lower},+Inf)"),
          |upper| format!("[{lower},{upper})"),
        )
      })
      .collect();

    Some(Arc::new(Self {
      key,
      boundaries,
      ranges,
    }))
  }

  #[must_use]
  pub fn key(&self) -> &str {
    &self.key
  }

  #[must_use]
  pub fn boundaries(&self) -> &[f64] {
    &self.boundaries
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.boundaries.len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.boundaries.is_empty()
  }

  #[must_use]
  pub fn range(&self, index: usize) -> &str {
    &self.ranges[index]
  }

  // Lower bound search for the bucket containing value.
  #[must_use]
  pub fn bucket_index(&self, value: f64) -> usize {
    self
      .boundaries
      .partition_point(|boundary| *boundary <= value)
      .saturating_sub(1)
  }
}

fn normalize(boundaries: &[f64]) -> Option<Vec<f64>> {
  if boundaries.is_empty() || boundaries.iter().any(|b| !b.is_finite()) {
    return None;
  }

  let mut sorted = boundaries.to_vec();
  sorted.sort_by(f64::total_cmp);
  sorted.dedup();
  if sorted[0] > 0.0 {
    sorted.insert(0, 0.0);
  }
  Some(sorted)
}

// Deterministic identity of a normalized boundary set, e.g. "0.00e0_2.50e-2_2.50e-1".
fn layout_key(boundaries: &[f64]) -> String {
  let mut key = String::with_capacity(boundaries.len() * 8);
  for (i, boundary) in boundaries.iter().enumerate() {
    if i > 0 {
      key.push('_');
    }
    // Writing to a String cannot fail.
    let _ = write!(key, "{boundary:.2e}");
  }
  key
}

//
// BucketProvider
//

// Supplies the currently active bucket layout for a histogram name. Re-queried by histogram points
// after every drain, and on update whenever generation() moves.
pub trait BucketProvider: Send + Sync {
  fn layout(&self, name: &str) -> Option<Arc<BucketLayout>>;

  // Bumped every time any layout may have changed.
  fn generation(&self) -> u64 {
    0
  }
}

//
// ConfiguredBuckets
//

#[derive(Default)]
struct Layouts {
  default: Option<Arc<BucketLayout>>,
  by_name: HashMap<String, Arc<BucketLayout>>,
}

// Bucket provider backed by the `histograms` section of the engine config. Layouts are swapped as
// a whole on reload.
#[derive(Default)]
pub struct ConfiguredBuckets {
  layouts: RwLock<Layouts>,
  generation: AtomicU64,
}

impl ConfiguredBuckets {
  #[must_use]
  pub fn new(config: &HistogramConfig) -> Self {
    let buckets = Self::default();
    buckets.update(config);
    buckets
  }

  pub fn update(&self, config: &HistogramConfig) {
    let layouts = Layouts {
      default: BucketLayout::new(&config.default_buckets),
      by_name: config
        .buckets
        .iter()
        .filter_map(|(name, boundaries)| {
          let layout = BucketLayout::new(boundaries);
          if layout.is_none() {
            log::warn!("ignoring unusable bucket boundaries for histogram '{name}'");
          }
          layout.map(|layout| (name.clone(), layout))
        })
        .collect(),
    };
    log::debug!(
      "installing {} named bucket layout(s), default layout present: {}",
      layouts.by_name.len(),
      layouts.default.is_some()
    );

    *self.layouts.write() = layouts;
    self.generation.fetch_add(1, Ordering::Release);
  }
}

impl BucketProvider for ConfiguredBuckets {
  fn layout(&self, name: &str) -> Option<Arc<BucketLayout>> {
    let layouts = self.layouts.read();
    layouts
      .by_name
      .get(name)
      .or(layouts.default.as_ref())
      .cloned()
  }

  fn generation(&self) -> u64 {
    self.generation.load(Ordering::Acquire)
  }
}
