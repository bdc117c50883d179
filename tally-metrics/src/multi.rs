// tally - in-process telemetry aggregation
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./multi_test.rs"]
mod multi_test;

use crate::buckets::BucketProvider;
use crate::export::{ExportedPoint, ExportedRecord};
use crate::key::AggregationKey;
use crate::observation::{AggregationKind, MetricGroup, Observation, RPC_LABEL_NAMES};
use crate::point::Point;
use crate::pool::{Pool, Recycle};
use parking_lot::Mutex;
use std::sync::Arc;

//
// SchemaMismatch
//

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SchemaMismatch {
  #[error("point count changed from {expected} to {found}")]
  PointCount { expected: usize, found: usize },
  #[error("point '{name}' changed aggregation from {expected:?} to {found:?}")]
  Aggregation {
    name: String,
    expected: AggregationKind,
    found: AggregationKind,
  },
}

//
// ConversionError
//

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("{group} record requires {expected} labels, found {found}")]
pub struct ConversionError {
  pub group: MetricGroup,
  pub expected: usize,
  pub found: usize,
}

//
// MultiValue
//

pub type SharedMultiValue = Arc<Mutex<MultiValue>>;

// All points of one dimension plus what is needed to rebuild its exported record. The point
// layout is fixed by the first observation.
#[derive(Default)]
pub struct MultiValue {
  key: AggregationKey,
  monitor: String,
  labels: Vec<String>,
  points: Vec<Point>,
}

impl MultiValue {
  pub fn bind<O: Observation + ?Sized>(
    &mut self,
    key: AggregationKey,
    observation: &O,
    point_pool: &Pool<Point>,
    buckets: &dyn BucketProvider,
  ) {
    self.key = key;
    observation.monitor().clone_into(&mut self.monitor);

    self.labels.clear();
    self
      .labels
      .extend((0 .. observation.label_count()).map(|i| observation.label_value(i).to_string()));

    debug_assert!(self.points.is_empty());
    for i in 0 .. observation.point_count() {
      let mut point = point_pool.get();
      point.bind(
        observation.point_name(i),
        observation.point_aggregation(i),
        buckets,
      );
      self.points.push(point);
    }
  }

  pub fn release_points(&mut self, point_pool: &Pool<Point>) {
    for point in self.points.drain(..) {
      point_pool.put(point);
    }
  }

  pub fn reset(&mut self) {
    self.key = AggregationKey::default();
    self.monitor.clear();
    self.labels.clear();
    self.points.clear();
  }

  #[must_use]
  pub const fn key(&self) -> &AggregationKey {
    &self.key
  }

  #[must_use]
  pub fn monitor(&self) -> &str {
    &self.monitor
  }

  #[must_use]
  pub fn labels(&self) -> &[String] {
    &self.labels
  }

  #[must_use]
  pub fn point_count(&self) -> usize {
    self.points.len()
  }

  // Applies every point value, or nothing at all when the observation's schema differs from the
  // one this dimension was created with.
  pub fn update<O: Observation + ?Sized>(
    &mut self,
    observation: &O,
    buckets: &dyn BucketProvider,
  ) -> Result<(), SchemaMismatch> {
    if observation.point_count() != self.points.len() {
      return Err(SchemaMismatch::PointCount {
        expected: self.points.len(),
        found: observation.point_count(),
      });
    }
    for (i, point) in self.points.iter().enumerate() {
      let found = observation.point_aggregation(i);
      if found != point.kind() {
        return Err(SchemaMismatch::Aggregation {
          name: point.name().to_string(),
          expected: point.kind(),
          found,
        });
      }
    }

    for (i, point) in self.points.iter_mut().enumerate() {
      point.update(observation.point_value(i), buckets);
    }
    Ok(())
  }

  pub fn rescale(&mut self, factor: f64) {
    for point in &mut self.points {
      point.rescale(factor);
    }
  }

  // Drain the points into an exported record. Returns None when nothing was observed.
  pub fn to_record(
    &mut self,
    buckets: &dyn BucketProvider,
  ) -> Result<Option<ExportedRecord>, ConversionError> {
    let group = self.key.group();
    if group.is_rpc() && self.labels.len() != RPC_LABEL_NAMES.len() {
      return Err(ConversionError {
        group,
        expected: RPC_LABEL_NAMES.len(),
        found: self.labels.len(),
      });
    }

    let mut points = Vec::<ExportedPoint>::with_capacity(self.points.len());
    for point in &mut self.points {
      point.to_exported(&mut points, buckets);
    }
    if points.is_empty() {
      return Ok(None);
    }

    Ok(Some(ExportedRecord {
      group,
      monitor: self.monitor.clone(),
      labels: self.labels.clone(),
      points,
    }))
  }
}

impl Recycle for SharedMultiValue {
  fn reset(&mut self) {
    self.lock().reset();
  }
}
