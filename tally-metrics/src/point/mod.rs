// tally - in-process telemetry aggregation
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


mod histogram;

use self::histogram::HistogramAggregation;
use crate::buckets::BucketProvider;
use crate::export::ExportSink;
use crate::observation::AggregationKind;
use tally_common::{LossyIntoToFloat, round_half_up};

//
// Aggregation
//

// Per kind accumulated state. The variant is chosen when the point is bound and never changes
// until the point is reset back into the pool.
enum Aggregation {
  Counter { value: f64 },
  Sum { value: f64 },
  Avg { sum: f64, count: u64 },
  Set { value: f64 },
  Max { value: f64 },
  Min { value: f64 },
  Histogram(HistogramAggregation),
}

impl Aggregation {
  const fn kind(&self) -> AggregationKind {
    match self {
      Self::Counter { .. } => AggregationKind::Counter,
      Self::Sum { .. } => AggregationKind::Sum,
      Self::Avg { .. } => AggregationKind::Avg,
      Self::Set { .. } => AggregationKind::Set,
      Self::Max { .. } => AggregationKind::Max,
      Self::Min { .. } => AggregationKind::Min,
      Self::Histogram(_) => AggregationKind::Histogram,
    }
  }

  const fn empty(kind: AggregationKind) -> Self {
    match kind {
      AggregationKind::Counter => Self::Counter { value: 0.0 },
      AggregationKind::Sum => Self::Sum { value: 0.0 },
      AggregationKind::Avg => Self::Avg { sum: 0.0, count: 0 },
      AggregationKind::Set => Self::Set { value: 0.0 },
      AggregationKind::Max => Self::Max {
        value: f64::NEG_INFINITY,
      },
      AggregationKind::Min => Self::Min {
        value: f64::INFINITY,
      },
      AggregationKind::Histogram => Self::Histogram(HistogramAggregation::new()),
    }
  }
}

//
// Point
//

// A single named numeric series inside a dimension.
pub struct Point {
  name: String,
  aggregation: Aggregation,
  // Monotonic over the lifetime of the binding. The point is empty when nothing was observed
  // since the last drain.
  observations: u64,
  drained_observations: u64,
}

impl Default for Point {
  fn default() -> Self {
    Self {
      name: String::new(),
      aggregation: Aggregation::empty(AggregationKind::Counter),
      observations: 0,
      drained_observations: 0,
    }
  }
}

impl Point {
  #[must_use]
  pub fn new(name: &str, kind: AggregationKind, buckets: &dyn BucketProvider) -> Self {
    let mut point = Self::default();
    point.bind(name, kind, buckets);
    point
  }

  // Initialize a fresh or pooled point. Histogram storage is reused when the pooled point was
  // already a histogram.
  pub fn bind(&mut self, name: &str, kind: AggregationKind, buckets: &dyn BucketProvider) {
    name.clone_into(&mut self.name);
    self.observations = 0;
    self.drained_observations = 0;
    if kind == AggregationKind::Histogram
      && let Aggregation::Histogram(histogram) = &mut self.aggregation
    {
      histogram.bind(name, buckets);
      return;
    }

    self.aggregation = Aggregation::empty(kind);
    if let Aggregation::Histogram(histogram) = &mut self.aggregation {
      histogram.bind(name, buckets);
    }
  }

  // Clear everything before the point goes back into the pool.
  pub fn reset(&mut self) {
    self.name.clear();
    self.observations = 0;
    self.drained_observations = 0;
    match &mut self.aggregation {
      Aggregation::Histogram(histogram) => histogram.reset(),
      other => *other = Aggregation::empty(other.kind()),
    }
  }

  #[must_use]
  pub fn name(&self) -> &str {
    &self.name
  }

  #[must_use]
  pub const fn kind(&self) -> AggregationKind {
    self.aggregation.kind()
  }

  #[must_use]
  pub const fn is_empty(&self) -> bool {
    self.observations == self.drained_observations
  }

  pub fn update(&mut self, value: f64, buckets: &dyn BucketProvider) {
    self.observations = self.observations.wrapping_add(1);
    match &mut self.aggregation {
      Aggregation::Counter { value: total } | Aggregation::Sum { value: total } => *total += value,
      Aggregation::Avg { sum, count } => {
        *sum += value;
        *count += 1;
      },
      Aggregation::Set { value: current } => *current = value,
      Aggregation::Max { value: current } => *current = current.max(value),
      Aggregation::Min { value: current } => *current = current.min(value),
      Aggregation::Histogram(histogram) => histogram.update(value, &self.name, buckets),
    }
  }

  // Drain accumulated state into newly pushed sinks. Returns the number of outputs, 0 when nothing
  // was observed since the previous drain.
  pub fn to_exported<S: ExportSink + Default>(
    &mut self,
    out: &mut Vec<S>,
    buckets: &dyn BucketProvider,
  ) -> usize {
    if self.is_empty() {
      return 0;
    }
    self.drained_observations = self.observations;

    let kind = self.kind();
    let emitted = match &mut self.aggregation {
      Aggregation::Counter { value } | Aggregation::Sum { value } => {
        push_value(out, &self.name, kind, std::mem::take(value));
        1
      },
      Aggregation::Avg { sum, count } => {
        let mut sink = S::default();
        sink.set_name(&self.name);
        sink.set_aggregation(kind);
        sink.set_avg(std::mem::take(sum), std::mem::take(count));
        out.push(sink);
        1
      },
      Aggregation::Set { value } => {
        push_value(out, &self.name, kind, std::mem::take(value));
        1
      },
      Aggregation::Max { value } => {
        push_value(
          out,
          &self.name,
          kind,
          std::mem::replace(value, f64::NEG_INFINITY),
        );
        1
      },
      Aggregation::Min { value } => {
        push_value(
          out,
          &self.name,
          kind,
          std::mem::replace(value, f64::INFINITY),
        );
        1
      },
      Aggregation::Histogram(histogram) => {
        let emitted = histogram.drain(&self.name, out);
        histogram.refresh(&self.name, buckets);
        emitted
      },
    };
    log::trace!("drained {emitted} output(s) from point '{}'", self.name);
    emitted
  }

  // Scale accumulated totals toward the unsampled magnitude. Latest value and extremum kinds are
  // left untouched.
  pub fn rescale(&mut self, factor: f64) {
    match &mut self.aggregation {
      Aggregation::Counter { value } | Aggregation::Sum { value } => *value *= factor,
      Aggregation::Avg { sum, count } => {
        *sum *= factor;
        *count = rescale_count(*count, factor);
      },
      Aggregation::Set { .. } | Aggregation::Max { .. } | Aggregation::Min { .. } => {},
      Aggregation::Histogram(histogram) => histogram.rescale(factor),
    }
  }
}

fn push_value<S: ExportSink + Default>(
  out: &mut Vec<S>,
  name: &str,
  kind: AggregationKind,
  value: f64,
) {
  let mut sink = S::default();
  sink.set_name(name);
  sink.set_aggregation(kind);
  sink.set_value(value);
  out.push(sink);
}

fn rescale_count(count: u64, factor: f64) -> u64 {
  round_half_up(count.lossy_to_f64() * factor)
}
