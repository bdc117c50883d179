// tally - in-process telemetry aggregation
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::config::EngineConfig;
use crate::observation::{AggregationKind, MetricGroup};
use async_trait::async_trait;
use std::sync::Arc;

//
// ExportSink
//

// Target structure a drained point writes into. One sink receives exactly one output.
pub trait ExportSink {
  fn set_name(&mut self, name: &str);
  fn set_aggregation(&mut self, aggregation: AggregationKind);
  fn set_value(&mut self, value: f64);
  fn set_count(&mut self, count: u64);
  fn set_avg(&mut self, sum: f64, count: u64);
  fn set_histogram(&mut self, range: &str, count: u64);
}

//
// ExportedValue
//

#[derive(Clone, Debug, PartialEq)]
pub enum ExportedValue {
  Value(f64),
  Count(u64),
  Avg { sum: f64, count: u64 },
  Bucket { range: String, count: u64 },
}

impl Default for ExportedValue {
  fn default() -> Self {
    Self::Value(0.0)
  }
}

//
// ExportedPoint
//

#[derive(Clone, Debug, PartialEq)]
pub struct ExportedPoint {
  pub name: String,
  pub aggregation: AggregationKind,
  pub value: ExportedValue,
}

impl Default for ExportedPoint {
  fn default() -> Self {
    Self {
      name: String::new(),
      aggregation: AggregationKind::Counter,
      value: ExportedValue::default(),
    }
  }
}

impl ExportedPoint {
  #[must_use]
  pub fn new(name: impl Into<String>, aggregation: AggregationKind, value: ExportedValue) -> Self {
    Self {
      name: name.into(),
      aggregation,
      value,
    }
  }
}

impl ExportSink for ExportedPoint {
  fn set_name(&mut self, name: &str) {
    name.clone_into(&mut self.name);
  }

  fn set_aggregation(&mut self, aggregation: AggregationKind) {
    self.aggregation = aggregation;
  }

  fn set_value(&mut self, value: f64) {
    self.value = ExportedValue::Value(value);
  }

  fn set_count(&mut self, count: u64) {
    self.value = ExportedValue::Count(count);
  }

  fn set_avg(&mut self, sum: f64, count: u64) {
    self.value = ExportedValue::Avg { sum, count };
  }

  fn set_histogram(&mut self, range: &str, count: u64) {
    self.value = ExportedValue::Bucket {
      range: range.to_string(),
      count,
    };
  }
}

//
// ExportedRecord
//

// One flushed dimension. Label values are in the order the observation exposed them; for the RPC
// groups that order is `observation::RPC_LABEL_NAMES`.
#[derive(Clone, Debug, PartialEq)]
pub struct ExportedRecord {
  pub group: MetricGroup,
  pub monitor: String,
  pub labels: Vec<String>,
  pub points: Vec<ExportedPoint>,
}

impl ExportedRecord {
  #[must_use]
  pub fn point(&self, name: &str) -> Option<&ExportedPoint> {
    self.points.iter().find(|p| p.name == name)
  }
}

//
// MetricsExporter
//

// Consumes the assembled batch of one flush window. Delivery guarantees belong to the implementor.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetricsExporter: Send + Sync {
  async fn export(&self, batch: Vec<ExportedRecord>);

  fn update_config(&self, config: Arc<EngineConfig>);
}

pub type DynamicMetricsExporter = Arc<dyn MetricsExporter>;
