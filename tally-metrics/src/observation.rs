// tally - in-process telemetry aggregation
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use serde::Deserialize;
use std::fmt;

//
// MetricGroup
//

// The metric family an observation belongs to. Each group gets its own set of shards.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetricGroup {
  #[default]
  RpcClient,
  RpcServer,
  Runtime,
  Custom,
}

impl MetricGroup {
  pub const ALL: [Self; 4] = [Self::RpcClient, Self::RpcServer, Self::Runtime, Self::Custom];

  #[must_use]
  pub const fn index(self) -> usize {
    match self {
      Self::RpcClient => 0,
      Self::RpcServer => 1,
      Self::Runtime => 2,
      Self::Custom => 3,
    }
  }

  // RPC groups have a fixed point schema so point names never need to be part of the key.
  #[must_use]
  pub const fn is_rpc(self) -> bool {
    matches!(self, Self::RpcClient | Self::RpcServer)
  }
}

impl fmt::Display for MetricGroup {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::RpcClient => "rpc_client",
      Self::RpcServer => "rpc_server",
      Self::Runtime => "runtime",
      Self::Custom => "custom",
    })
  }
}

//
// AggregationKind
//

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationKind {
  Counter,
  Sum,
  Avg,
  Set,
  Max,
  Min,
  Histogram,
}

//
// Observation
//

// The capability set the engine needs from an incoming metric. The engine never depends on a
// concrete metric type.
pub trait Observation {
  fn group(&self) -> MetricGroup;
  fn monitor(&self) -> &str;
  fn point_count(&self) -> usize;
  fn point_name(&self, index: usize) -> &str;
  fn point_aggregation(&self, index: usize) -> AggregationKind;
  fn point_value(&self, index: usize) -> f64;
  fn label_count(&self) -> usize;
  fn label_value(&self, index: usize) -> &str;
}

//
// RpcMetric
//

pub const RPC_STARTED: &str = "started_total";
pub const RPC_HANDLED: &str = "handled_total";
pub const RPC_HANDLED_SECONDS: &str = "handled_seconds";

const RPC_POINTS: [(&str, AggregationKind); 3] = [
  (RPC_STARTED, AggregationKind::Counter),
  (RPC_HANDLED, AggregationKind::Counter),
  (RPC_HANDLED_SECONDS, AggregationKind::Histogram),
];

// Label order is part of the exported record schema for both RPC groups.
pub const RPC_LABEL_NAMES: [&str; 6] = [
  "caller_service",
  "caller_method",
  "callee_service",
  "callee_method",
  "callee_container",
  "code",
];

// One finished (or started) RPC as seen by either side of the call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RpcMetric {
  pub monitor: String,
  pub labels: RpcLabels,
  pub started: f64,
  pub handled: f64,
  pub handled_seconds: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RpcLabels {
  pub caller_service: String,
  pub caller_method: String,
  pub callee_service: String,
  pub callee_method: String,
  pub callee_container: String,
  pub code: String,
}

impl RpcLabels {
  fn get(&self, index: usize) -> &str {
    match index {
      0 => &self.caller_service,
      1 => &self.caller_method,
      2 => &self.callee_service,
      3 => &self.callee_method,
      4 => &self.callee_container,
      5 => &self.code,
      _ => panic!("rpc label index {index} out of range"),
    }
  }
}

impl RpcMetric {
  fn point_value(&self, index: usize) -> f64 {
    match index {
      0 => self.started,
      1 => self.handled,
      2 => self.handled_seconds,
      _ => panic!("rpc point index {index} out of range"),
    }
  }
}

// The two RPC groups share one shape and differ only by group. Wrapping keeps the group a
// compile time property of the entry point used.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RpcClientMetric(pub RpcMetric);

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RpcServerMetric(pub RpcMetric);

macro_rules! impl_rpc_observation {
  ($type:ty, $group:expr) => {
    impl Observation for $type {
      fn group(&self) -> MetricGroup {
        $group
      }

      fn monitor(&self) -> &str {
        &self.0.monitor
      }

      fn point_count(&self) -> usize {
        RPC_POINTS.len()
      }

      fn point_name(&self, index: usize) -> &str {
        RPC_POINTS[index].0
      }

      fn point_aggregation(&self, index: usize) -> AggregationKind {
        RPC_POINTS[index].1
      }

      fn point_value(&self, index: usize) -> f64 {
        self.0.point_value(index)
      }

      fn label_count(&self) -> usize {
        RPC_LABEL_NAMES.len()
      }

      fn label_value(&self, index: usize) -> &str {
        self.0.labels.get(index)
      }
    }
  };
}

impl_rpc_observation!(RpcClientMetric, MetricGroup::RpcClient);
impl_rpc_observation!(RpcServerMetric, MetricGroup::RpcServer);

//
// CustomMetric
//

#[derive(Clone, Debug, PartialEq)]
pub struct CustomPoint {
  pub name: String,
  pub aggregation: AggregationKind,
  pub value: f64,
}

impl CustomPoint {
  #[must_use]
  pub fn new(name: impl Into<String>, aggregation: AggregationKind, value: f64) -> Self {
    Self {
      name: name.into(),
      aggregation,
      value,
    }
  }
}

// A user defined metric or a process level gauge set. The point names vary per metric so they are
// part of the dimension identity.
#[derive(Clone, Debug, PartialEq)]
pub struct CustomMetric {
  group: MetricGroup,
  pub monitor: String,
  pub labels: Vec<String>,
  pub points: Vec<CustomPoint>,
}

impl CustomMetric {
  #[must_use]
  pub fn custom(monitor: impl Into<String>, labels: Vec<String>, points: Vec<CustomPoint>) -> Self {
    Self {
      group: MetricGroup::Custom,
      monitor: monitor.into(),
      labels,
      points,
    }
  }

  #[must_use]
  pub fn runtime(monitor: impl Into<String>, labels: Vec<String>, points: Vec<CustomPoint>) -> Self {
    Self {
      group: MetricGroup::Runtime,
      monitor: monitor.into(),
      labels,
      points,
    }
  }
}

impl Observation for CustomMetric {
  fn group(&self) -> MetricGroup {
    self.group
  }

  fn monitor(&self) -> &str {
    &self.monitor
  }

  fn point_count(&self) -> usize {
    self.points.len()
  }

  fn point_name(&self, index: usize) -> &str {
    &self.points[index].name
  }

  fn point_aggregation(&self, index: usize) -> AggregationKind {
    self.points[index].aggregation
  }

  fn point_value(&self, index: usize) -> f64 {
    self.points[index].value
  }

  fn label_count(&self) -> usize {
    self.labels.len()
  }

  fn label_value(&self, index: usize) -> &str {
    &self.labels[index]
  }
}
