// tally - in-process telemetry aggregation
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


use crate::aggregator::{ActiveGauges, AggregatorShared};
use crate::buckets::ConfiguredBuckets;
use crate::config::{HistogramConfig, SamplingRule};
use crate::export::{ExportedRecord, MockMetricsExporter};
use crate::observation::{
  AggregationKind,
  CustomMetric,
  CustomPoint,
  RpcLabels,
  RpcMetric,
  RpcServerMetric,
};
use crate::pool::Pools;
use crate::sampler::{Sampler, UniformRandom};
use bd_server_stats::stats::Scope;
use std::sync::Arc;
use tokio::sync::mpsc;

pub fn make_rpc_server(caller_service: &str, handled_seconds: f64) -> RpcServerMetric {
  RpcServerMetric(RpcMetric {
    monitor: "rpc".to_string(),
    labels: RpcLabels {
      caller_service: caller_service.to_string(),
      caller_method: "Call".to_string(),
      callee_service: "backend".to_string(),
      callee_method: "Handle".to_string(),
      callee_container: "main".to_string(),
      code: "0".to_string(),
    },
    started: 1.0,
    handled: 1.0,
    handled_seconds,
  })
}

// A custom metric with a single counter point named "requests".
pub fn make_custom(monitor: &str, label: &str, value: f64) -> CustomMetric {
  CustomMetric::custom(
    monitor,
    vec![label.to_string()],
    vec![CustomPoint::new("requests", AggregationKind::Counter, value)],
  )
}

// An exporter that forwards every batch into a channel and accepts any config.
pub fn make_channel_exporter() -> (
  MockMetricsExporter,
  mpsc::UnboundedReceiver<Vec<ExportedRecord>>,
) {
  let (tx, rx) = mpsc::unbounded_channel();
  let mut exporter = MockMetricsExporter::new();
  exporter.expect_export().returning(move |batch| {
    let _ignored = tx.send(batch);
  });
  exporter.expect_update_config().returning(|_| ());
  (exporter, rx)
}

//
// SharedBuilder
//

#[derive(Default)]
pub struct SharedBuilder {
  histograms: HistogramConfig,
  sampling: Vec<SamplingRule>,
  random: Option<Box<dyn UniformRandom>>,
  exporter: Option<MockMetricsExporter>,
}

impl SharedBuilder {
  pub fn default_buckets(mut self, boundaries: &[f64]) -> Self {
    self.histograms.default_buckets = boundaries.to_vec();
    self
  }

  pub fn sampling(mut self, rule: SamplingRule, random: Box<dyn UniformRandom>) -> Self {
    self.sampling.push(rule);
    self.random = Some(random);
    self
  }

  pub fn exporter(mut self, exporter: MockMetricsExporter) -> Self {
    self.exporter = Some(exporter);
    self
  }

  pub fn build(self, scope: &Scope) -> AggregatorShared {
    let sampler = self.random.map_or_else(Sampler::default, Sampler::new);
    sampler.update_rules(&self.sampling);
    AggregatorShared {
      buckets: Arc::new(ConfiguredBuckets::new(&self.histograms)),
      sampler: Arc::new(sampler),
      pools: Arc::new(Pools::new(16)),
      exporter: Arc::new(self.exporter.unwrap_or_default()),
      active: ActiveGauges::new(scope),
    }
  }
}
