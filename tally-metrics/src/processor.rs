// tally - in-process telemetry aggregation
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./processor_test.rs"]
mod processor_test;

use crate::aggregator::{ActiveGauges, Aggregator, AggregatorShared};
use crate::buckets::ConfiguredBuckets;
use crate::config::{EngineConfig, SecondGranularity};
use crate::export::DynamicMetricsExporter;
use crate::observation::{CustomMetric, MetricGroup, Observation, RpcClientMetric, RpcServerMetric};
use crate::pool::Pools;
use crate::sampler::Sampler;
use crate::time::TimeProvider;
use ahash::HashMap;
use bd_server_stats::stats::Scope;
use bd_shutdown::ComponentShutdownTrigger;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

//
// Processor
//

// Entry point of the engine. Owns the default aggregator plus one aggregator per fixed
// second granularity window and routes every observation to exactly one of them.
pub struct Processor {
  default_aggregator: Arc<Aggregator>,
  // Ascending by window.
  fixed_aggregators: Vec<Arc<Aggregator>>,
  overrides: RwLock<HashMap<String, SecondGranularity>>,
  buckets: Arc<ConfiguredBuckets>,
  sampler: Arc<Sampler>,
  exporter: DynamicMetricsExporter,
  time_provider: Box<dyn TimeProvider>,
}

impl Processor {
  pub fn new(
    config: EngineConfig,
    exporter: DynamicMetricsExporter,
    scope: &Scope,
    time_provider: Box<dyn TimeProvider>,
  ) -> anyhow::Result<Arc<Self>> {
    Self::new_with_sampler(
      config,
      exporter,
      scope,
      time_provider,
      Arc::new(Sampler::default()),
    )
  }

  pub fn new_with_sampler(
    config: EngineConfig,
    exporter: DynamicMetricsExporter,
    scope: &Scope,
    time_provider: Box<dyn TimeProvider>,
    sampler: Arc<Sampler>,
  ) -> anyhow::Result<Arc<Self>> {
    config.validate()?;

    let buckets = Arc::new(ConfiguredBuckets::new(&config.histograms));
    sampler.update_rules(&config.sampling);
    let shared = AggregatorShared {
      buckets: buckets.clone(),
      sampler: sampler.clone(),
      pools: Arc::new(Pools::new(config.pool_capacity)),
      exporter: exporter.clone(),
      active: ActiveGauges::new(scope),
    };

    let make_aggregator = |name: &str, window: Duration| {
      Arc::new(Aggregator::new(
        name,
        window,
        config.shard_count,
        config.point_limit,
        shared.clone(),
        &scope.scope(name),
      ))
    };

    let mut fixed_windows = config.fixed_windows.clone();
    fixed_windows.sort_unstable();
    fixed_windows.dedup();
    let fixed_aggregators = fixed_windows
      .into_iter()
      .map(|window| make_aggregator(&format!("window_{}ms", window.as_millis()), window))
      .collect();

    let processor = Arc::new(Self {
      default_aggregator: make_aggregator("default", config.window),
      fixed_aggregators,
      overrides: RwLock::new(make_overrides(&config.second_granularity)),
      buckets,
      sampler,
      exporter: exporter.clone(),
      time_provider,
    });
    exporter.update_config(Arc::new(config));
    Ok(processor)
  }

  // Spawn one flush task per aggregator. Each performs a final flush once the trigger fires.
  pub fn start(self: &Arc<Self>, shutdown_trigger: &ComponentShutdownTrigger) {
    for aggregator in self.aggregators() {
      log::info!(
        "starting aggregator '{}' with window {:?}",
        aggregator.name(),
        aggregator.window()
      );
      let aggregator = aggregator.clone();
      let shutdown = shutdown_trigger.make_shutdown();
      tokio::spawn(async move {
        aggregator.flush_loop(shutdown).await;
      });
    }
  }

  // Immediately flush every aggregator without waiting for its next tick.
  pub async fn flush_all(&self) {
    for aggregator in self.aggregators() {
      aggregator.flush().await;
    }
  }

  pub fn process_rpc_client(&self, metric: &RpcClientMetric) {
    self.process(metric);
  }

  pub fn process_rpc_server(&self, metric: &RpcServerMetric) {
    self.process(metric);
  }

  pub fn process_runtime(&self, metric: &CustomMetric) {
    debug_assert_eq!(MetricGroup::Runtime, metric.group());
    self.process(metric);
  }

  pub fn process_custom(&self, metric: &CustomMetric) {
    debug_assert_eq!(MetricGroup::Custom, metric.group());
    self.process(metric);
  }

  fn process<O: Observation + ?Sized>(&self, observation: &O) {
    self.route(observation.monitor()).aggregate(observation);
  }

  fn aggregators(&self) -> impl Iterator<Item = &Arc<Aggregator>> {
    std::iter::once(&self.default_aggregator).chain(self.fixed_aggregators.iter())
  }

  pub(crate) fn route(&self, monitor: &str) -> &Aggregator {
    let requested = {
      let overrides = self.overrides.read();
      overrides
        .get(monitor)
        .filter(|o| o.is_active(self.time_provider.unix_now()))
        .map(|o| o.window)
    };
    let Some(requested) = requested else {
      return &self.default_aggregator;
    };
    if self.fixed_aggregators.is_empty() {
      return &self.default_aggregator;
    }

    // Largest fixed window at or below the requested one, clamped to the smallest.
    let index = self
      .fixed_aggregators
      .partition_point(|aggregator| aggregator.window() <= requested);
    &self.fixed_aggregators[index.saturating_sub(1)]
  }

  // Apply a new configuration. It takes effect at the next tick or observation. Shard count, pool
  // capacity and the set of fixed windows are fixed at construction.
  pub fn update_config(&self, config: EngineConfig) -> anyhow::Result<()> {
    config.validate()?;
    log::info!("applying engine config update");

    self.default_aggregator.set_window(config.window);
    for aggregator in self.aggregators() {
      aggregator.set_point_limit(config.point_limit);
    }
    self.buckets.update(&config.histograms);
    self.sampler.update_rules(&config.sampling);
    *self.overrides.write() = make_overrides(&config.second_granularity);

    self.exporter.update_config(Arc::new(config));
    Ok(())
  }
}

fn make_overrides(second_granularity: &[SecondGranularity]) -> HashMap<String, SecondGranularity> {
  second_granularity
    .iter()
    .map(|o| (o.monitor.clone(), o.clone()))
    .collect()
}
