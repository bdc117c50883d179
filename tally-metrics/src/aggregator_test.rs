// tally - in-process telemetry aggregation
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use crate::config::{SamplingMode, SamplingRule};
use crate::export::{ExportedPoint, ExportedValue};
use crate::observation::{AggregationKind, CustomMetric, CustomPoint, MetricGroup};
use crate::sampler::FixedRandom;
use crate::test::{SharedBuilder, make_channel_exporter, make_custom, make_rpc_server};
use bd_server_stats::stats::Collector;
use bd_server_stats::test::util::stats::Helper as StatsHelper;
use bd_shutdown::ComponentShutdownTrigger;
use pretty_assertions::assert_eq;
use prometheus::labels;

fn make_aggregator(shared: AggregatorShared, point_limit: u64, scope: &Scope) -> Arc<Aggregator> {
  Arc::new(Aggregator::new(
    "test",
    Duration::from_secs(10),
    4,
    point_limit,
    shared,
    scope,
  ))
}

fn counter_value(record: &ExportedRecord) -> f64 {
  match record.point("requests").unwrap().value {
    ExportedValue::Value(value) => value,
    ref other => panic!("unexpected value {other:?}"),
  }
}

#[tokio::test]
async fn end_to_end_server_rpc() {
  let scope = Collector::default().scope("test");
  let shared = SharedBuilder::default()
    .default_buckets(&[0.0, 0.025, 0.25])
    .build(&scope);
  let aggregator = make_aggregator(shared, 100, &scope);

  aggregator.aggregate(&make_rpc_server("frontend", 0.01));
  aggregator.aggregate(&make_rpc_server("frontend", 0.1));

  let batch = aggregator.swap_and_drain().await;
  assert_eq!(1, batch.len());
  let record = &batch[0];
  assert_eq!(MetricGroup::RpcServer, record.group);
  assert_eq!("rpc", record.monitor);
  assert_eq!(
    vec!["frontend", "Call", "backend", "Handle", "main", "0"],
    record.labels
  );

  assert_eq!(
    &ExportedPoint::new(
      "started_total",
      AggregationKind::Counter,
      ExportedValue::Value(2.0)
    ),
    record.point("started_total").unwrap()
  );
  assert_eq!(
    &ExportedPoint::new(
      "handled_total",
      AggregationKind::Counter,
      ExportedValue::Value(2.0)
    ),
    record.point("handled_total").unwrap()
  );
  match record.point("handled_seconds_sum").unwrap().value {
    ExportedValue::Value(sum) => assert!((sum - 0.11).abs() < 1e-9, "sum {sum}"),
    ref other => panic!("unexpected value {other:?}"),
  }
  assert_eq!(
    ExportedValue::Count(2),
    record.point("handled_seconds_count").unwrap().value
  );

  let buckets: Vec<_> = record
    .points
    .iter()
    .filter(|point| point.name == "handled_seconds_bucket")
    .map(|point| point.value.clone())
    .collect();
  assert_eq!(
    vec![
      ExportedValue::Bucket {
        range: "[0,0.025)".to_string(),
        count: 1
      },
      ExportedValue::Bucket {
        range: "[0.025,0.25)".to_string(),
        count: 1
      },
    ],
    buckets
  );

  // The next window starts empty.
  assert!(aggregator.swap_and_drain().await.is_empty());
}

#[tokio::test]
async fn point_limit() {
  let stats_helper = StatsHelper::default();
  let scope = stats_helper.collector().scope("test");
  let shared = SharedBuilder::default().build(&scope);
  let aggregator = make_aggregator(shared.clone(), 5, &scope);

  for i in 0 .. 10 {
    aggregator.aggregate(&make_custom("m", &format!("dim{i}"), 1.0));
  }
  // Existing dimensions still accept updates at the limit.
  aggregator.aggregate(&make_custom("m", "dim0", 1.0));

  assert_eq!(5, shared.active.dimensions.get());
  assert_eq!(5, shared.active.points.get());
  stats_helper.assert_counter_eq(5, "test:discarded", &labels! {});

  let mut batch = aggregator.swap_and_drain().await;
  batch.sort_by(|a, b| a.labels.cmp(&b.labels));
  assert_eq!(5, batch.len());
  assert_eq!(vec!["dim0"], batch[0].labels);
  assert_eq!(2.0, counter_value(&batch[0]));
  assert_eq!(0, shared.active.dimensions.get());
  assert_eq!(0, shared.active.points.get());

  // A raised limit applies to the next observation.
  aggregator.set_point_limit(20);
  for i in 0 .. 10 {
    aggregator.aggregate(&make_custom("m", &format!("dim{i}"), 1.0));
  }
  assert_eq!(10, aggregator.swap_and_drain().await.len());
  stats_helper.assert_counter_eq(5, "test:discarded", &labels! {});
}

#[tokio::test]
async fn schema_mismatch() {
  let stats_helper = StatsHelper::default();
  let scope = stats_helper.collector().scope("test");
  let aggregator = make_aggregator(SharedBuilder::default().build(&scope), 100, &scope);

  aggregator.aggregate(&make_custom("m", "a", 1.0));
  aggregator.aggregate(&CustomMetric::custom(
    "m",
    vec!["a".to_string()],
    vec![CustomPoint::new("requests", AggregationKind::Sum, 5.0)],
  ));
  stats_helper.assert_counter_eq(1, "test:schema_mismatch", &labels! {});

  let batch = aggregator.swap_and_drain().await;
  assert_eq!(1, batch.len());
  assert_eq!(1.0, counter_value(&batch[0]));
}

#[tokio::test]
async fn sampling() {
  let rule = |fraction| SamplingRule {
    monitor: "sampled".to_string(),
    mode: SamplingMode::Random,
    fraction,
  };

  let stats_helper = StatsHelper::default();
  let scope = stats_helper.collector().scope("test");
  let aggregator = make_aggregator(
    SharedBuilder::default()
      .sampling(rule(0.5), Box::new(FixedRandom(0.9)))
      .build(&scope),
    100,
    &scope,
  );
  aggregator.aggregate(&make_custom("sampled", "a", 3.0));
  aggregator.aggregate(&make_custom("sampled", "b", 3.0));
  aggregator.aggregate(&make_custom("other", "a", 3.0));
  let batch = aggregator.swap_and_drain().await;
  assert_eq!(1, batch.len());
  assert_eq!("other", batch[0].monitor);
  assert_eq!(3.0, counter_value(&batch[0]));
  stats_helper.assert_counter_eq(2, "test:sampled_out", &labels! {});

  // Kept dimensions are scaled back up by 1 / fraction.
  let scope = Collector::default().scope("test");
  let aggregator = make_aggregator(
    SharedBuilder::default()
      .sampling(rule(0.25), Box::new(FixedRandom(0.1)))
      .build(&scope),
    100,
    &scope,
  );
  aggregator.aggregate(&make_custom("sampled", "a", 3.0));
  let batch = aggregator.swap_and_drain().await;
  assert_eq!(12.0, counter_value(&batch[0]));
}

#[tokio::test]
async fn conversion_error() {
  struct ShortRpc;

  impl Observation for ShortRpc {
    fn group(&self) -> MetricGroup {
      MetricGroup::RpcServer
    }

    fn monitor(&self) -> &str {
      "short"
    }

    fn point_count(&self) -> usize {
      1
    }

    fn point_name(&self, _index: usize) -> &str {
      "started_total"
    }

    fn point_aggregation(&self, _index: usize) -> AggregationKind {
      AggregationKind::Counter
    }

    fn point_value(&self, _index: usize) -> f64 {
      1.0
    }

    fn label_count(&self) -> usize {
      0
    }

    fn label_value(&self, index: usize) -> &str {
      unreachable!("no label {index}")
    }
  }

  let stats_helper = StatsHelper::default();
  let scope = stats_helper.collector().scope("test");
  let aggregator = make_aggregator(SharedBuilder::default().build(&scope), 100, &scope);
  aggregator.aggregate(&ShortRpc);
  aggregator.aggregate(&make_rpc_server("frontend", 0.1));

  let batch = aggregator.swap_and_drain().await;
  assert_eq!(1, batch.len());
  assert_eq!("rpc", batch[0].monitor);
  stats_helper.assert_counter_eq(1, "test:conversion_error", &labels! {});
}

#[tokio::test]
async fn observation_during_flush() {
  let scope = Collector::default().scope("test");
  let aggregator = make_aggregator(SharedBuilder::default().build(&scope), 100, &scope);
  aggregator.aggregate(&make_custom("m", "before", 1.0));

  aggregator.thread_synchronizer().wait_on("do_flush").await;
  let flushing = aggregator.clone();
  let flush = tokio::spawn(async move { flushing.swap_and_drain().await });

  // The swap is done but the drain has not started. This belongs to the next window.
  aggregator.thread_synchronizer().barrier_on("do_flush").await;
  aggregator.aggregate(&make_custom("m", "during", 1.0));
  aggregator.thread_synchronizer().signal("do_flush").await;

  let batch = flush.await.unwrap();
  assert_eq!(1, batch.len());
  assert_eq!(vec!["before"], batch[0].labels);

  let batch = aggregator.swap_and_drain().await;
  assert_eq!(1, batch.len());
  assert_eq!(vec!["during"], batch[0].labels);
}

#[tokio::test]
async fn concurrent_ingestion() {
  let scope = Collector::default().scope("test");
  let aggregator = make_aggregator(SharedBuilder::default().build(&scope), 1000, &scope);

  let mut handles = Vec::new();
  for _ in 0 .. 4 {
    let aggregator = aggregator.clone();
    handles.push(std::thread::spawn(move || {
      for i in 0 .. 1000 {
        aggregator.aggregate(&make_custom("m", &format!("dim{}", i % 10), 1.0));
      }
    }));
  }

  // Flush while the writers are running. Every update must land in exactly one window.
  let mut total = 0.0;
  for _ in 0 .. 5 {
    total += aggregator
      .swap_and_drain()
      .await
      .iter()
      .map(counter_value)
      .sum::<f64>();
    tokio::task::yield_now().await;
  }
  for handle in handles {
    handle.join().unwrap();
  }
  total += aggregator
    .swap_and_drain()
    .await
    .iter()
    .map(counter_value)
    .sum::<f64>();
  assert_eq!(4000.0, total);
}

#[tokio::test(start_paused = true)]
async fn flush_loop() {
  let scope = Collector::default().scope("test");
  let (exporter, mut batches) = make_channel_exporter();
  let aggregator = make_aggregator(
    SharedBuilder::default().exporter(exporter).build(&scope),
    100,
    &scope,
  );
  let shutdown_trigger = ComponentShutdownTrigger::default();
  let shutdown = shutdown_trigger.make_shutdown();
  let flushing = aggregator.clone();
  tokio::spawn(async move { flushing.flush_loop(shutdown).await });

  aggregator.aggregate(&make_custom("m", "a", 1.0));
  tokio::time::sleep(Duration::from_millis(9_900)).await;
  assert!(batches.try_recv().is_err());

  tokio::time::sleep(Duration::from_millis(200)).await;
  let batch = batches.recv().await.unwrap();
  assert_eq!(1, batch.len());

  // Empty windows are still exported.
  tokio::time::sleep(Duration::from_secs(10)).await;
  assert!(batches.recv().await.unwrap().is_empty());

  // A new window applies after the next tick.
  aggregator.set_window(Duration::from_secs(2));
  tokio::time::sleep(Duration::from_secs(10)).await;
  assert!(batches.recv().await.unwrap().is_empty());
  tokio::time::sleep(Duration::from_secs(2)).await;
  assert!(batches.recv().await.unwrap().is_empty());
  assert!(batches.try_recv().is_err());

  // Shutdown flushes whatever is pending.
  aggregator.aggregate(&make_custom("m", "b", 1.0));
  shutdown_trigger.shutdown().await;
  let batch = batches.recv().await.unwrap();
  assert_eq!(vec!["b"], batch[0].labels);
}
