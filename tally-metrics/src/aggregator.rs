// tally - in-process telemetry aggregation
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./aggregator_test.rs"]
mod aggregator_test;

use crate::buckets::BucketProvider;
use crate::export::{DynamicMetricsExporter, ExportedRecord};
use crate::key::AggregationKey;
use crate::observation::Observation;
use crate::pool::Pools;
use crate::sampler::Sampler;
use crate::shard::Buffer;
#[cfg(test)]
use crate::test::thread_synchronizer::ThreadSynchronizer;
use bd_log::warn_every;
use bd_server_stats::stats::Scope;
use bd_shutdown::ComponentShutdown;
use parking_lot::RwLock;
use prometheus::{Histogram, IntCounter, IntGauge};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use time::ext::NumericalDuration;
use tokio::time::{Interval, MissedTickBehavior};

const SLOW_FLUSH: Duration = Duration::from_secs(1);

//
// Stats
//

struct Stats {
  discarded: IntCounter,
  schema_mismatch: IntCounter,
  sampled_out: IntCounter,
  conversion_error: IntCounter,
  swap_slow: IntCounter,
  flush_time: Histogram,
}

impl Stats {
  fn new(scope: &Scope) -> Self {
    Self {
      discarded: scope.counter("discarded"),
      schema_mismatch: scope.counter("schema_mismatch"),
      sampled_out: scope.counter("sampled_out"),
      conversion_error: scope.counter("conversion_error"),
      swap_slow: scope.counter("swap_slow"),
      flush_time: scope.histogram("flush_time"),
    }
  }
}

//
// ActiveGauges
//

// Engine wide totals across every aggregator's writer buffer.
#[derive(Clone)]
pub struct ActiveGauges {
  dimensions: IntGauge,
  points: IntGauge,
}

impl ActiveGauges {
  #[must_use]
  pub fn new(scope: &Scope) -> Self {
    Self {
      dimensions: scope.gauge("active_dimensions"),
      points: scope.gauge("active_points"),
    }
  }

  fn add(&self, dimensions: u64, points: u64) {
    self.dimensions.add(dimensions.try_into().unwrap_or(i64::MAX));
    self.points.add(points.try_into().unwrap_or(i64::MAX));
  }

  fn sub(&self, dimensions: u64, points: u64) {
    self.dimensions.sub(dimensions.try_into().unwrap_or(i64::MAX));
    self.points.sub(points.try_into().unwrap_or(i64::MAX));
  }
}

//
// AggregatorShared
//

// Collaborators shared by every aggregator of one processor.
#[derive(Clone)]
pub struct AggregatorShared {
  pub buckets: Arc<dyn BucketProvider>,
  pub sampler: Arc<Sampler>,
  pub pools: Arc<Pools>,
  pub exporter: DynamicMetricsExporter,
  pub active: ActiveGauges,
}

//
// Aggregator
//

// Double buffered store for one aggregation window. Ingestion holds the writer lock shared for its
// whole duration, the swap takes it exclusively, so every accepted update belongs to exactly one
// flush. The reader buffer is only touched by the flush, which the reader mutex serializes.
pub struct Aggregator {
  name: String,
  window_ms: AtomicU64,
  point_limit: AtomicU64,
  writer: RwLock<Buffer>,
  reader: tokio::sync::Mutex<Buffer>,
  shared: AggregatorShared,
  stats: Stats,

  #[cfg(test)]
  thread_synchronizer: ThreadSynchronizer,
}

impl Aggregator {
  #[must_use]
  pub fn new(
    name: &str,
    window: Duration,
    shard_count: usize,
    point_limit: u64,
    shared: AggregatorShared,
    scope: &Scope,
  ) -> Self {
    log::debug!(
      "creating aggregator '{name}' with window {window:?}, {shard_count} shard(s) and point \
       limit {point_limit}"
    );
    Self {
      name: name.to_string(),
      window_ms: AtomicU64::new(duration_to_millis(window)),
      point_limit: AtomicU64::new(point_limit),
      writer: RwLock::new(Buffer::new(shard_count)),
      reader: tokio::sync::Mutex::new(Buffer::new(shard_count)),
      shared,
      stats: Stats::new(scope),

      #[cfg(test)]
      thread_synchronizer: ThreadSynchronizer::default(),
    }
  }

  #[must_use]
  pub fn name(&self) -> &str {
    &self.name
  }

  #[must_use]
  pub fn window(&self) -> Duration {
    Duration::from_millis(self.window_ms.load(Ordering::Relaxed))
  }

  // Picked up by the flush loop at its next tick.
  pub fn set_window(&self, window: Duration) {
    self
      .window_ms
      .store(duration_to_millis(window), Ordering::Relaxed);
  }

  pub fn set_point_limit(&self, point_limit: u64) {
    self.point_limit.store(point_limit, Ordering::Relaxed);
  }

  #[cfg(test)]
  pub(crate) const fn thread_synchronizer(&self) -> &ThreadSynchronizer {
    &self.thread_synchronizer
  }

  pub fn aggregate<O: Observation + ?Sized>(&self, observation: &O) {
    let key = AggregationKey::from_observation(observation);
    let buckets = self.shared.buckets.as_ref();

    let writer = self.writer.read();
    let multi_value = {
      let mut entries = writer.shard(&key).lock();
      if let Some(multi_value) = entries.get(&key) {
        multi_value.clone()
      } else {
        let point_limit = self.point_limit.load(Ordering::Relaxed);
        if writer.active_points() >= point_limit {
          self.stats.discarded.inc();
          warn_every!(
            15.seconds(),
            "aggregator '{}' reached point limit {}, discarding new dimension of monitor '{}'",
            self.name,
            point_limit,
            observation.monitor()
          );
          return;
        }

        let multi_value = self.shared.pools.acquire(key, observation, buckets);
        entries.insert(key, multi_value.clone());
        writer.add_dimension(key.point_count());
        self.shared.active.add(1, key.point_count() as u64);
        multi_value
      }
    };

    if let Err(e) = multi_value.lock().update(observation, buckets) {
      self.stats.schema_mismatch.inc();
      warn_every!(
        15.seconds(),
        "dropping update for monitor '{}': {}",
        observation.monitor(),
        e
      );
    }
  }

  // Swap the buffers and drain the previous writer into exported records.
  pub async fn swap_and_drain(&self) -> Vec<ExportedRecord> {
    let _flush_time = self.stats.flush_time.start_timer();
    let start = Instant::now();

    let mut reader = self.reader.lock().await;
    std::mem::swap(&mut *self.writer.write(), &mut *reader);

    #[cfg(test)]
    self.thread_synchronizer.sync_point("do_flush").await;

    let batch = self.drain(&mut reader);
    drop(reader);

    let elapsed = start.elapsed();
    if elapsed > SLOW_FLUSH {
      self.stats.swap_slow.inc();
      log::info!("aggregator '{}' flush took {elapsed:?}", self.name);
    }
    batch
  }

  // A full flush cycle: swap, drain, hand the batch to the exporter.
  pub async fn flush(&self) {
    let batch = self.swap_and_drain().await;
    log::debug!(
      "aggregator '{}' exporting {} record(s)",
      self.name,
      batch.len()
    );
    self.shared.exporter.export(batch).await;
  }

  fn drain(&self, reader: &mut Buffer) -> Vec<ExportedRecord> {
    let buckets = self.shared.buckets.as_ref();
    let sampler = self.shared.sampler.as_ref();
    let pools = self.shared.pools.as_ref();

    let mut batch = Vec::with_capacity(reader.active_dimensions().try_into().unwrap_or(0));
    for shard in reader.shards_mut() {
      for (key, multi_value) in shard.drain() {
        {
          let mut locked = multi_value.lock();
          let (factor, keep) = sampler.sample(locked.monitor(), key.labels_hash());
          if keep {
            if (factor - 1.0).abs() > f64::EPSILON {
              locked.rescale(factor);
            }
            match locked.to_record(buckets) {
              Ok(Some(record)) => batch.push(record),
              Ok(None) => {},
              Err(e) => {
                self.stats.conversion_error.inc();
                warn_every!(
                  15.seconds(),
                  "dropping dimension of monitor '{}' from this window: {}",
                  locked.monitor(),
                  e
                );
              },
            }
          } else {
            self.stats.sampled_out.inc();
          }
        }
        pools.release(multi_value);
      }
    }

    let (dimensions, points) = reader.reset_totals();
    self.shared.active.sub(dimensions, points);
    log::debug!(
      "aggregator '{}' drained {dimensions} dimension(s) into {} record(s)",
      self.name,
      batch.len()
    );
    batch
  }

  // Ticks every window until shutdown, then performs a final flush. The window is re-read on every
  // tick and the ticker restarted when it changed.
  pub async fn flush_loop(&self, mut shutdown: ComponentShutdown) {
    let mut window = self.window();
    let mut interval = make_interval(window);
    loop {
      tokio::select! {
        _ = interval.tick() => {
          self.flush().await;

          let current = self.window();
          if current != window {
            log::info!(
              "aggregator '{}' window changed from {window:?} to {current:?}",
              self.name
            );
            window = current;
            interval = make_interval(window);
          }
        }
        () = shutdown.cancelled() => {
          log::debug!("shutting down aggregator '{}'", self.name);
          break;
        }
      }
    }

    log::debug!("performing shutdown flush for aggregator '{}'", self.name);
    self.flush().await;
    drop(shutdown);
  }
}

fn make_interval(window: Duration) -> Interval {
  let window = window.max(Duration::from_millis(1));
  let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + window, window);
  interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
  interval
}

fn duration_to_millis(duration: Duration) -> u64 {
  duration.as_millis().try_into().unwrap_or(u64::MAX)
}

