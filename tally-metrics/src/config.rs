// tally - in-process telemetry aggregation
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

use anyhow::bail;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::time::Duration;

const fn default_window() -> Duration {
  Duration::from_secs(15)
}

const fn default_shard_count() -> usize {
  16
}

const fn default_point_limit() -> u64 {
  100_000
}

const fn default_pool_capacity() -> usize {
  4096
}

fn default_fixed_windows() -> Vec<Duration> {
  vec![
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(10),
  ]
}

fn deserialize_windows<'de, D: Deserializer<'de>>(
  deserializer: D,
) -> Result<Vec<Duration>, D::Error> {
  let windows: Vec<humantime_serde::Serde<Duration>> = Vec::deserialize(deserializer)?;
  Ok(
    windows
      .into_iter()
      .map(humantime_serde::Serde::into_inner)
      .collect(),
  )
}

//
// SamplingMode
//

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingMode {
  // Re-decided independently for every dimension in every window.
  #[default]
  Random,
  // Deterministic on the dimension fingerprint, so a given line stays in or out across windows.
  Rows,
}

//
// SamplingRule
//

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct SamplingRule {
  pub monitor: String,
  #[serde(default)]
  pub mode: SamplingMode,
  pub fraction: f64,
}

//
// SecondGranularity
//

// Requests a shorter aggregation window for one monitor during [start_unix, end_unix).
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct SecondGranularity {
  pub monitor: String,
  #[serde(with = "humantime_serde")]
  pub window: Duration,
  pub start_unix: i64,
  pub end_unix: i64,
}

impl SecondGranularity {
  #[must_use]
  pub const fn is_active(&self, unix_now: i64) -> bool {
    self.start_unix <= unix_now && unix_now < self.end_unix
  }
}

//
// HistogramConfig
//

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct HistogramConfig {
  // Used for any histogram without a named entry. Empty means bucket counts are not tracked.
  #[serde(default)]
  pub default_buckets: Vec<f64>,
  #[serde(default)]
  pub buckets: HashMap<String, Vec<f64>>,
}

//
// EngineConfig
//

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
  #[serde(default = "default_window", with = "humantime_serde")]
  pub window: Duration,
  #[serde(default = "default_shard_count")]
  pub shard_count: usize,
  // Upper bound on active points in one window of one aggregator. New dimensions beyond it are
  // discarded.
  #[serde(default = "default_point_limit")]
  pub point_limit: u64,
  #[serde(default = "default_pool_capacity")]
  pub pool_capacity: usize,
  #[serde(
    default = "default_fixed_windows",
    deserialize_with = "deserialize_windows"
  )]
  pub fixed_windows: Vec<Duration>,
  #[serde(default)]
  pub histograms: HistogramConfig,
  #[serde(default)]
  pub sampling: Vec<SamplingRule>,
  #[serde(default)]
  pub second_granularity: Vec<SecondGranularity>,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      window: default_window(),
      shard_count: default_shard_count(),
      point_limit: default_point_limit(),
      pool_capacity: default_pool_capacity(),
      fixed_windows: default_fixed_windows(),
      histograms: HistogramConfig::default(),
      sampling: Vec::new(),
      second_granularity: Vec::new(),
    }
  }
}

impl EngineConfig {
  pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
    let config: Self = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> anyhow::Result<()> {
    if self.window.is_zero() {
      bail!("window must be > 0");
    }
    if self.shard_count == 0 {
      bail!("shard_count must be > 0");
    }
    if self.fixed_windows.iter().any(Duration::is_zero) {
      bail!("fixed_windows must all be > 0");
    }

    validate_boundaries("default_buckets", &self.histograms.default_buckets)?;
    for (name, boundaries) in &self.histograms.buckets {
      validate_boundaries(name, boundaries)?;
    }

    for rule in &self.sampling {
      if !(0.0 ..= 1.0).contains(&rule.fraction) {
        bail!(
          "sampling fraction for monitor '{}' must be between 0.0 and 1.0",
          rule.monitor
        );
      }
    }

    for second_granularity in &self.second_granularity {
      if second_granularity.window.is_zero() {
        bail!(
          "second granularity window for monitor '{}' must be > 0",
          second_granularity.monitor
        );
      }
      if second_granularity.end_unix <= second_granularity.start_unix {
        bail!(
          "second granularity range for monitor '{}' is empty",
          second_granularity.monitor
        );
      }
    }

    Ok(())
  }
}

fn validate_boundaries(name: &str, boundaries: &[f64]) -> anyhow::Result<()> {
  if boundaries.iter().any(|b| !b.is_finite()) {
    bail!("bucket boundaries for '{name}' must be finite");
  }
  Ok(())
}
