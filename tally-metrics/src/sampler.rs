// tally - in-process telemetry aggregation
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./sampler_test.rs"]
mod sampler_test;

use crate::config::{SamplingMode, SamplingRule};
use ahash::HashMap;
use parking_lot::RwLock;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use tally_common::LossyFloatToInt;

//
// UniformRandom
//

pub trait UniformRandom: Send + Sync {
  // Uniform in [0, 1).
  fn next_f64(&self) -> f64;
}

//
// ThreadLocalRandom
//

#[derive(Default)]
pub struct ThreadLocalRandom {}

impl UniformRandom for ThreadLocalRandom {
  fn next_f64(&self) -> f64 {
    thread_local! {
      static RANDOM: RefCell<SmallRng> = RefCell::new(SmallRng::from_os_rng());
    }

    RANDOM.with(|random| random.borrow_mut().random::<f64>())
  }
}

//
// FixedRandom
//

// Always returns the same draw.
pub struct FixedRandom(pub f64);

impl UniformRandom for FixedRandom {
  fn next_f64(&self) -> f64 {
    self.0
  }
}

//
// Sampler
//

// Decides per monitor and dimension fingerprint whether a dimension is exported, and by which
// factor a kept dimension is scaled to estimate the unsampled total.
pub struct Sampler {
  rules: RwLock<HashMap<String, SamplingRule>>,
  random: Box<dyn UniformRandom>,
}

impl Default for Sampler {
  fn default() -> Self {
    Self::new(Box::<ThreadLocalRandom>::default())
  }
}

impl Sampler {
  #[must_use]
  pub fn new(random: Box<dyn UniformRandom>) -> Self {
    Self {
      rules: RwLock::default(),
      random,
    }
  }

  // Replace all rules. A later rule for the same monitor wins.
  pub fn update_rules(&self, rules: &[SamplingRule]) {
    let rules: HashMap<_, _> = rules
      .iter()
      .map(|rule| (rule.monitor.clone(), rule.clone()))
      .collect();
    log::debug!("installing {} sampling rule(s)", rules.len());
    *self.rules.write() = rules;
  }

  // Returns (factor, keep).
  pub fn sample(&self, monitor: &str, fingerprint: u64) -> (f64, bool) {
    let (mode, fraction) = {
      let rules = self.rules.read();
      let Some(rule) = rules.get(monitor) else {
        return (1.0, true);
      };
      (rule.mode, rule.fraction)
    };
    if fraction <= 0.0 || fraction >= 1.0 {
      return (1.0, true);
    }

    let keep = match mode {
      SamplingMode::Random => self.random.next_f64() < fraction,
      SamplingMode::Rows => {
        // Compare the top 63 bits so the bound below always fits.
        let upper_bound = (fraction * 2f64.powi(63)).lossy_to_u64();
        (fingerprint >> 1) < upper_bound
      },
    };
    (1.0 / fraction, keep)
  }
}
