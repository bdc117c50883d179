// tally - in-process telemetry aggregation
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./lib_test.rs"]
mod lib_test;

use bd_log::SwapLogger;
use bd_panic::PanicType;

#[cfg(test)]
#[ctor::ctor]
fn test_global_init() {
  global_initialize();
}

// Process wide setup for anything embedding the engine. Safe to call once per process.
pub fn global_initialize() {
  // Must run before the logger is installed. A log emitted with thread ids during ctor will
  // otherwise panic.
  bd_panic::default(PanicType::ForceAbort);

  SwapLogger::initialize();
}

pub trait LossyIntoToFloat {
  fn lossy_to_f64(self) -> f64;
}

impl LossyIntoToFloat for u64 {
  #[allow(clippy::cast_precision_loss)]
  fn lossy_to_f64(self) -> f64 {
    self as f64
  }
}

impl LossyIntoToFloat for usize {
  #[allow(clippy::cast_precision_loss)]
  fn lossy_to_f64(self) -> f64 {
    self as f64
  }
}

pub trait LossyFloatToInt {
  fn lossy_to_u64(self) -> u64;
}

impl LossyFloatToInt for f64 {
  #[allow(
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation
  )]
  fn lossy_to_u64(self) -> u64 {
    self as u64
  }
}

// Round half up, i.e. floor(x + 0.5). Negative halves therefore round toward zero (-2.5 -> -2)
// and negative inputs saturate at zero when converted to a count.
#[must_use]
pub fn round_half_up(value: f64) -> u64 {
  (value + 0.5).floor().lossy_to_u64()
}
