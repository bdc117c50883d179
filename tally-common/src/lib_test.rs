// tally - in-process telemetry aggregation
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use pretty_assertions::assert_eq;

#[test]
fn round_half_up_counts() {
  assert_eq!(0, round_half_up(0.0));
  assert_eq!(0, round_half_up(0.49));
  assert_eq!(1, round_half_up(0.5));
  assert_eq!(3, round_half_up(2.5));
  assert_eq!(7, round_half_up(6.6));
  // Negative values clamp to an empty count.
  assert_eq!(0, round_half_up(-2.5));
}

#[test]
fn lossy_conversions() {
  assert_eq!(5.0, 5_u64.lossy_to_f64());
  assert_eq!(5.0, 5_usize.lossy_to_f64());
  assert_eq!(5, 5.9_f64.lossy_to_u64());
}
