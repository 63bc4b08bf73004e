//! Streaming value+uncertainty averager (spec §4.7.5), grounded on
//! `cct/core2/algorithms/matrixaverager.py::MatrixAverager`. Accumulates one
//! column/pixel/matrix at a time so the caller never needs to hold every
//! input in memory at once.

/// Selects how `MatrixAverager` combines a value and its uncertainty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPropagation {
  Weighted,
  Linear,
  Gaussian,
  Conservative,
  StandardErrorOfMean,
}

/// `fixBadValues`: replace non-finite or non-positive uncertainties with the
/// smallest positive element of the same slice; if none exists, treat every
/// uncertainty as 1.
fn fix_bad_values(uncertainty: &[f64]) -> Vec<f64> {
  let smallest_positive = uncertainty.iter().copied().filter(|v| v.is_finite() && *v > 0.0).fold(f64::INFINITY, f64::min);
  if !smallest_positive.is_finite() {
    return vec![1.0; uncertainty.len()];
  }
  uncertainty
    .iter()
    .map(|&v| if v.is_finite() && v > 0.0 { v } else { smallest_positive })
    .collect()
}

pub struct MatrixAverager {
  method: ErrorPropagation,
  len: Option<usize>,
  value: Vec<f64>,
  value2: Vec<f64>,
  error: Vec<f64>,
  count: u32,
}

impl MatrixAverager {
  pub fn new(method: ErrorPropagation) -> Self {
    MatrixAverager {
      method,
      len: None,
      value: Vec::new(),
      value2: Vec::new(),
      error: Vec::new(),
      count: 0,
    }
  }

  pub fn add(&mut self, value: &[f64], uncertainty: &[f64]) {
    assert_eq!(value.len(), uncertainty.len(), "value/uncertainty length mismatch");
    let error = fix_bad_values(uncertainty);
    let len = value.len();
    if self.count == 0 {
      self.len = Some(len);
      match self.method {
        ErrorPropagation::Weighted => {
          self.value = (0..len).map(|i| value[i] / error[i].powi(2)).collect();
          self.error = error.iter().map(|e| 1.0 / e.powi(2)).collect();
        }
        ErrorPropagation::Linear => {
          self.value = value.to_vec();
          self.error = error;
        }
        ErrorPropagation::Gaussian | ErrorPropagation::Conservative => {
          self.value = value.to_vec();
          self.error = error.iter().map(|e| e * e).collect();
          if matches!(self.method, ErrorPropagation::Conservative) {
            self.value2 = value.iter().map(|v| v * v).collect();
          }
        }
        ErrorPropagation::StandardErrorOfMean => {
          self.value = value.to_vec();
          self.value2 = value.iter().map(|v| v * v).collect();
        }
      }
    } else {
      assert_eq!(self.len, Some(len), "matrix shape changed mid-average");
      match self.method {
        ErrorPropagation::Weighted => {
          for i in 0..len {
            self.value[i] += value[i] / error[i].powi(2);
            self.error[i] += 1.0 / error[i].powi(2);
          }
        }
        ErrorPropagation::Linear => {
          for i in 0..len {
            self.value[i] += value[i];
            self.error[i] += error[i];
          }
        }
        ErrorPropagation::Gaussian => {
          for i in 0..len {
            self.value[i] += value[i];
            self.error[i] += error[i] * error[i];
          }
        }
        ErrorPropagation::Conservative => {
          for i in 0..len {
            self.value[i] += value[i];
            self.error[i] += error[i] * error[i];
            self.value2[i] += value[i] * value[i];
          }
        }
        ErrorPropagation::StandardErrorOfMean => {
          for i in 0..len {
            self.value[i] += value[i];
            self.value2[i] += value[i] * value[i];
          }
        }
      }
    }
    self.count += 1;
  }

  /// Returns `(value, uncertainty)`. Panics if `add` was never called —
  /// mirrors the original's `ValueError` on an empty averager, which is a
  /// caller bug in both implementations.
  pub fn get(&self) -> (Vec<f64>, Vec<f64>) {
    let n = self.count as f64;
    assert!(self.count > 0, "cannot get average: no data given yet");
    let len = self.len.unwrap();
    match self.method {
      ErrorPropagation::Weighted => {
        let value = (0..len).map(|i| self.value[i] / self.error[i]).collect();
        let error = self.error.iter().map(|e| 1.0 / e.sqrt()).collect();
        (value, error)
      }
      ErrorPropagation::Linear => {
        let value = self.value.iter().map(|v| v / n).collect();
        let error = self.error.iter().map(|e| e / (n * n)).collect();
        (value, error)
      }
      ErrorPropagation::Gaussian => {
        let value = self.value.iter().map(|v| v / n).collect();
        let error = self.error.iter().map(|e| e.sqrt() / n).collect();
        (value, error)
      }
      ErrorPropagation::Conservative => {
        let value: Vec<f64> = self.value.iter().map(|v| v / n).collect();
        let error = (0..len)
          .map(|i| {
            let error_propagated = self.error[i].sqrt() / n;
            let error_sem = if self.count > 1 {
              ((self.value2[i] - self.value[i] * self.value[i] / n) / (n - 1.0)).sqrt() / n.sqrt()
            } else {
              0.0
            };
            error_sem.max(error_propagated)
          })
          .collect();
        (value, error)
      }
      ErrorPropagation::StandardErrorOfMean => {
        let value: Vec<f64> = self.value.iter().map(|v| v / n).collect();
        let error = if self.count > 1 {
          (0..len)
            .map(|i| (1.0 / (n - 1.0) / n * (self.value2[i] - self.value[i] * self.value[i] / n)).sqrt())
            .collect()
        } else {
          vec![0.0; len]
        };
        (value, error)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn linear_average_is_additive_over_the_same_sample_set() {
    let xs = [vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]];
    let sx = [vec![0.1, 0.1], vec![0.2, 0.2], vec![0.3, 0.3]];
    let ys = [vec![10.0, 20.0], vec![30.0, 40.0], vec![50.0, 60.0]];
    let sy = [vec![1.0, 1.0], vec![2.0, 2.0], vec![3.0, 3.0]];

    let mut avg_x = MatrixAverager::new(ErrorPropagation::Linear);
    let mut avg_y = MatrixAverager::new(ErrorPropagation::Linear);
    let mut avg_sum = MatrixAverager::new(ErrorPropagation::Linear);
    for i in 0..3 {
      avg_x.add(&xs[i], &sx[i]);
      avg_y.add(&ys[i], &sy[i]);
      let summed: Vec<f64> = xs[i].iter().zip(ys[i].iter()).map(|(a, b)| a + b).collect();
      let summed_err: Vec<f64> = sx[i].iter().zip(sy[i].iter()).map(|(a, b)| a + b).collect();
      avg_sum.add(&summed, &summed_err);
    }

    let (vx, ex) = avg_x.get();
    let (vy, ey) = avg_y.get();
    let (vsum, esum) = avg_sum.get();
    for i in 0..2 {
      assert!((vx[i] + vy[i] - vsum[i]).abs() < 1e-9);
      assert!((ex[i] + ey[i] - esum[i]).abs() < 1e-9);
    }
  }

  #[test]
  fn weighted_average_of_repeated_value_returns_that_value() {
    let mut avg = MatrixAverager::new(ErrorPropagation::Weighted);
    avg.add(&[5.0], &[0.5]);
    avg.add(&[5.0], &[0.5]);
    avg.add(&[5.0], &[0.5]);
    let (value, error) = avg.get();
    assert!((value[0] - 5.0).abs() < 1e-9);
    assert!(error[0] > 0.0);
  }

  #[test]
  fn bad_uncertainties_are_replaced_by_smallest_positive_element() {
    let fixed = fix_bad_values(&[1.0, f64::NAN, -1.0, 0.5]);
    assert_eq!(fixed, vec![1.0, 0.5, 0.5, 0.5]);
  }

  #[test]
  fn all_bad_uncertainties_fall_back_to_one() {
    let fixed = fix_bad_values(&[f64::NAN, -1.0, 0.0]);
    assert_eq!(fixed, vec![1.0, 1.0, 1.0]);
  }
}
