//! Outlier detection by pairwise curve correlation (spec §4.7.1), grounded
//! on `cct/core2/processing/calculations/outliertest.py::OutlierTest`. The
//! correlation matrix follows the spec's literal definition (the original's
//! `correlmatrix_cython` is a compiled extension not carried into
//! `original_source/`): the mean squared distance between two curves'
//! intensities, scaled by their combined uncertainties. Each curve's score is
//! its mean distance to every other curve in the set — the matrix's diagonal
//! in the sense of "this row summarized", not the literal zero-valued
//! self-comparison `C[i][i]`.

use crate::data::curve::Curve;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutlierMethod {
  ZScore,
  ModifiedZScore,
  Iqr,
}

pub struct OutlierTest {
  pub correlation_matrix: Vec<Vec<f64>>,
  pub score: Vec<f64>,
  pub method: OutlierMethod,
  pub threshold: f64,
  pub outlier: Vec<bool>,
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
  if sorted.len() == 1 {
    return sorted[0];
  }
  let rank = p / 100.0 * (sorted.len() - 1) as f64;
  let lo = rank.floor() as usize;
  let hi = rank.ceil() as usize;
  if lo == hi {
    sorted[lo]
  } else {
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
  }
}

fn mean(xs: &[f64]) -> f64 {
  xs.iter().sum::<f64>() / xs.len() as f64
}

fn std(xs: &[f64]) -> f64 {
  let m = mean(xs);
  (xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / xs.len() as f64).sqrt()
}

fn median(xs: &[f64]) -> f64 {
  let mut sorted = xs.to_vec();
  sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
  percentile(&sorted, 50.0)
}

impl OutlierTest {
  /// `curves` and `fsns` must be the same length and in corresponding
  /// order; curves are not required to be q-compatible here since the
  /// correlation metric only compares intensities point-for-point by
  /// index, as the original does over a resampled common grid upstream.
  pub fn new(curves: &[Curve], method: OutlierMethod, threshold: f64) -> Self {
    let n = curves.len();
    let mut correlation_matrix = vec![vec![0.0; n]; n];
    for i in 0..n {
      for j in 0..n {
        correlation_matrix[i][j] = Self::pairwise_distance(&curves[i], &curves[j]);
      }
    }
    // The per-curve score is the diagonal of the correlation matrix in the
    // sense of "this curve's disagreement with the rest of the set", not the
    // literal `C[i][i]` self-comparison — that element is always zero, since
    // `pairwise_distance(curve, curve)` has `diff = 0` at every point, which
    // would make every curve indistinguishable from every other. Score curve
    // i by its mean distance to the other n-1 curves instead.
    let score: Vec<f64> = (0..n)
      .map(|i| {
        if n <= 1 {
          return 0.0;
        }
        let sum: f64 = (0..n).filter(|&j| j != i).map(|j| correlation_matrix[i][j]).sum();
        sum / (n - 1) as f64
      })
      .collect();

    let mut test = OutlierTest {
      correlation_matrix,
      score,
      method,
      threshold,
      outlier: vec![false; n],
    };
    test.mark_outliers();
    test
  }

  fn pairwise_distance(a: &Curve, b: &Curve) -> f64 {
    let n = a.intensity().len().min(b.intensity().len());
    if n == 0 {
      return 0.0;
    }
    let mut sum = 0.0;
    for k in 0..n {
      let diff = a.intensity()[k] - b.intensity()[k];
      let combined_variance = a.intensity_unc()[k].powi(2) + b.intensity_unc()[k].powi(2);
      let combined_variance = if combined_variance > 0.0 { combined_variance } else { 1.0 };
      sum += diff * diff / combined_variance;
    }
    sum / n as f64
  }

  pub fn acceptance_interval(&self) -> (f64, f64) {
    match self.method {
      OutlierMethod::ZScore | OutlierMethod::ModifiedZScore => (-self.threshold, self.threshold),
      OutlierMethod::Iqr => {
        let mut sorted = self.score.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let q1 = percentile(&sorted, 25.0);
        let q3 = percentile(&sorted, 75.0);
        let iqr = q3 - q1;
        (q1 - iqr * self.threshold, q3 + iqr * self.threshold)
      }
    }
  }

  fn mark_outliers(&mut self) {
    self.outlier = match self.method {
      OutlierMethod::ZScore => {
        let m = mean(&self.score);
        let s = std(&self.score);
        self.score.iter().map(|v| (v - m).abs() / s > self.threshold).collect()
      }
      OutlierMethod::ModifiedZScore => {
        let med = median(&self.score);
        let deviations: Vec<f64> = self.score.iter().map(|v| (v - med).abs()).collect();
        let mad = median(&deviations);
        self.score.iter().map(|v| (0.6745 * (v - med) / mad).abs() > self.threshold).collect()
      }
      OutlierMethod::Iqr => {
        let (lo, hi) = self.acceptance_interval();
        self.score.iter().map(|v| *v < lo || *v > hi).collect()
      }
    };
  }

  pub fn outlier_indices(&self) -> Vec<usize> {
    self.outlier.iter().enumerate().filter(|(_, &bad)| bad).map(|(i, _)| i).collect()
  }
}

/// Union a previously known bad-fsn set with freshly detected outliers
/// (spec §4.7.1: already-bad fsns skip scoring and remain bad).
pub fn detect_bad_fsns(fsns: &[u32], curves: &[Curve], already_bad: &[u32], method: OutlierMethod, threshold: f64) -> Vec<u32> {
  let scoreable: Vec<usize> = (0..fsns.len()).filter(|&i| !already_bad.contains(&fsns[i])).collect();
  let scoreable_curves: Vec<Curve> = scoreable.iter().map(|&i| curves[i].clone()).collect();

  let mut bad: Vec<u32> = already_bad.to_vec();
  if !scoreable_curves.is_empty() {
    let test = OutlierTest::new(&scoreable_curves, method, threshold);
    for idx in test.outlier_indices() {
      let fsn = fsns[scoreable[idx]];
      if !bad.contains(&fsn) {
        bad.push(fsn);
      }
    }
  }
  bad.sort_unstable();
  bad
}

#[cfg(test)]
mod tests {
  use super::*;

  fn curve_with_score(score: f64) -> Curve {
    Curve::from_vectors(vec![0.1, 0.2], vec![score, score], vec![1.0, 1.0], vec![0.0, 0.0], vec![1.0, 1.0], vec![0.0, 0.0])
  }

  #[test]
  fn iqr_detects_single_outlier_matching_scenario_s4() {
    let mut curves: Vec<Curve> = (0..9).map(|_| curve_with_score(1.0)).collect();
    curves.push(curve_with_score(100.0));
    let test = OutlierTest::new(&curves, OutlierMethod::Iqr, 1.5);
    assert_eq!(test.outlier_indices(), vec![9]);
  }

  #[test]
  fn already_bad_fsns_remain_bad_without_rescoring() {
    let curves: Vec<Curve> = (0..3).map(|_| curve_with_score(1.0)).collect();
    let fsns = vec![10, 11, 12];
    let bad = detect_bad_fsns(&fsns, &curves, &[11], OutlierMethod::Iqr, 1.5);
    assert!(bad.contains(&11));
  }
}
