//! Linear-through-origin orthogonal distance regression, grounded on the
//! `scipy.odr` calls in `cct/core2/processing/calculations/mergingjob.py`
//! and `backgroundprocess.py`'s interval-mode background fit. No example or
//! teacher crate vendors a general ODR solver, so this implements the
//! effective-variance fixed-point iteration for the one model those callers
//! actually need: `y = beta * x` through the origin, with uncertainty on
//! both axes.

/// Mirrors `scipy.odr`'s `info` field: `<=4` is a recognized convergence
/// stop reason, `>4` signals the fit did not converge.
pub struct OdrResult {
  pub beta: f64,
  pub sd_beta: f64,
  pub info: i32,
}

const MAX_ITERATIONS: u32 = 200;
const TOLERANCE: f64 = 1e-12;

/// Fits `y = beta * x` by effective-variance weighted least squares,
/// re-weighting each point by `sigma_y^2 + beta^2 * sigma_x^2` and
/// iterating to a fixed point. Ordinary least squares through the origin
/// (ignoring `sigma_x`) seeds the first iteration.
pub fn fit_linear_through_origin(x: &[f64], y: &[f64], sigma_x: &[f64], sigma_y: &[f64]) -> OdrResult {
  assert!(!x.is_empty(), "cannot fit an empty point set");
  assert_eq!(x.len(), y.len());
  assert_eq!(x.len(), sigma_x.len());
  assert_eq!(x.len(), sigma_y.len());

  let mut beta = {
    let num: f64 = x.iter().zip(y.iter()).map(|(&xi, &yi)| xi * yi).sum();
    let den: f64 = x.iter().map(|&xi| xi * xi).sum();
    if den == 0.0 {
      return OdrResult { beta: 0.0, sd_beta: 0.0, info: 5 };
    }
    num / den
  };

  let mut sum_xx_over_w = 0.0;
  for iteration in 0..MAX_ITERATIONS {
    let mut num = 0.0;
    let mut den = 0.0;
    for i in 0..x.len() {
      let w = sigma_y[i].powi(2) + beta.powi(2) * sigma_x[i].powi(2);
      let w = if w > 0.0 { w } else { 1.0 };
      num += x[i] * y[i] / w;
      den += x[i] * x[i] / w;
    }
    if den == 0.0 {
      return OdrResult { beta: 0.0, sd_beta: 0.0, info: 5 };
    }
    let next_beta = num / den;
    sum_xx_over_w = den;
    if (next_beta - beta).abs() <= TOLERANCE * next_beta.abs().max(1.0) {
      beta = next_beta;
      return OdrResult {
        beta,
        sd_beta: 1.0 / sum_xx_over_w.sqrt(),
        info: 1,
      };
    }
    beta = next_beta;
    if iteration == MAX_ITERATIONS - 1 {
      return OdrResult { beta, sd_beta: 1.0 / sum_xx_over_w.sqrt(), info: 5 };
    }
  }
  OdrResult { beta, sd_beta: 1.0 / sum_xx_over_w.sqrt(), info: 5 }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fits_exact_proportional_data() {
    let x = vec![1.0, 2.0, 3.0, 4.0];
    let y = vec![2.0, 4.0, 6.0, 8.0];
    let sigma_x = vec![0.01, 0.01, 0.01, 0.01];
    let sigma_y = vec![0.1, 0.1, 0.1, 0.1];
    let result = fit_linear_through_origin(&x, &y, &sigma_x, &sigma_y);
    assert!((result.beta - 2.0).abs() < 1e-6);
    assert!(result.info <= 4);
  }

  #[test]
  fn degenerate_all_zero_x_does_not_converge() {
    let x = vec![0.0, 0.0, 0.0];
    let y = vec![1.0, 2.0, 3.0];
    let sigma_x = vec![0.1, 0.1, 0.1];
    let sigma_y = vec![0.1, 0.1, 0.1];
    let result = fit_linear_through_origin(&x, &y, &sigma_x, &sigma_y);
    assert!(result.info > 4);
  }
}
