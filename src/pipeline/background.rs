//! Background subtraction (spec §4.7.3), grounded on
//! `cct/core2/processing/calculations/backgroundprocess.py`. Three scaling
//! policies determine the `(factor, factor_uncertainty)` pair handed to
//! [`crate::data::exposure::Exposure::subtract`]; when no background is
//! named, `Interval`/`PowerLaw` instead fit a constant to the sample curve
//! alone over the same q-window.

use crate::data::curve::Curve;
use crate::error::PipelineError;
use crate::pipeline::odr::fit_linear_through_origin;

#[derive(Debug, Clone, Copy)]
pub enum ScalingMode {
  Unscaled,
  Constant { factor: (f64, f64) },
  Interval { qmin: f64, qmax: f64 },
  PowerLaw { qmin: f64, qmax: f64 },
}

fn window_indices(curve: &Curve, qmin: f64, qmax: f64) -> Vec<usize> {
  (0..curve.len()).filter(|&i| curve.q()[i] >= qmin && curve.q()[i] <= qmax).collect()
}

/// Ordinary least squares fit of `log(I) = log(A) + alpha * log(q)` over
/// points with positive q and I; returns the residual variance of the fit,
/// used as the objective `PowerLaw` mode minimizes over `factor`.
fn power_law_residual_variance(q: &[f64], intensity: &[f64]) -> f64 {
  let points: Vec<(f64, f64)> = q
    .iter()
    .zip(intensity.iter())
    .filter(|(&qi, &ii)| qi > 0.0 && ii > 0.0 && qi.is_finite() && ii.is_finite())
    .map(|(&qi, &ii)| (qi.ln(), ii.ln()))
    .collect();
  if points.len() < 2 {
    return f64::INFINITY;
  }
  let n = points.len() as f64;
  let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
  let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;
  let sxx: f64 = points.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
  let sxy: f64 = points.iter().map(|(x, y)| (x - mean_x) * (y - mean_y)).sum();
  if sxx == 0.0 {
    return f64::INFINITY;
  }
  let alpha = sxy / sxx;
  let log_a = mean_y - alpha * mean_x;
  points.iter().map(|(x, y)| (y - (log_a + alpha * x)).powi(2)).sum::<f64>() / n
}

/// Ternary search for the `factor` minimizing `power_law_residual_variance`
/// of `I_sample - factor * I_bg` (or of `I_sample` alone, when `bg` is
/// `None`, in which case `factor` multiplies a constant unit background so
/// the search degenerates into fitting a constant offset).
fn minimize_power_law_residual(q: &[f64], sample: &[f64], bg: &[f64]) -> (f64, f64) {
  let objective = |factor: f64| -> f64 {
    let residual: Vec<f64> = sample.iter().zip(bg.iter()).map(|(&s, &b)| s - factor * b).collect();
    power_law_residual_variance(q, &residual)
  };

  let mut lo = -10.0_f64;
  let mut hi = 10.0_f64;
  for _ in 0..200 {
    let m1 = lo + (hi - lo) / 3.0;
    let m2 = hi - (hi - lo) / 3.0;
    if objective(m1) < objective(m2) {
      hi = m2;
    } else {
      lo = m1;
    }
  }
  let factor = (lo + hi) / 2.0;

  // Approximate the inverse-Hessian uncertainty via a central finite
  // difference of the objective's curvature at the minimum.
  let h = 1e-3_f64.max(factor.abs() * 1e-3);
  let f0 = objective(factor);
  let f_plus = objective(factor + h);
  let f_minus = objective(factor - h);
  let hessian = (f_plus - 2.0 * f0 + f_minus) / (h * h);
  let sigma = if hessian > 0.0 { (2.0 / hessian).sqrt() } else { 0.0 };
  (factor, sigma)
}

/// Determines `(factor, factor_uncertainty)` for [`Exposure::subtract`].
/// `bg` is `None` when no background dataset is named; per spec, `Interval`
/// and `PowerLaw` then fit a constant to the sample curve alone.
pub fn determine_factor(sample: &Curve, bg: Option<&Curve>, mode: ScalingMode) -> Result<(f64, f64), PipelineError> {
  match mode {
    ScalingMode::Unscaled => Ok((1.0, 0.0)),
    ScalingMode::Constant { factor } => Ok(factor),
    ScalingMode::Interval { qmin, qmax } => {
      let idx = window_indices(sample, qmin, qmax);
      if idx.len() < 2 {
        return Err(PipelineError::InsufficientPoints);
      }
      match bg {
        Some(bg) => {
          let x: Vec<f64> = idx.iter().map(|&i| bg.intensity()[i]).collect();
          let y: Vec<f64> = idx.iter().map(|&i| sample.intensity()[i]).collect();
          let sx: Vec<f64> = idx.iter().map(|&i| bg.intensity_unc()[i]).collect();
          let sy: Vec<f64> = idx.iter().map(|&i| sample.intensity_unc()[i]).collect();
          let result = fit_linear_through_origin(&x, &y, &sx, &sy);
          if result.info > 4 {
            return Err(PipelineError::OdrDiverged(result.info));
          }
          Ok((result.beta, result.sd_beta))
        }
        None => {
          // Weighted-mean constant fit to the sample curve alone.
          let mut num = 0.0;
          let mut den = 0.0;
          for &i in &idx {
            let w = 1.0 / sample.intensity_unc()[i].powi(2).max(1e-300);
            num += sample.intensity()[i] * w;
            den += w;
          }
          Ok((num / den, (1.0 / den).sqrt()))
        }
      }
    }
    ScalingMode::PowerLaw { qmin, qmax } => {
      let idx = window_indices(sample, qmin, qmax);
      if idx.len() < 2 {
        return Err(PipelineError::InsufficientPoints);
      }
      let q: Vec<f64> = idx.iter().map(|&i| sample.q()[i]).collect();
      let sample_vals: Vec<f64> = idx.iter().map(|&i| sample.intensity()[i]).collect();
      let bg_vals: Vec<f64> = match bg {
        Some(bg) => idx.iter().map(|&i| bg.intensity()[i]).collect(),
        None => vec![1.0; idx.len()],
      };
      Ok(minimize_power_law_residual(&q, &sample_vals, &bg_vals))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unscaled_mode_is_a_pure_subtraction() {
    assert_eq!(determine_factor(&dummy_curve(), None, ScalingMode::Unscaled).unwrap(), (1.0, 0.0));
  }

  #[test]
  fn constant_mode_passes_caller_factor_through() {
    let factor = determine_factor(&dummy_curve(), None, ScalingMode::Constant { factor: (3.0, 0.5) }).unwrap();
    assert_eq!(factor, (3.0, 0.5));
  }

  #[test]
  fn interval_mode_recovers_known_proportionality() {
    let q = vec![0.1, 0.2, 0.3, 0.4, 0.5];
    let bg_intensity = vec![10.0, 20.0, 30.0, 40.0, 50.0];
    let sample_intensity: Vec<f64> = bg_intensity.iter().map(|b| b * 2.0).collect();
    let unc = vec![0.1; 5];
    let sample = Curve::from_vectors(q.clone(), sample_intensity, unc.clone(), vec![0.0; 5], vec![1.0; 5], vec![0.0; 5]);
    let bg = Curve::from_vectors(q, bg_intensity, unc, vec![0.0; 5], vec![1.0; 5], vec![0.0; 5]);

    let (factor, _) = determine_factor(&sample, Some(&bg), ScalingMode::Interval { qmin: 0.0, qmax: 1.0 }).unwrap();
    assert!((factor - 2.0).abs() < 1e-4);
  }

  fn dummy_curve() -> Curve {
    Curve::from_vectors(vec![0.1, 0.2], vec![1.0, 2.0], vec![0.1, 0.1], vec![0.0, 0.0], vec![1.0, 1.0], vec![0.0, 0.0])
  }
}
