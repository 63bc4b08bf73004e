//! `Curve`: an immutable scattering curve, grounded on
//! `cct/core2/dataclasses/curve.py::Curve`. Six column-major channels: q,
//! intensity, intensity-uncertainty, q-uncertainty, bin-area, pixel-radius.
//! Arithmetic between two curves requires their q-scales to coincide (spec
//! invariant 5 / testable property 3); the result's q is the midpoint of
//! the two inputs'.

use crate::error::PipelineError;
use crate::pipeline::matrix_averager::{ErrorPropagation, MatrixAverager};

pub const CHANNELS: usize = 6;

#[derive(Debug, Clone, PartialEq)]
pub struct Curve {
  q: Vec<f64>,
  intensity: Vec<f64>,
  intensity_unc: Vec<f64>,
  q_unc: Vec<f64>,
  bin_area: Vec<f64>,
  pixel_radius: Vec<f64>,
}

impl Curve {
  pub fn from_vectors(
    q: Vec<f64>,
    intensity: Vec<f64>,
    intensity_unc: Vec<f64>,
    q_unc: Vec<f64>,
    bin_area: Vec<f64>,
    pixel_radius: Vec<f64>,
  ) -> Self {
    let n = q.len();
    assert!(
      [&intensity, &intensity_unc, &q_unc, &bin_area, &pixel_radius].iter().all(|v| v.len() == n),
      "all curve channels must share the same length"
    );
    Curve {
      q,
      intensity,
      intensity_unc,
      q_unc,
      bin_area,
      pixel_radius,
    }
  }

  pub fn len(&self) -> usize {
    self.q.len()
  }

  pub fn is_empty(&self) -> bool {
    self.q.is_empty()
  }

  pub fn q(&self) -> &[f64] {
    &self.q
  }

  pub fn intensity(&self) -> &[f64] {
    &self.intensity
  }

  pub fn intensity_unc(&self) -> &[f64] {
    &self.intensity_unc
  }

  /// Column-major flattening: `[CHANNELS][len]`, matching the original's
  /// `np.vstack` layout used for HDF5 persistence.
  pub fn as_array(&self) -> Vec<Vec<f64>> {
    vec![
      self.q.clone(),
      self.intensity.clone(),
      self.intensity_unc.clone(),
      self.q_unc.clone(),
      self.bin_area.clone(),
      self.pixel_radius.clone(),
    ]
  }

  pub fn from_array(array: Vec<Vec<f64>>) -> Self {
    assert_eq!(array.len(), CHANNELS, "expected a 6-channel array");
    let mut it = array.into_iter();
    Curve::from_vectors(
      it.next().unwrap(),
      it.next().unwrap(),
      it.next().unwrap(),
      it.next().unwrap(),
      it.next().unwrap(),
      it.next().unwrap(),
    )
  }

  /// Points whose intensity is non-finite or whose validity is otherwise
  /// unusable are dropped (`Curve.sanitize()` in the original).
  pub fn sanitize(&self) -> Curve {
    let keep: Vec<usize> = (0..self.len()).filter(|&i| self.intensity[i].is_finite() && self.q[i].is_finite()).collect();
    self.select(&keep)
  }

  /// Keep only points with `qmin <= q <= qmax`.
  pub fn trim(&self, qmin: f64, qmax: f64) -> Curve {
    let keep: Vec<usize> = (0..self.len()).filter(|&i| self.q[i] >= qmin && self.q[i] <= qmax).collect();
    self.select(&keep)
  }

  fn select(&self, indices: &[usize]) -> Curve {
    Curve {
      q: indices.iter().map(|&i| self.q[i]).collect(),
      intensity: indices.iter().map(|&i| self.intensity[i]).collect(),
      intensity_unc: indices.iter().map(|&i| self.intensity_unc[i]).collect(),
      q_unc: indices.iter().map(|&i| self.q_unc[i]).collect(),
      bin_area: indices.iter().map(|&i| self.bin_area[i]).collect(),
      pixel_radius: indices.iter().map(|&i| self.pixel_radius[i]).collect(),
    }
  }

  /// Which points carry a finite, usable intensity (`curve.isvalid()` in
  /// the original, used to align two radially-averaged curves before
  /// fitting their scaling factor).
  pub fn isvalid(&self) -> Vec<bool> {
    self.intensity.iter().zip(self.intensity_unc.iter()).map(|(i, u)| i.is_finite() && u.is_finite()).collect()
  }

  pub fn select_mask(&self, keep: &[bool]) -> Curve {
    let indices: Vec<usize> = keep.iter().enumerate().filter(|(_, &k)| k).map(|(i, _)| i).collect();
    self.select(&indices)
  }

  /// Concatenate two curves point-for-point (used by multi-distance
  /// merging after trimming each side to its separator).
  pub fn concat(&self, other: &Curve) -> Curve {
    Curve {
      q: self.q.iter().chain(other.q.iter()).copied().collect(),
      intensity: self.intensity.iter().chain(other.intensity.iter()).copied().collect(),
      intensity_unc: self.intensity_unc.iter().chain(other.intensity_unc.iter()).copied().collect(),
      q_unc: self.q_unc.iter().chain(other.q_unc.iter()).copied().collect(),
      bin_area: self.bin_area.iter().chain(other.bin_area.iter()).copied().collect(),
      pixel_radius: self.pixel_radius.iter().chain(other.pixel_radius.iter()).copied().collect(),
    }
  }

  /// `curve * (factor, factor_uncertainty)`: scales intensity, propagating
  /// the factor's own uncertainty in quadrature (spec §4.7.4 step 4).
  pub fn scale(&self, factor: (f64, f64)) -> Curve {
    let (beta, sigma_beta) = factor;
    let intensity: Vec<f64> = self.intensity.iter().map(|i| i * beta).collect();
    let intensity_unc: Vec<f64> = self
      .intensity
      .iter()
      .zip(self.intensity_unc.iter())
      .map(|(&i, &unc)| ((beta * unc).powi(2) + (sigma_beta * i).powi(2)).sqrt())
      .collect();
    Curve {
      q: self.q.clone(),
      intensity,
      intensity_unc,
      q_unc: self.q_unc.clone(),
      bin_area: self.bin_area.clone(),
      pixel_radius: self.pixel_radius.clone(),
    }
  }

  fn check_q_compatible(a: &Curve, b: &Curve) -> Result<(), PipelineError> {
    if a.len() != b.len() {
      return Err(PipelineError::QMismatch("curves have different lengths".to_string()));
    }
    for (qa, qb) in a.q.iter().zip(b.q.iter()) {
      let mean = (qa + qb) / 2.0;
      if mean != 0.0 && (qa - qb).abs() / mean > 0.005 {
        return Err(PipelineError::QMismatch(format!("q-scales diverge: {qa} vs {qb}")));
      }
    }
    Ok(())
  }

  /// Elementwise binary combination whose q vector is the midpoint of the
  /// two inputs' (testable property 3).
  fn combine(a: &Curve, b: &Curve, f: impl Fn(f64, f64) -> f64) -> Result<Curve, PipelineError> {
    Curve::check_q_compatible(a, b)?;
    let q = a.q.iter().zip(b.q.iter()).map(|(&qa, &qb)| (qa + qb) / 2.0).collect();
    let q_unc = a.q_unc.iter().zip(b.q_unc.iter()).map(|(&ua, &ub)| (ua + ub) / 2.0).collect();
    let intensity = a.intensity.iter().zip(b.intensity.iter()).map(|(&ia, &ib)| f(ia, ib)).collect();
    let intensity_unc = a
      .intensity_unc
      .iter()
      .zip(b.intensity_unc.iter())
      .map(|(&ua, &ub)| (ua * ua + ub * ub).sqrt())
      .collect();
    let bin_area = a.bin_area.iter().zip(b.bin_area.iter()).map(|(&x, &y)| x + y).collect();
    let pixel_radius = a.pixel_radius.iter().zip(b.pixel_radius.iter()).map(|(&x, &y)| (x + y) / 2.0).collect();
    Ok(Curve {
      q,
      intensity,
      intensity_unc,
      q_unc,
      bin_area,
      pixel_radius,
    })
  }

  pub fn add(&self, other: &Curve) -> Result<Curve, PipelineError> {
    Curve::combine(self, other, |a, b| a + b)
  }

  pub fn sub(&self, other: &Curve) -> Result<Curve, PipelineError> {
    Curve::combine(self, other, |a, b| a - b)
  }

  /// Average a set of q-compatible curves through a `MatrixAverager`
  /// (spec §4.7.2). Intensities use `method`; q/bin-area/pixel-radius use
  /// plain linear propagation, since only the intensity channel carries a
  /// meaningful error-propagation choice.
  pub fn average(curves: &[Curve], method: ErrorPropagation) -> Result<Curve, PipelineError> {
    let first = curves.first().ok_or(PipelineError::EmptyInput)?;
    let len = first.len();
    for c in &curves[1..] {
      Curve::check_q_compatible(first, c)?;
    }

    let mut avg_intensity = MatrixAverager::new(method);
    let mut avg_q = MatrixAverager::new(ErrorPropagation::Linear);
    for c in curves {
      avg_intensity.add(&c.intensity, &c.intensity_unc);
      avg_q.add(&c.q, &c.q_unc);
    }
    let (intensity, intensity_unc) = avg_intensity.get();
    let (q, q_unc) = avg_q.get();

    let mut bin_area = vec![0.0; len];
    let mut pixel_radius = vec![0.0; len];
    for c in curves {
      for i in 0..len {
        bin_area[i] += c.bin_area[i];
        pixel_radius[i] += c.pixel_radius[i];
      }
    }
    let n = curves.len() as f64;
    for v in pixel_radius.iter_mut() {
      *v /= n;
    }

    Ok(Curve {
      q,
      intensity,
      intensity_unc,
      q_unc,
      bin_area,
      pixel_radius,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn simple(q: Vec<f64>, intensity: Vec<f64>) -> Curve {
    let n = q.len();
    Curve::from_vectors(q, intensity, vec![1.0; n], vec![0.0; n], vec![1.0; n], vec![1.0; n])
  }

  #[test]
  fn from_array_then_as_array_round_trips() {
    let curve = simple(vec![0.1, 0.2, 0.3], vec![10.0, 20.0, 30.0]);
    let restored = Curve::from_array(curve.as_array());
    assert_eq!(curve, restored);
  }

  #[test]
  fn addition_q_is_midpoint_of_inputs() {
    let a = simple(vec![0.10, 0.20], vec![1.0, 2.0]);
    let b = simple(vec![0.1002, 0.2002], vec![3.0, 4.0]);
    let sum = a.add(&b).unwrap();
    assert!((sum.q()[0] - 0.1001).abs() < 1e-9);
    assert_eq!(sum.intensity(), &[4.0, 6.0]);
  }

  #[test]
  fn incompatible_q_scales_are_rejected() {
    let a = simple(vec![0.1, 0.2], vec![1.0, 2.0]);
    let b = simple(vec![0.2, 0.4], vec![1.0, 2.0]);
    assert!(a.add(&b).is_err());
  }

  #[test]
  fn linear_average_of_repeated_curve_returns_same_intensity() {
    let c = simple(vec![0.1, 0.2, 0.3], vec![5.0, 6.0, 7.0]);
    let avg = Curve::average(&[c.clone(), c.clone(), c.clone()], ErrorPropagation::Linear).unwrap();
    for (a, b) in avg.intensity().iter().zip(c.intensity().iter()) {
      assert!((a - b).abs() < 1e-9);
    }
  }

  #[test]
  fn trim_keeps_only_points_within_bounds() {
    let c = simple(vec![0.1, 0.2, 0.3, 0.4], vec![1.0, 2.0, 3.0, 4.0]);
    let trimmed = c.trim(0.15, 0.35);
    assert_eq!(trimmed.q(), &[0.2, 0.3]);
  }
}
