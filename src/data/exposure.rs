//! `Exposure`: a 2-D detector readout plus its header, grounded on
//! `cct/core2/dataclasses/exposure.py`. Intensity, uncertainty and mask
//! share one shape (spec invariant 4); arithmetic preserves that shape and
//! never lets a masked-out pixel poison a finite neighbour.

use crate::data::curve::Curve;
use crate::data::header::Header;
use crate::error::PipelineError;
use crate::pipeline::matrix_averager::{ErrorPropagation, MatrixAverager};

/// A row-major 2-D matrix of `f64`, used for intensity/uncertainty/mask
/// planes alike (the mask stores `0.0`/`1.0`).
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix2D {
  rows: usize,
  cols: usize,
  data: Vec<f64>,
}

impl Matrix2D {
  pub fn new(rows: usize, cols: usize, data: Vec<f64>) -> Self {
    assert_eq!(rows * cols, data.len(), "matrix data length must equal rows*cols");
    Matrix2D { rows, cols, data }
  }

  pub fn filled(rows: usize, cols: usize, value: f64) -> Self {
    Matrix2D {
      rows,
      cols,
      data: vec![value; rows * cols],
    }
  }

  pub fn rows(&self) -> usize {
    self.rows
  }

  pub fn cols(&self) -> usize {
    self.cols
  }

  pub fn shape(&self) -> (usize, usize) {
    (self.rows, self.cols)
  }

  pub fn as_slice(&self) -> &[f64] {
    &self.data
  }

  pub fn get(&self, row: usize, col: usize) -> f64 {
    self.data[row * self.cols + col]
  }

  pub fn zip_with(&self, other: &Matrix2D, f: impl Fn(f64, f64) -> f64) -> Matrix2D {
    assert_eq!(self.shape(), other.shape(), "matrix shapes must match");
    Matrix2D {
      rows: self.rows,
      cols: self.cols,
      data: self.data.iter().zip(other.data.iter()).map(|(&a, &b)| f(a, b)).collect(),
    }
  }

  pub fn map(&self, f: impl Fn(f64) -> f64) -> Matrix2D {
    Matrix2D {
      rows: self.rows,
      cols: self.cols,
      data: self.data.iter().map(|&a| f(a)).collect(),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Exposure {
  pub intensity: Matrix2D,
  pub uncertainty: Matrix2D,
  /// 1.0 = valid, 0.0 = masked.
  pub mask: Matrix2D,
  pub header: Header,
}

impl Exposure {
  pub fn new(intensity: Matrix2D, uncertainty: Matrix2D, mask: Matrix2D, header: Header) -> Self {
    assert_eq!(intensity.shape(), uncertainty.shape(), "intensity/uncertainty shape mismatch");
    assert_eq!(intensity.shape(), mask.shape(), "intensity/mask shape mismatch");
    Exposure {
      intensity,
      uncertainty,
      mask,
      header,
    }
  }

  /// `Exposure_sample - factor * Exposure_bg` (spec §4.7.3), or a bare
  /// `(value, uncertainty)` constant subtraction when `bg` is `None`.
  /// Uncertainties add in quadrature; the mask is the AND of both inputs
  /// (or just the sample's mask, for the constant-only case).
  pub fn subtract(&self, bg: Option<&Exposure>, factor: (f64, f64)) -> Result<Exposure, PipelineError> {
    let (f, sigma_f) = factor;
    let (bg_intensity, bg_uncertainty, mask) = match bg {
      Some(bg) => {
        if bg.intensity.shape() != self.intensity.shape() {
          return Err(PipelineError::QMismatch("background exposure shape does not match sample".to_string()));
        }
        (bg.intensity.clone(), bg.uncertainty.clone(), self.mask.zip_with(&bg.mask, |a, b| if a > 0.0 && b > 0.0 { 1.0 } else { 0.0 }))
      }
      None => (Matrix2D::filled(self.intensity.rows(), self.intensity.cols(), 1.0), Matrix2D::filled(self.intensity.rows(), self.intensity.cols(), 0.0), self.mask.clone()),
    };

    let intensity = self.intensity.zip_with(&bg_intensity, |sample, bg| sample - f * bg);
    let uncertainty = {
      let term_sample = self.uncertainty.map(|s| s * s);
      let term_bg = bg_intensity.zip_with(&bg_uncertainty, |bg, sbg| (f * sbg).powi(2) + (sigma_f * bg).powi(2));
      term_sample.zip_with(&term_bg, |a, b| (a + b).sqrt())
    };

    let mut header = self.header.clone();
    header.category = crate::data::header::SampleCategory::Subtracted;

    Ok(Exposure::new(intensity, uncertainty, mask, header))
  }

  /// Per-pixel average over a set of exposures sharing one (sample,
  /// distance); mask is the AND of every input mask (spec §4.7.2).
  pub fn average(exposures: &[Exposure], method: ErrorPropagation) -> Result<Exposure, PipelineError> {
    let first = exposures.first().ok_or(PipelineError::EmptyInput)?;
    let shape = first.intensity.shape();
    for e in &exposures[1..] {
      if e.intensity.shape() != shape {
        return Err(PipelineError::QMismatch("exposure shapes differ within the same average set".to_string()));
      }
    }

    let mut averager = MatrixAverager::new(method);
    for e in exposures {
      averager.add(e.intensity.as_slice(), e.uncertainty.as_slice());
    }
    let (value, error) = averager.get();

    let mut mask_data = vec![1.0; shape.0 * shape.1];
    for e in exposures {
      for (dst, &src) in mask_data.iter_mut().zip(e.mask.as_slice()) {
        if src <= 0.0 {
          *dst = 0.0;
        }
      }
    }

    let (start_date, end_date, exposure_count) = Header::merge_non_numeric(&exposures.iter().map(|e| e.header.clone()).collect::<Vec<_>>());
    let mut header = first.header.clone();
    header.start_date = start_date;
    header.end_date = end_date;
    header.exposure_count = exposure_count;

    Ok(Exposure::new(Matrix2D::new(shape.0, shape.1, value), Matrix2D::new(shape.0, shape.1, error), Matrix2D::new(shape.0, shape.1, mask_data), header))
  }

  /// Azimuthal integration onto an explicit set of q bin centers, grounded
  /// on the radial-averaging step `mergingjob.py` calls before fitting the
  /// inter-distance scaling factor. Pixels map to `q` via the standard
  /// small-angle relation `q = 4*pi/lambda * sin(half the scattering
  /// angle)`; each pixel is assigned to its nearest bin center.
  pub fn radial_average(&self, q_bins: &[f64]) -> Curve {
    let (rows, cols) = self.intensity.shape();
    let (distance, _) = self.header.distance;
    let (wavelength, _) = self.header.wavelength;
    let (pixel_size, _) = self.header.pixel_size;
    let (beam_row, _) = self.header.beam_row;
    let (beam_col, _) = self.header.beam_col;

    let mut averagers: Vec<MatrixAverager> = (0..q_bins.len()).map(|_| MatrixAverager::new(ErrorPropagation::Weighted)).collect();
    let mut counts = vec![0u32; q_bins.len()];

    for row in 0..rows {
      for col in 0..cols {
        if self.mask.get(row, col) <= 0.0 {
          continue;
        }
        let dr = row as f64 - beam_row;
        let dc = col as f64 - beam_col;
        let r_mm = pixel_size * (dr * dr + dc * dc).sqrt();
        let theta = (r_mm / distance).atan();
        let q = 4.0 * std::f64::consts::PI / wavelength * (theta / 2.0).sin();

        let (bin, _) = q_bins
          .iter()
          .enumerate()
          .min_by(|(_, a), (_, b)| (*a - q).abs().partial_cmp(&(*b - q).abs()).unwrap())
          .expect("q_bins must be non-empty");

        let intensity = self.intensity.get(row, col);
        let uncertainty = self.uncertainty.get(row, col);
        if intensity.is_finite() && uncertainty.is_finite() {
          averagers[bin].add(&[intensity], &[uncertainty]);
          counts[bin] += 1;
        }
      }
    }

    let n = q_bins.len();
    let mut intensity = vec![f64::NAN; n];
    let mut intensity_unc = vec![f64::NAN; n];
    for (i, count) in counts.iter().enumerate() {
      if *count > 0 {
        let (v, e) = averagers[i].get();
        intensity[i] = v[0];
        intensity_unc[i] = e[0];
      }
    }

    Curve::from_vectors(q_bins.to_vec(), intensity, intensity_unc, vec![0.0; n], vec![1.0; n], vec![0.0; n])
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::data::header::SampleCategory;
  use chrono::NaiveDate;

  fn header() -> Header {
    Header {
      title: "water".into(),
      category: SampleCategory::Primary,
      distance: (1000.0, 1.0),
      wavelength: (0.15418, 0.0001),
      pixel_size: (172.0, 0.0),
      beam_row: (512.0, 1.0),
      beam_col: (512.0, 1.0),
      exposure_time: (300.0, 0.1),
      exposure_count: 1,
      absolute_intensity_factor: (1.0, 0.0),
      start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap(),
      end_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(0, 5, 0).unwrap(),
      fsn: 1,
    }
  }

  #[test]
  fn constant_subtraction_matches_scenario_s5() {
    let intensity = Matrix2D::new(2, 2, vec![10.0, 10.0, 10.0, 10.0]);
    let uncertainty = Matrix2D::new(2, 2, vec![1.0, 1.0, 1.0, 1.0]);
    let mask = Matrix2D::filled(2, 2, 1.0);
    let exposure = Exposure::new(intensity, uncertainty, mask, header());

    let result = exposure.subtract(None, (3.0, 0.5)).unwrap();
    for v in result.intensity.as_slice() {
      assert!((v - 7.0).abs() < 1e-9);
    }
    for v in result.uncertainty.as_slice() {
      assert!((v - 1.25_f64.sqrt()).abs() < 1e-9);
    }
    assert_eq!(result.header.category, SampleCategory::Subtracted);
  }

  #[test]
  fn subtraction_rejects_mismatched_background_shape() {
    let exposure = Exposure::new(
      Matrix2D::filled(2, 2, 1.0),
      Matrix2D::filled(2, 2, 1.0),
      Matrix2D::filled(2, 2, 1.0),
      header(),
    );
    let bg = Exposure::new(
      Matrix2D::filled(3, 3, 1.0),
      Matrix2D::filled(3, 3, 1.0),
      Matrix2D::filled(3, 3, 1.0),
      header(),
    );
    assert!(exposure.subtract(Some(&bg), (1.0, 0.0)).is_err());
  }

  #[test]
  fn averaging_the_same_exposure_three_times_preserves_intensity() {
    let intensity = Matrix2D::new(2, 2, vec![1.0, 2.0, 3.0, 4.0]);
    let uncertainty = Matrix2D::new(2, 2, vec![0.1, 0.1, 0.1, 0.1]);
    let mask = Matrix2D::filled(2, 2, 1.0);
    let exposure = Exposure::new(intensity, uncertainty, mask, header());

    let averaged = Exposure::average(&[exposure.clone(), exposure.clone(), exposure.clone()], ErrorPropagation::Linear).unwrap();
    for (a, b) in averaged.intensity.as_slice().iter().zip(exposure.intensity.as_slice().iter()) {
      assert!((a - b).abs() < 1e-9);
    }
  }

  #[test]
  fn radial_average_bins_pixels_by_distance_from_beam_center() {
    let intensity = Matrix2D::filled(4, 4, 10.0);
    let uncertainty = Matrix2D::filled(4, 4, 1.0);
    let mask = Matrix2D::filled(4, 4, 1.0);
    let mut h = header();
    h.beam_row = (1.5, 0.0);
    h.beam_col = (1.5, 0.0);
    h.distance = (1000.0, 0.0);
    h.pixel_size = (0.172, 0.0);
    let exposure = Exposure::new(intensity, uncertainty, mask, h);

    let curve = exposure.radial_average(&[0.0, 0.001, 0.002]);
    assert_eq!(curve.len(), 3);
    assert!(curve.intensity().iter().any(|v| (v - 10.0).abs() < 1e-9));
  }
}
