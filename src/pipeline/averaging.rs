//! Per-distance averaging (spec §4.7.2), grounded on the averaging step of
//! `cct/core2/processing/calculations/*.py` that precedes background
//! subtraction and merging. `curve_averaged` is the average of each
//! exposure's own azimuthal integration; `curve_reintegrated` is a single
//! integration of the averaged image — both are kept, `curve` is a soft
//! alias for `curve_averaged` at the persistence layer (§6).

use crate::data::curve::Curve;
use crate::data::exposure::Exposure;
use crate::error::PipelineError;
use crate::pipeline::matrix_averager::ErrorPropagation;

pub struct AveragedDataset {
  pub exposure: Exposure,
  pub curve_averaged: Curve,
  pub curve_reintegrated: Curve,
}

/// Averages a set of exposures and their already-integrated per-exposure
/// curves belonging to one (sample, distance), then reintegrates the
/// averaged image onto the same q-grid used for the reintegration.
pub fn average_dataset(exposures: &[Exposure], curves: &[Curve], reintegration_q: &[f64], method: ErrorPropagation) -> Result<AveragedDataset, PipelineError> {
  let exposure = Exposure::average(exposures, method)?;
  let curve_averaged = Curve::average(curves, method)?;
  let curve_reintegrated = exposure.radial_average(reintegration_q);

  Ok(AveragedDataset {
    exposure,
    curve_averaged,
    curve_reintegrated,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::data::exposure::Matrix2D;
  use crate::data::header::{Header, SampleCategory};
  use chrono::NaiveDate;

  fn header() -> Header {
    Header {
      title: "water".into(),
      category: SampleCategory::Primary,
      distance: (1000.0, 1.0),
      wavelength: (0.15418, 0.0001),
      pixel_size: (0.172, 0.0),
      beam_row: (15.5, 0.0),
      beam_col: (15.5, 0.0),
      exposure_time: (300.0, 0.1),
      exposure_count: 1,
      absolute_intensity_factor: (1.0, 0.0),
      start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap(),
      end_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(0, 5, 0).unwrap(),
      fsn: 1,
    }
  }

  #[test]
  fn averaging_identical_inputs_reproduces_them() {
    let n = 32;
    let exposure = Exposure::new(Matrix2D::filled(n, n, 5.0), Matrix2D::filled(n, n, 0.1), Matrix2D::filled(n, n, 1.0), header());
    let q: Vec<f64> = (0..10).map(|i| 0.01 + i as f64 * 0.005).collect();
    let curve = Curve::from_vectors(q.clone(), vec![5.0; 10], vec![0.1; 10], vec![0.0; 10], vec![1.0; 10], vec![0.0; 10]);

    let result = average_dataset(&[exposure.clone(), exposure.clone()], &[curve.clone(), curve.clone()], &q, ErrorPropagation::Linear).unwrap();

    for v in result.exposure.intensity.as_slice() {
      assert!((v - 5.0).abs() < 1e-9);
    }
    for v in result.curve_averaged.intensity() {
      assert!((v - 5.0).abs() < 1e-9);
    }
  }
}
