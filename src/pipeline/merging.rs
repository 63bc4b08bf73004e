//! Multi-distance curve merging (spec §4.7.4), grounded on
//! `cct/core2/processing/calculations/mergingjob.py::MergingJob.main`.

use crate::data::curve::Curve;
use crate::data::exposure::Exposure;
use crate::data::header::{Header, SampleCategory};
use crate::error::PipelineError;
use crate::pipeline::odr::fit_linear_through_origin;

pub struct MergeInput {
  pub exposure: Exposure,
  pub curve_averaged: Curve,
  pub curve_reintegrated: Curve,
  pub qmin: f64,
  pub qmax: f64,
}

fn linspace(lo: f64, hi: f64, n: usize) -> Vec<f64> {
  if n == 1 {
    return vec![lo];
  }
  let step = (hi - lo) / (n - 1) as f64;
  (0..n).map(|i| lo + step * i as f64).collect()
}

pub struct MergeResult {
  pub curve_averaged: Curve,
  pub curve_reintegrated: Curve,
  pub header: Header,
}

/// Merges distances in increasing order, exactly as `MergingJob` does:
/// adjacent pairs are scale-matched over their common q-window by a
/// linear-through-origin ODR fit, then each distance is trimmed at the
/// separator q and concatenated.
pub fn merge(mut inputs: Vec<MergeInput>) -> Result<MergeResult, PipelineError> {
  if inputs.is_empty() {
    return Err(PipelineError::EmptyInput);
  }
  inputs.sort_by(|a, b| a.exposure.header.distance.0.partial_cmp(&b.exposure.header.distance.0).unwrap());

  let mut factors: Vec<(f64, f64)> = Vec::new();
  let mut separators: Vec<f64> = Vec::new();

  for i in 0..inputs.len() - 1 {
    let (qmin_i, qmax_i) = (inputs[i].qmin, inputs[i].qmax);
    let (qmin_j, qmax_j) = (inputs[i + 1].qmin, inputs[i + 1].qmax);
    let common = (qmin_i.max(qmin_j), qmax_i.min(qmax_j));
    if common.0 >= common.1 {
      return Err(PipelineError::EmptyCommonQ);
    }
    let q = linspace(common.0, common.1, 10);

    let radshort = inputs[i].exposure.radial_average(&q);
    let radlong = inputs[i + 1].exposure.radial_average(&q);
    let valid: Vec<bool> = radshort.isvalid().iter().zip(radlong.isvalid().iter()).map(|(&a, &b)| a && b).collect();
    let radshort = radshort.select_mask(&valid);
    let radlong = radlong.select_mask(&valid);
    if radshort.len() < 2 || radlong.len() < 2 {
      return Err(PipelineError::InsufficientPoints);
    }

    let result = fit_linear_through_origin(radlong.intensity(), radshort.intensity(), radlong.intensity_unc(), radshort.intensity_unc());
    if result.info > 4 {
      return Err(PipelineError::OdrDiverged(result.info));
    }
    let factor = (result.beta, result.sd_beta);

    let separator = {
      let mut best_idx = 0;
      let mut best_residual = f64::INFINITY;
      for k in 0..radlong.len() {
        let residual = (radlong.intensity()[k] * factor.0 - radshort.intensity()[k]).abs();
        if residual < best_residual {
          best_residual = residual;
          best_idx = k;
        }
      }
      radlong.q()[best_idx]
    };

    factors.push(factor);
    separators.push(separator);
  }

  let mut curves_avg: Vec<Curve> = inputs.iter().map(|i| i.curve_averaged.clone()).collect();
  let mut curves_reint: Vec<Curve> = inputs.iter().map(|i| i.curve_reintegrated.clone()).collect();
  for icurve in 1..inputs.len() {
    for ifactor in 0..icurve {
      curves_avg[icurve] = curves_avg[icurve].scale(factors[ifactor]);
      curves_reint[icurve] = curves_reint[icurve].scale(factors[ifactor]);
    }
  }

  let mut merged_avg = curves_avg[0].clone();
  let mut merged_reint = curves_reint[0].clone();
  for icurve in 1..inputs.len() {
    let separator = separators[icurve - 1];
    merged_avg = merged_avg.sanitize().trim(separator, f64::INFINITY);
    merged_reint = merged_reint.sanitize().trim(separator, f64::INFINITY);
    let c_avg = curves_avg[icurve].sanitize().trim(f64::NEG_INFINITY, separator);
    let c_reint = curves_reint[icurve].sanitize().trim(f64::NEG_INFINITY, separator);
    merged_avg = c_avg.concat(&merged_avg);
    merged_reint = c_reint.concat(&merged_reint);
  }

  let headers: Vec<Header> = inputs.iter().map(|i| i.exposure.header.clone()).collect();
  let (start_date, end_date, exposure_count) = Header::merge_non_numeric(&headers);
  let exposure_time_value: f64 = headers.iter().map(|h| h.exposure_time.0).sum();
  let exposure_time_unc: f64 = headers.iter().map(|h| h.exposure_time.1.powi(2)).sum::<f64>().sqrt();

  let mut header = headers[0].clone();
  header.category = SampleCategory::Merged;
  header.start_date = start_date;
  header.end_date = end_date;
  header.exposure_count = exposure_count;
  header.exposure_time = (exposure_time_value, exposure_time_unc);

  Ok(MergeResult {
    curve_averaged: merged_avg,
    curve_reintegrated: merged_reint,
    header,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::data::exposure::Matrix2D;
  use chrono::NaiveDate;

  fn header(distance: f64) -> Header {
    Header {
      title: "water".into(),
      category: SampleCategory::Primary,
      distance: (distance, 1.0),
      wavelength: (0.15418, 0.0001),
      pixel_size: (0.172, 0.0),
      beam_row: (31.5, 0.0),
      beam_col: (31.5, 0.0),
      exposure_time: (300.0, 0.1),
      exposure_count: 1,
      absolute_intensity_factor: (1.0, 0.0),
      start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap(),
      end_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(0, 5, 0).unwrap(),
      fsn: 1,
    }
  }

  fn flat_exposure(distance: f64, intensity: f64) -> Exposure {
    let n = 64;
    Exposure::new(Matrix2D::filled(n, n, intensity), Matrix2D::filled(n, n, intensity * 0.01), Matrix2D::filled(n, n, 1.0), header(distance))
  }

  fn flat_curve(intensity: f64) -> Curve {
    let q: Vec<f64> = (0..20).map(|i| 0.01 + i as f64 * 0.01).collect();
    let n = q.len();
    Curve::from_vectors(q, vec![intensity; n], vec![intensity * 0.01; n], vec![0.0; n], vec![1.0; n], vec![0.0; n])
  }

  #[test]
  fn two_distances_with_matching_flat_intensity_merge_without_error() {
    let inputs = vec![
      MergeInput {
        exposure: flat_exposure(500.0, 10.0),
        curve_averaged: flat_curve(10.0),
        curve_reintegrated: flat_curve(10.0),
        qmin: 0.0,
        qmax: 1.0,
      },
      MergeInput {
        exposure: flat_exposure(1000.0, 10.0),
        curve_averaged: flat_curve(10.0),
        curve_reintegrated: flat_curve(10.0),
        qmin: 0.0,
        qmax: 1.0,
      },
    ];
    let result = merge(inputs).unwrap();
    assert_eq!(result.header.category, SampleCategory::Merged);
    assert!(!result.curve_averaged.is_empty());
  }

  #[test]
  fn disjoint_q_windows_are_a_fatal_empty_common_q() {
    let inputs = vec![
      MergeInput {
        exposure: flat_exposure(500.0, 10.0),
        curve_averaged: flat_curve(10.0),
        curve_reintegrated: flat_curve(10.0),
        qmin: 0.0,
        qmax: 0.1,
      },
      MergeInput {
        exposure: flat_exposure(1000.0, 10.0),
        curve_averaged: flat_curve(10.0),
        curve_reintegrated: flat_curve(10.0),
        qmin: 0.2,
        qmax: 0.3,
      },
    ];
    assert!(matches!(merge(inputs), Err(PipelineError::EmptyCommonQ)));
  }
}
