//! `Header`: an immutable snapshot of per-exposure metadata, grounded on
//! `cct/core2/dataclasses/header.py`. Value-with-uncertainty fields are
//! carried as `(value, uncertainty)` pairs, matching the original's
//! convention of storing a `.err`-suffixed companion for every numeric
//! attribute.

use chrono::NaiveDateTime;

/// Where a sample's data currently sits in the reduction pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleCategory {
  Primary,
  Subtracted,
  Merged,
}

impl std::fmt::Display for SampleCategory {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      SampleCategory::Primary => "primary",
      SampleCategory::Subtracted => "subtracted",
      SampleCategory::Merged => "merged",
    };
    write!(f, "{s}")
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Header {
  pub title: String,
  pub category: SampleCategory,
  pub distance: (f64, f64),
  pub wavelength: (f64, f64),
  pub pixel_size: (f64, f64),
  pub beam_row: (f64, f64),
  pub beam_col: (f64, f64),
  pub exposure_time: (f64, f64),
  pub exposure_count: u32,
  pub absolute_intensity_factor: (f64, f64),
  pub start_date: NaiveDateTime,
  pub end_date: NaiveDateTime,
  pub fsn: u32,
}

impl Header {
  /// Combine headers averaged over a set of exposures belonging to the same
  /// (sample, distance): value/uncertainty fields go through the caller's
  /// `MatrixAverager`, everything else follows the original's per-field
  /// rules (`max(enddate)`, `min(startdate)`, sum of `exposurecount`).
  pub fn merge_non_numeric(headers: &[Header]) -> (NaiveDateTime, NaiveDateTime, u32) {
    let start_date = headers.iter().map(|h| h.start_date).min().expect("non-empty header set");
    let end_date = headers.iter().map(|h| h.end_date).max().expect("non-empty header set");
    let exposure_count = headers.iter().map(|h| h.exposure_count).sum();
    (start_date, end_date, exposure_count)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::NaiveDate;

  fn header(fsn: u32, start: &str, end: &str, count: u32) -> Header {
    Header {
      title: "water".into(),
      category: SampleCategory::Primary,
      distance: (1000.0, 1.0),
      wavelength: (0.15418, 0.0001),
      pixel_size: (172.0, 0.0),
      beam_row: (512.0, 1.0),
      beam_col: (512.0, 1.0),
      exposure_time: (300.0, 0.1),
      exposure_count: count,
      absolute_intensity_factor: (1.0, 0.0),
      start_date: NaiveDate::parse_from_str(start, "%Y-%m-%d").unwrap().and_hms_opt(0, 0, 0).unwrap(),
      end_date: NaiveDate::parse_from_str(end, "%Y-%m-%d").unwrap().and_hms_opt(0, 0, 0).unwrap(),
      fsn,
    }
  }

  #[test]
  fn non_numeric_merge_takes_min_start_max_end_and_sums_counts() {
    let headers = vec![header(1, "2024-01-01", "2024-01-02", 3), header(2, "2023-12-31", "2024-01-03", 5)];
    let (start, end, count) = Header::merge_non_numeric(&headers);
    assert_eq!(start, headers[1].start_date);
    assert_eq!(end, headers[1].end_date);
    assert_eq!(count, 8);
  }
}
