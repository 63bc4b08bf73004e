//! TOML configuration (spec §6, expanded in SPEC_FULL.md §6.1), grounded on
//! the original's `[io]`/`[processing]` INI sections, loaded here with
//! `serde` + `toml` rather than an INI parser — the teacher already
//! depends on `serde` for wire structures, and no example in the retrieval
//! pack reaches for an INI crate.

use std::path::PathBuf;

use serde::Deserialize;

use crate::pipeline::{ErrorPropagation, OutlierMethod};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("failed to read config file {path}: {source}")]
  Read { path: PathBuf, source: std::io::Error },

  #[error("failed to parse config file {path}: {source}")]
  Parse { path: PathBuf, source: toml::de::Error },
}

#[derive(Debug, Clone, Deserialize)]
pub struct IoConfig {
  pub datadir: PathBuf,
  #[serde(default = "default_eval2dsubpath")]
  pub eval2dsubpath: String,
  #[serde(default = "default_masksubpath")]
  pub masksubpath: String,
  #[serde(default = "default_fsndigits")]
  pub fsndigits: u32,
  pub hdf5: PathBuf,
  pub badfsnsfile: PathBuf,
  #[serde(default)]
  pub fsnranges: Vec<(u32, u32)>,
}

fn default_eval2dsubpath() -> String {
  "eval2d".to_string()
}

fn default_masksubpath() -> String {
  "mask".to_string()
}

fn default_fsndigits() -> u32 {
  5
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ErrorPropagationConfig {
  Weighted,
  Linear,
  Gaussian,
  Conservative,
  Standarderrorofmean,
}

impl From<ErrorPropagationConfig> for ErrorPropagation {
  fn from(value: ErrorPropagationConfig) -> Self {
    match value {
      ErrorPropagationConfig::Weighted => ErrorPropagation::Weighted,
      ErrorPropagationConfig::Linear => ErrorPropagation::Linear,
      ErrorPropagationConfig::Gaussian => ErrorPropagation::Gaussian,
      ErrorPropagationConfig::Conservative => ErrorPropagation::Conservative,
      ErrorPropagationConfig::Standarderrorofmean => ErrorPropagation::StandardErrorOfMean,
    }
  }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum OutlierMethodConfig {
  Zscore,
  Modifiedzscore,
  Iqr,
}

impl From<OutlierMethodConfig> for OutlierMethod {
  fn from(value: OutlierMethodConfig) -> Self {
    match value {
      OutlierMethodConfig::Zscore => OutlierMethod::ZScore,
      OutlierMethodConfig::Modifiedzscore => OutlierMethod::ModifiedZScore,
      OutlierMethodConfig::Iqr => OutlierMethod::Iqr,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
  errorpropagation: ErrorPropagationConfig,
  abscissaerrorpropagation: ErrorPropagationConfig,
  outliermethod: OutlierMethodConfig,
  pub std_multiplier: f64,
  #[serde(default)]
  pub logcorrelmatrix: bool,
}

impl ProcessingConfig {
  pub fn error_propagation(&self) -> ErrorPropagation {
    self.errorpropagation.into()
  }

  pub fn abscissa_error_propagation(&self) -> ErrorPropagation {
    self.abscissaerrorpropagation.into()
  }

  pub fn outlier_method(&self) -> OutlierMethod {
    self.outliermethod.into()
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub io: IoConfig,
  pub processing: ProcessingConfig,
}

impl Config {
  pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
    let path = path.into();
    let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read { path: path.clone(), source })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse { path, source })
  }

  pub fn from_str(text: &str) -> Result<Self, toml::de::Error> {
    toml::from_str(text)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const SAMPLE: &str = r#"
[io]
datadir = "/data/saxs"
hdf5 = "/data/saxs/processed.h5"
badfsnsfile = "/data/saxs/badfsns.txt"
fsnranges = [[100, 200], [500, 600]]

[processing]
errorpropagation = "gaussian"
abscissaerrorpropagation = "gaussian"
outliermethod = "iqr"
std_multiplier = 1.5
logcorrelmatrix = false
"#;

  #[test]
  fn parses_the_documented_shape_and_applies_defaults() {
    let config = Config::from_str(SAMPLE).unwrap();
    assert_eq!(config.io.eval2dsubpath, "eval2d");
    assert_eq!(config.io.masksubpath, "mask");
    assert_eq!(config.io.fsndigits, 5);
    assert_eq!(config.io.fsnranges, vec![(100, 200), (500, 600)]);
    assert!(matches!(config.processing.error_propagation(), ErrorPropagation::Gaussian));
    assert!(matches!(config.processing.outlier_method(), OutlierMethod::Iqr));
  }

  #[test]
  fn rejects_an_unknown_outlier_method() {
    let bad = SAMPLE.replace("outliermethod = \"iqr\"", "outliermethod = \"bogus\"");
    assert!(Config::from_str(&bad).is_err());
  }
}
