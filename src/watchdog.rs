//! Per-device deadline timer (spec §4.2), ported line-for-line from
//! `cct/core/devices/device/backend.py::Watchdog`.

use std::time::{Duration, Instant};

use crate::error::SupervisorError;

#[derive(Debug, Clone)]
pub struct Watchdog {
  timeout: Duration,
  active: bool,
  timestamp: Instant,
}

impl Watchdog {
  /// Create a new watchdog, active by default, with `timestamp` set to now.
  pub fn new(timeout: Duration) -> Self {
    Watchdog {
      timeout,
      active: true,
      timestamp: Instant::now(),
    }
  }

  pub fn disable(&mut self) {
    self.active = false;
  }

  pub fn enable(&mut self) {
    self.active = true;
  }

  pub fn is_active(&self) -> bool {
    self.active
  }

  /// Reset the timestamp to now.
  pub fn pat(&mut self) {
    self.timestamp = Instant::now();
  }

  pub fn elapsed(&self) -> Duration {
    self.timestamp.elapsed()
  }

  pub fn timeout(&self) -> Duration {
    self.timeout
  }

  /// Raise `WatchdogTimeout` if active and past the deadline.
  pub fn check(&self) -> Result<(), SupervisorError> {
    if self.active && self.elapsed() > self.timeout {
      Err(SupervisorError::WatchdogTimeout {
        elapsed_secs: self.elapsed().as_secs_f64(),
        timeout_secs: self.timeout.as_secs_f64(),
      })
    } else {
      Ok(())
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fresh_watchdog_never_trips() {
    let wd = Watchdog::new(Duration::from_millis(10));
    assert!(wd.check().is_ok());
  }

  #[test]
  fn disabled_watchdog_never_trips() {
    let mut wd = Watchdog::new(Duration::from_millis(1));
    wd.disable();
    std::thread::sleep(Duration::from_millis(5));
    assert!(wd.check().is_ok());
  }

  #[test]
  fn expired_watchdog_reports_timeout() {
    let wd = Watchdog::new(Duration::from_millis(1));
    std::thread::sleep(Duration::from_millis(10));
    let err = wd.check().unwrap_err();
    assert!(matches!(err, SupervisorError::WatchdogTimeout { .. }));
  }

  #[test]
  fn pat_resets_elapsed() {
    let mut wd = Watchdog::new(Duration::from_millis(50));
    std::thread::sleep(Duration::from_millis(10));
    wd.pat();
    assert!(wd.elapsed() < Duration::from_millis(10));
  }
}
