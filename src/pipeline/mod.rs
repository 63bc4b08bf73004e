//! Data-reduction pipeline (spec §4.7), grounded on
//! `cct/core2/processing/calculations/*.py`. Each stage is a pure
//! function over [`crate::data`] value types; [`PipelineJob`] wraps a stage
//! the way `BackgroundProcess` wraps a Python worker: progress flows out
//! over a bounded channel, a kill flag is checked between the costly steps,
//! and an abort surfaces as [`crate::error::PipelineError::Aborted`] rather
//! than a panic.

pub mod averaging;
pub mod background;
pub mod matrix_averager;
pub mod merging;
pub mod odr;
pub mod outlier;

pub use matrix_averager::{ErrorPropagation, MatrixAverager};
pub use outlier::OutlierMethod;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;

use crate::error::PipelineError;

/// One message along a [`PipelineJob`]'s progress channel (`BackgroundProcess.sendProgress`
/// / `sendMessage` / `sendWarning` / `sendError` in the original).
#[derive(Debug, Clone)]
pub enum ProgressMessage {
  Progress { message: String, total: Option<u32>, current: Option<u32> },
  Message(String),
  Warning(String),
  Error(String),
}

/// Cooperative cancellation flag shared between a job's owner and the
/// worker thread running it; checked at every progress update, mirroring
/// `BackgroundProcess.sendProgress`'s `killSwitch.is_set()` check.
#[derive(Clone, Default)]
pub struct KillSwitch(Arc<AtomicBool>);

impl KillSwitch {
  pub fn new() -> Self {
    KillSwitch(Arc::new(AtomicBool::new(false)))
  }

  pub fn request_stop(&self) {
    self.0.store(true, Ordering::Release);
  }

  pub fn is_stopped(&self) -> bool {
    self.0.load(Ordering::Acquire)
  }
}

/// Reports progress and checks for cancellation; stages take this instead
/// of talking to a channel directly so they stay pure and unit-testable.
pub struct JobContext {
  progress: Sender<ProgressMessage>,
  kill: KillSwitch,
}

impl JobContext {
  pub fn new(progress: Sender<ProgressMessage>, kill: KillSwitch) -> Self {
    JobContext { progress, kill }
  }

  pub fn send_progress(&self, message: impl Into<String>, total: Option<u32>, current: Option<u32>) -> Result<(), PipelineError> {
    let _ = self.progress.send(ProgressMessage::Progress {
      message: message.into(),
      total,
      current,
    });
    if self.kill.is_stopped() {
      return Err(PipelineError::Aborted);
    }
    Ok(())
  }

  pub fn send_message(&self, message: impl Into<String>) {
    let _ = self.progress.send(ProgressMessage::Message(message.into()));
  }

  pub fn send_warning(&self, message: impl Into<String>) {
    let _ = self.progress.send(ProgressMessage::Warning(message.into()));
  }

  pub fn send_error(&self, message: impl Into<String>) {
    let _ = self.progress.send(ProgressMessage::Error(message.into()));
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn kill_switch_aborts_the_next_progress_report() {
    let (tx, rx) = crossbeam_channel::unbounded();
    let kill = KillSwitch::new();
    let ctx = JobContext::new(tx, kill.clone());
    ctx.send_progress("step 1", Some(2), Some(1)).unwrap();
    kill.request_stop();
    assert!(matches!(ctx.send_progress("step 2", Some(2), Some(2)), Err(PipelineError::Aborted)));
    assert_eq!(rx.len(), 2);
  }
}
