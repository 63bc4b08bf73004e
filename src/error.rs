//! Central error taxonomy (spec §4.8). No error type here is allowed to
//! unwind past the [`crate::supervisor::DeviceSupervisor`] loop boundary —
//! every fallible call inside the supervisor returns a `SupervisorError` and
//! the loop decides fatal vs. non-fatal from the variant alone.

use thiserror::Error;

/// Name of a state variable, used to tie an error back to its origin when
/// one is known.
pub type VariableName = String;

/// The closed set of error kinds from spec §4.8 / §7.
#[derive(Error, Debug, Clone)]
pub enum SupervisorError {
  /// Generic device-layer fault. Reported; non-fatal.
  #[error("device error{}: {message}", variable_suffix(.variable))]
  Device {
    variable: Option<VariableName>,
    message: String,
  },

  /// Transport lost or unrecoverable. Fatal; terminates the Supervisor
  /// abnormally.
  #[error("communication error: {message}")]
  Communication { message: String },

  /// Device unresponsive past its watchdog timeout. Fatal.
  #[error("watchdog timeout after {elapsed_secs:.3}s (limit {timeout_secs:.3}s)")]
  WatchdogTimeout {
    elapsed_secs: f64,
    timeout_secs: f64,
  },

  /// A `set` request's value was out of range. Reported; non-fatal.
  #[error("invalid value for {variable}: {message}")]
  InvalidValue {
    variable: VariableName,
    message: String,
  },

  /// A `set` request targeted a variable the adapter refuses to write.
  /// Reported; non-fatal.
  #[error("variable {variable} is read-only")]
  ReadOnlyVariable { variable: VariableName },

  /// Client asked for a variable the adapter does not know. Reported;
  /// non-fatal.
  #[error("unknown variable: {variable}")]
  UnknownVariable { variable: VariableName },

  /// Client asked for a command the adapter does not know. Reported;
  /// non-fatal.
  #[error("unknown command: {command}")]
  UnknownCommand { command: String },

  /// A frame failed to decode. Reported; the Supervisor additionally clears
  /// its outstanding-query table so retries may happen.
  #[error("invalid message: {message}")]
  InvalidMessage { message: String },

  /// Unit conversion was attempted before the controller parameters needed
  /// for it were known. The request is re-queued, not reported as an error
  /// to the front-end.
  #[error("conversion unavailable: missing {missing_parameter}")]
  ConversionUnavailable { missing_parameter: String },

  /// A reduction-pipeline job failed. Reported through the pipeline result
  /// channel, not the device message bus.
  #[error("background process error: {message}")]
  BackgroundProcess { message: String },

  /// A pipeline job was aborted by its caller via the kill flag.
  #[error("user stop requested")]
  UserStop,
}

fn variable_suffix(variable: &Option<VariableName>) -> String {
  match variable {
    Some(name) => format!(" ({name})"),
    None => String::new(),
  }
}

impl SupervisorError {
  /// Whether this error is fatal to the owning Supervisor: it must report
  /// the error and terminate its loop abnormally. Matches the
  /// fatal/non-fatal split of spec §7.
  pub fn is_fatal(&self) -> bool {
    matches!(
      self,
      SupervisorError::Communication { .. } | SupervisorError::WatchdogTimeout { .. }
    )
  }

  /// The variable name associated with this error, if any.
  pub fn variable(&self) -> Option<&str> {
    match self {
      SupervisorError::Device { variable, .. } => variable.as_deref(),
      SupervisorError::InvalidValue { variable, .. } => Some(variable),
      SupervisorError::ReadOnlyVariable { variable } => Some(variable),
      SupervisorError::UnknownVariable { variable } => Some(variable),
      _ => None,
    }
  }

  pub fn device(message: impl Into<String>) -> Self {
    SupervisorError::Device {
      variable: None,
      message: message.into(),
    }
  }

  pub fn device_for(variable: impl Into<String>, message: impl Into<String>) -> Self {
    SupervisorError::Device {
      variable: Some(variable.into()),
      message: message.into(),
    }
  }
}

/// Errors raised by a [`crate::transport::Transport`] implementation. These
/// always map to [`SupervisorError::Communication`] once they cross into the
/// Supervisor.
#[derive(Error, Debug)]
pub enum TransportError {
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("unsolicited frame received with no pending request")]
  Unsolicited,

  #[error("pending request timed out after {0:.3}s")]
  RequestTimeout(f64),

  #[error("register operation failed after {0} retries")]
  RetriesExhausted(u32),

  #[error("transport already killed")]
  Killed,
}

/// Errors raised while decoding/encoding wire frames in a
/// [`crate::protocol::ProtocolAdapter`].
#[derive(Error, Debug)]
pub enum ProtocolError {
  #[error("malformed frame: {0}")]
  Malformed(String),

  #[error("checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
  Checksum { expected: u8, actual: u8 },

  #[error("unexpected reply for outstanding request")]
  UnexpectedReply,
}

/// Errors from the reduction pipeline (spec §4.7).
#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("empty input set")]
  EmptyInput,

  #[error("q-scale mismatch: {0}")]
  QMismatch(String),

  #[error("empty common-q interval between adjacent distances")]
  EmptyCommonQ,

  #[error("orthogonal distance regression failed to converge (status {0})")]
  OdrDiverged(i32),

  #[error("fewer than 2 valid points in common-q window")]
  InsufficientPoints,

  #[error(transparent)]
  Io(#[from] std::io::Error),

  #[error("aborted by caller")]
  Aborted,
}
