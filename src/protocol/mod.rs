//! [`ProtocolAdapter`]: the pluggable per-hardware-family parser/encoder
//! trait from spec §4.5. A Supervisor is monomorphic over `Box<dyn
//! ProtocolAdapter>` — subclass-per-device hierarchies in the original
//! collapse into this one trait plus a closed enum of device kinds (spec
//! §9 "Porting patterns").

pub mod circulator;
pub mod dataq;
pub mod detector;
pub mod motor;
pub mod vacuum;
pub mod xray_source;

use std::time::Duration;

use crate::device::{BusySemaphore, OutstandingQueries, RefreshCounters, StateTable};
use crate::error::SupervisorError;
use crate::transport::register::RegisterTransport;
use crate::value::Value;
use crate::watchdog::Watchdog;

/// One command argument, re-exported here so adapters don't need to reach
/// into `crate::message` directly.
pub use crate::message::Argument;

/// A side effect an adapter call wants to have happen, collected into
/// `AdapterContext::outbound` rather than performed directly — this keeps
/// adapters free of any channel/transport plumbing, matching the original's
/// separation between `Device.*` (device-specific) and `DeviceBackend.*`
/// (generic loop machinery).
#[derive(Debug)]
pub enum OutboundEffect {
  /// Write `bytes` through the owning Transport.
  Send {
    bytes: Vec<u8>,
    expected_replies: u32,
    timeout: Duration,
    asynchronous: bool,
  },
  /// Update a state variable (goes through the Supervisor's
  /// `update_variable`, so watchdog-pat / refresh-counter / dedup logic all
  /// still apply).
  Update {
    name: String,
    value: Value,
    force: bool,
  },
  /// Report a non-fatal error for (optionally) a named variable.
  Error(SupervisorError),
  /// Report a fatal communication error; the Supervisor tears down.
  Fatal(SupervisorError),
}

/// Mutable access an adapter call needs into the owning Supervisor's state.
/// Borrowed for the duration of one adapter method call only.
pub struct AdapterContext<'a> {
  pub state: &'a mut StateTable,
  pub outstanding: &'a mut OutstandingQueries,
  pub refresh: &'a mut RefreshCounters,
  pub busy: &'a BusySemaphore,
  pub watchdog: &'a mut Watchdog,
  /// Present only for register-based devices (spec §4.3.2); `query`/`set`
  /// may call straight through to it instead of producing `Send` effects.
  pub register: Option<&'a RegisterTransport>,
  pub outbound: Vec<OutboundEffect>,
}

impl<'a> AdapterContext<'a> {
  pub fn push_update(&mut self, name: impl Into<String>, value: impl Into<Value>, force: bool) {
    self.outbound.push(OutboundEffect::Update {
      name: name.into(),
      value: value.into(),
      force,
    });
  }

  pub fn push_error(&mut self, error: SupervisorError) {
    self.outbound.push(OutboundEffect::Error(error));
  }

  pub fn push_send(
    &mut self,
    bytes: Vec<u8>,
    expected_replies: u32,
    timeout: Duration,
    asynchronous: bool,
  ) {
    self.outbound.push(OutboundEffect::Send {
      bytes,
      expected_replies,
      timeout,
      asynchronous,
    });
  }
}

/// The result of [`ProtocolAdapter::frame`]: the complete frames found in
/// the buffer, in order, plus the index up to which the buffer was
/// consumed. Bytes at and after `consumed` must be retained by the caller as
/// the next call's leading partial frame.
pub struct FrameResult {
  pub frames: Vec<Vec<u8>>,
  pub consumed: usize,
}

/// Per-hardware-family parser/encoder/side-effect trait (spec §4.5).
pub trait ProtocolAdapter: Send {
  /// Discover complete frames inside `buffer` (spec §4.3.1 step 3). Does
  /// not mutate adapter state; pure framing.
  fn frame(&self, buffer: &[u8]) -> FrameResult;

  /// Queries the value of `name`. Returns `true` if a query has been
  /// dispatched and a reply is expected (async devices) or the value has
  /// already been resolved and `update_variable` was called (sync/register
  /// devices via `ctx.register`). Returns `false` if the query could not be
  /// started and no update is forthcoming.
  fn query(&mut self, name: &str, ctx: &mut AdapterContext) -> bool;

  /// Set `name` to `value`. May push `OutboundEffect::Error` with
  /// `SupervisorError::ReadOnlyVariable`/`InvalidValue`.
  fn set(&mut self, name: &str, value: &Value, ctx: &mut AdapterContext);

  /// Execute command `name` with `arguments`.
  fn execute(&mut self, name: &str, arguments: &[Argument], ctx: &mut AdapterContext);

  /// Decode one complete `frame` (as produced by [`Self::frame`]),
  /// correlated with `original_sent` (the bytes of the `Send` effect that
  /// elicited it, if any — needed by e.g. the motor adapter to know which
  /// axis parameter a reply refers to).
  fn process_incoming(&mut self, frame: &[u8], original_sent: Option<&[u8]>, ctx: &mut AdapterContext);

  /// Run once, immediately after the Transport/connection is established,
  /// before the first poll iteration.
  fn initialize_after_connect(&mut self, ctx: &mut AdapterContext);
}
