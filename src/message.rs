//! [`Message`]: the single typed, identified, timestamped envelope that
//! flows over every [`crate::bus::MessageBus`] in the system (spec §3, §4.1).
//!
//! The original implementation passes plain dicts with a `'type'` key
//! (`cct/core/devices/device/message.py`); here that becomes a closed
//! [`MessageKind`] enum so the Supervisor's dispatch loop is exhaustively
//! matched and unrepresentable messages cannot be constructed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::SupervisorError;
use crate::value::Value;

/// Process-wide instance counter, surfaced in [`crate::telemetry::Telemetry`]
/// as `message_instances`. Mirrors `Message.instances` in the Python
/// original.
static INSTANCE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One command argument to an `execute` message.
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
  Bool(bool),
  Int(i64),
  Float(f64),
  Str(String),
}

/// The kind-specific payload of a [`Message`]. Field names follow spec
/// §4.1's list verbatim.
#[derive(Debug, Clone)]
pub enum MessageKind {
  /// Replace the live configuration map.
  Config { config: Vec<(String, String)> },
  /// Request the owning loop to terminate normally.
  Exit,
  /// Query a variable; `signal_needed` forces at least one `update` in
  /// reply even if unchanged.
  Query { name: String, signal_needed: bool },
  /// Set a variable to a new value.
  Set { name: String, value: Value },
  /// Execute a named command with arguments.
  Execute { name: String, arguments: Vec<Argument> },
  /// Supervisor → Transport: write `bytes` on the wire. `expected_replies`
  /// is how many `incoming` frames this send elicits (0 = none, pushes
  /// nothing onto the pending stack); `asynchronous` allows the next queued
  /// send to go out before this one's replies have all arrived.
  Send {
    bytes: Vec<u8>,
    expected_replies: u32,
    timeout: Duration,
    asynchronous: bool,
  },
  /// Front-end requests a telemetry snapshot out of cycle.
  TelemetryRequest,
  /// Transport delivered a decoded incoming frame, plus the request that
  /// elicited it (if any — unsolicited frames carry `None` and are
  /// themselves a `CommunicationError` at the transport layer).
  Incoming {
    bytes: Vec<u8>,
    original_sent: Option<Vec<u8>>,
  },
  /// Transport finished writing a previously queued `send`.
  SendComplete,
  /// Transport hit an unrecoverable fault.
  CommunicationError { error: SupervisorError },
  /// A pending request's reply never arrived within its timeout.
  Timeout,
  /// A formatted log record, forwarded untouched to the front-end log
  /// channel.
  Log { line: String },
  /// A state variable changed (or a refresh was explicitly requested).
  Update { name: String, value: Value },
  /// A non-fatal or fatal error occurred.
  Error {
    error: SupervisorError,
    fatal: bool,
  },
  /// Terminal message: the Supervisor has exited.
  Exited { normal_termination: bool },
  /// All of `all_variables` are now present in the state table (emitted
  /// exactly once).
  Ready,
  /// Periodic introspection snapshot.
  Telemetry { data: crate::telemetry::Telemetry },
}

impl MessageKind {
  /// Short tag used in log lines and tests; mirrors the Python `'type'`
  /// string so S1–S6 scenario descriptions read the same way.
  pub fn tag(&self) -> &'static str {
    match self {
      MessageKind::Config { .. } => "config",
      MessageKind::Exit => "exit",
      MessageKind::Query { .. } => "query",
      MessageKind::Set { .. } => "set",
      MessageKind::Execute { .. } => "execute",
      MessageKind::Send { .. } => "send",
      MessageKind::TelemetryRequest => "telemetry-request",
      MessageKind::Incoming { .. } => "incoming",
      MessageKind::SendComplete => "send-complete",
      MessageKind::CommunicationError { .. } => "communication-error",
      MessageKind::Timeout => "timeout",
      MessageKind::Log { .. } => "log",
      MessageKind::Update { .. } => "update",
      MessageKind::Error { .. } => "error",
      MessageKind::Exited { .. } => "exited",
      MessageKind::Ready => "ready",
      MessageKind::Telemetry { .. } => "telemetry",
    }
  }
}

/// A typed, identified, timestamped envelope. `id` is monotonically
/// increasing per-sender, `timestamp` is a monotonic instant (never wall
/// clock — wall-clock dates only ever live inside payloads, e.g. `Header`).
#[derive(Debug, Clone)]
pub struct Message {
  pub kind: MessageKind,
  pub id: u64,
  pub sender: String,
  pub timestamp: Instant,
}

impl Message {
  pub fn new(kind: MessageKind, id: u64, sender: impl Into<String>) -> Self {
    INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed);
    Message {
      kind,
      id,
      sender: sender.into(),
      timestamp: Instant::now(),
    }
  }

  /// Total number of `Message` values ever constructed in this process.
  /// Used only for telemetry; never for correctness.
  pub fn total_instances() -> u64 {
    INSTANCE_COUNTER.load(Ordering::Relaxed)
  }

  pub fn age(&self) -> Duration {
    self.timestamp.elapsed()
  }
}

/// Monotonically increasing per-sender id allocator, one per endpoint
/// (Supervisor, Transport, DeviceFront...).
#[derive(Debug, Default)]
pub struct IdAllocator {
  next: u64,
}

impl IdAllocator {
  pub fn new() -> Self {
    IdAllocator { next: 0 }
  }

  pub fn next_id(&mut self) -> u64 {
    let id = self.next;
    self.next += 1;
    id
  }
}
