//! [`DeviceFront`]: the process-local handle the rest of the program uses to
//! talk to a [`crate::supervisor::DeviceSupervisor`] (spec §4's
//! "DeviceFront"), grounded on
//! `cct/core/devices/device/frontend.py::Device`. Marshals
//! query/set/execute/exit requests onto the Supervisor's inbound bus and
//! demarshals variable-change/error/ready/telemetry/log events out of its
//! own, keeping a local mirror of the state table so callers can read the
//! last known value of a variable without a round trip.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::bus::{BusReceiver, BusSender, RecvError};
use crate::error::SupervisorError;
use crate::message::{Argument, IdAllocator, Message, MessageKind};
use crate::telemetry::Telemetry;
use crate::value::Value;

/// A demarshalled Supervisor -> Front event, the event-driven counterpart of
/// the original's `variable-change`/`error`/`disconnect`/`ready`/`telemetry`
/// signals.
#[derive(Debug, Clone)]
pub enum FrontEvent {
  /// Emitted before the local mirror is updated, so a handler can still read
  /// the previous value via [`DeviceFront::get_variable`].
  VariableChange { name: String, value: Value },
  Error {
    variable: Option<String>,
    error: SupervisorError,
    fatal: bool,
  },
  Disconnected { abnormal: bool },
  Ready,
  Telemetry { data: Telemetry },
  Log { line: String },
}

/// Error raised when the caller tries to talk to a Supervisor that has
/// already sent its terminal `exited`.
#[derive(Debug, thiserror::Error)]
#[error("background process for device {0} is not running")]
pub struct NotConnected(pub String);

pub struct DeviceFront {
  name: String,
  to_supervisor: BusSender,
  from_supervisor: BusReceiver,
  ids: IdAllocator,
  properties: HashMap<String, Value>,
  timestamps: HashMap<String, Instant>,
  ready: bool,
  connected: bool,
}

impl DeviceFront {
  /// The busy semaphore itself (spec line 132, "Clients test but only
  /// Supervisor adjusts") lives solely in the `DeviceSupervisor`
  /// (`self.busy`, shared into every `AdapterContext` as `ctx.busy`) — a
  /// `DeviceFront` has no semaphore of its own to avoid two disconnected
  /// copies of the same flag. Clients observe busy state through
  /// [`FrontEvent::Telemetry`]'s `busy_level`.
  pub fn new(name: impl Into<String>, to_supervisor: BusSender, from_supervisor: BusReceiver) -> Self {
    let name = name.into();
    let mut properties = HashMap::new();
    let mut timestamps = HashMap::new();
    properties.insert("_status".to_string(), Value::Str("Disconnected".to_string()));
    timestamps.insert("_status".to_string(), Instant::now());
    DeviceFront {
      name,
      to_supervisor,
      from_supervisor,
      ids: IdAllocator::new(),
      properties,
      timestamps,
      ready: false,
      connected: true,
    }
  }

  fn send(&mut self, kind: MessageKind) -> Result<(), NotConnected> {
    if !self.connected {
      return Err(NotConnected(self.name.clone()));
    }
    let id = self.ids.next_id();
    let sender = format!("{}__frontend", self.name);
    let _ = self.to_supervisor.send(Message::new(kind, id, sender));
    Ok(())
  }

  /// Read the last known value of `name`. For the freshest value, call
  /// [`Self::refresh_variable`] and wait for the resulting
  /// [`FrontEvent::VariableChange`].
  pub fn get_variable(&self, name: &str) -> Option<&Value> {
    self.properties.get(name)
  }

  pub fn list_variables(&self) -> Vec<&str> {
    self.properties.keys().map(String::as_str).collect()
  }

  pub fn missing_variables<'a>(&self, all_variables: &'a [String]) -> Vec<&'a str> {
    all_variables
      .iter()
      .filter(|v| !self.properties.contains_key(v.as_str()))
      .map(String::as_str)
      .collect()
  }

  pub fn set_variable(&mut self, name: impl Into<String>, value: Value) -> Result<(), NotConnected> {
    let name = name.into();
    self.send(MessageKind::Set {
      name: name.clone(),
      value,
    })?;
    self.refresh_variable(name, true)
  }

  pub fn refresh_variable(&mut self, name: impl Into<String>, signal_needed: bool) -> Result<(), NotConnected> {
    self.send(MessageKind::Query {
      name: name.into(),
      signal_needed,
    })
  }

  pub fn execute_command(&mut self, command: impl Into<String>, arguments: Vec<Argument>) -> Result<(), NotConnected> {
    self.send(MessageKind::Execute {
      name: command.into(),
      arguments,
    })
  }

  pub fn request_telemetry(&mut self) -> Result<(), NotConnected> {
    self.send(MessageKind::TelemetryRequest)
  }

  pub fn send_config(&mut self, config: Vec<(String, String)>) -> Result<(), NotConnected> {
    self.send(MessageKind::Config { config })
  }

  /// Initiate disconnection: request the Supervisor to stop. The terminal
  /// `exited` will surface as a later [`FrontEvent::Disconnected`].
  pub fn disconnect_device(&mut self) -> Result<(), NotConnected> {
    self.send(MessageKind::Exit)
  }

  pub fn is_ready(&self) -> bool {
    self.ready
  }

  pub fn is_connected(&self) -> bool {
    self.connected
  }

  /// Drain every pending event from the Supervisor, applying each to the
  /// local state mirror as it is read (spec: `update(name, value)` both
  /// stores the new value and is forwarded), and return them in arrival
  /// order. Blocks for at most `timeout` waiting for the first event; once
  /// one arrives, further events are drained without blocking.
  pub fn poll_events(&mut self, timeout: Duration) -> Vec<FrontEvent> {
    let mut events = Vec::new();

    let first = match self.from_supervisor.recv_timeout(timeout) {
      Ok(message) => message,
      Err(RecvError::Timeout) => return events,
      Err(RecvError::Disconnected) => {
        self.connected = false;
        return events;
      }
    };
    self.handle_message(first, &mut events);

    loop {
      match self.from_supervisor.try_recv() {
        Ok(message) => self.handle_message(message, &mut events),
        Err(RecvError::Timeout) => break,
        Err(RecvError::Disconnected) => {
          self.connected = false;
          break;
        }
      }
    }
    events
  }

  fn handle_message(&mut self, message: Message, events: &mut Vec<FrontEvent>) {
    match message.kind {
      MessageKind::Update { name, value } => {
        events.push(FrontEvent::VariableChange {
          name: name.clone(),
          value: value.clone(),
        });
        self.properties.insert(name.clone(), value);
        self.timestamps.insert(name, Instant::now());
      }
      MessageKind::Error { error, fatal } => {
        let variable = error.variable().map(str::to_string);
        events.push(FrontEvent::Error { variable, error, fatal });
      }
      MessageKind::Ready => {
        self.ready = true;
        events.push(FrontEvent::Ready);
      }
      MessageKind::Telemetry { data } => events.push(FrontEvent::Telemetry { data }),
      MessageKind::Log { line } => events.push(FrontEvent::Log { line }),
      MessageKind::Exited { normal_termination } => {
        self.connected = false;
        self.ready = false;
        self.properties.insert("_status".to_string(), Value::Str("Disconnected".to_string()));
        self.timestamps.insert("_status".to_string(), Instant::now());
        events.push(FrontEvent::Disconnected {
          abnormal: !normal_termination,
        });
      }
      // Front <- Transport traffic never crosses this boundary.
      _ => {}
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn front() -> (DeviceFront, BusSender) {
    let (to_sup, from_front) = crate::bus::channel(8);
    let (to_front, from_sup) = crate::bus::channel(8);
    let _ = from_front; // Supervisor side, unused by these tests.
    (DeviceFront::new("tpg1", to_sup, from_sup), to_front)
  }

  #[test]
  fn variable_change_updates_local_mirror_before_returning() {
    let (mut front, sup_to_front) = front();
    sup_to_front
      .send(Message::new(
        MessageKind::Update {
          name: "pressure".into(),
          value: Value::Float(1e-5),
        },
        0,
        "tpg1",
      ))
      .unwrap();
    let events = front.poll_events(Duration::from_millis(50));
    assert!(matches!(events[0], FrontEvent::VariableChange { .. }));
    assert_eq!(front.get_variable("pressure"), Some(&Value::Float(1e-5)));
  }

  #[test]
  fn exited_marks_disconnected_and_resets_ready() {
    let (mut front, sup_to_front) = front();
    sup_to_front
      .send(Message::new(MessageKind::Ready, 0, "tpg1"))
      .unwrap();
    sup_to_front
      .send(Message::new(
        MessageKind::Exited {
          normal_termination: false,
        },
        1,
        "tpg1",
      ))
      .unwrap();
    let events = front.poll_events(Duration::from_millis(50));
    assert!(matches!(events[0], FrontEvent::Ready));
    assert!(matches!(events[1], FrontEvent::Disconnected { abnormal: true }));
    assert!(!front.is_connected());
    assert!(!front.is_ready());
  }

  #[test]
  fn disconnect_after_exited_returns_not_connected() {
    let (mut front, sup_to_front) = front();
    sup_to_front
      .send(Message::new(
        MessageKind::Exited {
          normal_termination: true,
        },
        0,
        "tpg1",
      ))
      .unwrap();
    front.poll_events(Duration::from_millis(50));
    assert!(front.disconnect_device().is_err());
  }
}
