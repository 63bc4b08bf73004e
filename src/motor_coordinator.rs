//! Domain logic that sits above a motor [`DeviceFront`] (spec §4.6),
//! grounded on `cct/core/devices/motor.py::TMCMcard`: soft-limit
//! enforcement, single-outstanding-move arbitration per controller, and
//! position-file persistence. The wire-level conversions used for state
//! synchronization live in [`crate::protocol::motor`]; `moveto`/`moverel`
//! need their own copies of the position formula because they must check
//! soft limits and reject before a command is ever sent, the same split the
//! original draws between `TMCMcard` (physical units, limits) and its
//! backend (raw TMCL frames only).

use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::error::SupervisorError;
use crate::front::{DeviceFront, FrontEvent};
use crate::message::Argument;
use crate::value::Value;

const FULL_STEP_SIZE: f64 = 1.0 / 200.0;

/// How far a reloaded position may drift from the controller's own
/// `actualposition` before it is recalibrated rather than trusted as-is.
/// `cct/core/devices/motor.py::TMCMcard._load_positions` compares against
/// 0.001 mm; matched here since the original is authoritative for exact
/// constants.
const CALIBRATION_TOLERANCE_MM: f64 = 0.001;

fn pos_to_raw(phys: f64, microstepresolution: i64) -> i32 {
  (phys * 2f64.powi(microstepresolution as i32) / FULL_STEP_SIZE) as i32
}

fn microstepresolution(front: &DeviceFront, axis: u8) -> Result<i64, SupervisorError> {
  front
    .get_variable(&format!("microstepresolution${axis}"))
    .and_then(Value::as_int)
    .ok_or_else(|| SupervisorError::ConversionUnavailable {
      missing_parameter: format!("microstepresolution${axis}"),
    })
}

fn soft_limits(front: &DeviceFront, axis: u8) -> Option<(f64, f64)> {
  let left = front.get_variable(&format!("softleft${axis}")).and_then(Value::as_float)?;
  let right = front.get_variable(&format!("softright${axis}")).and_then(Value::as_float)?;
  Some((left, right))
}

fn actual_position(front: &DeviceFront, axis: u8) -> Option<f64> {
  front.get_variable(&format!("actualposition${axis}")).and_then(Value::as_float)
}

/// One line of a `<controller>.motorpos` file: `<axis>: <position> (<softleft>, <softright>)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SavedPosition {
  pub axis: u8,
  pub position: f64,
  pub softleft: f64,
  pub softright: f64,
}

fn position_line_regex() -> Regex {
  Regex::new(r"^(?P<axis>\d+): (?P<position>[+-]?(\d+)*\.?\d+([eE][+-]?\d+)?) \((?P<left>[+-]?(\d+)*\.?\d+([eE][+-]?\d+)?), (?P<right>[+-]?(\d+)*\.?\d+([eE][+-]?\d+)?)\)$").unwrap()
}

/// Tracks, per controller, which axis (if any) is mid-move and whether the
/// position file has been loaded. Mirrors `TMCMcard._movinglock`/`_moving`
/// and `_positions_loaded`; spec invariant 3 says a motor is moving iff this
/// record names it and the Supervisor's busy semaphore (`ctx.busy`, the sole
/// authoritative instance) is held.
pub struct MotorCoordinator {
  moving: Option<u8>,
  positions_loaded: bool,
}

impl Default for MotorCoordinator {
  fn default() -> Self {
    Self::new()
  }
}

impl MotorCoordinator {
  pub fn new() -> Self {
    MotorCoordinator {
      moving: None,
      positions_loaded: false,
    }
  }

  pub fn moving_axis(&self) -> Option<u8> {
    self.moving
  }

  pub fn positions_loaded(&self) -> bool {
    self.positions_loaded
  }

  pub fn checklimits(front: &DeviceFront, axis: u8, position: f64) -> bool {
    match soft_limits(front, axis) {
      Some((left, right)) => position >= left && position <= right,
      None => true,
    }
  }

  fn begin_move(&mut self, front: &mut DeviceFront, axis: u8, target: f64, relative: bool) -> Result<(), SupervisorError> {
    if !self.positions_loaded {
      return Err(SupervisorError::device("cannot move motors until positions and soft limits have been loaded"));
    }
    // Move arbitration step 2 (spec §4.6): reject unless the controller is
    // idle. `self.moving` is set for the whole controller (any axis), so a
    // second move request for the *same* axis already in flight is rejected
    // here too, not just a request for a different axis.
    if let Some(other) = self.moving {
      return Err(SupervisorError::device(format!("cannot move motor {axis}: motor {other} is currently moving")));
    }
    let absolute_target = if relative {
      actual_position(front, axis).unwrap_or(0.0) + target
    } else {
      target
    };
    if !Self::checklimits(front, axis, absolute_target) {
      return Err(SupervisorError::device(format!("cannot move motor {axis}, requested position outside soft limits")));
    }
    let microsteps = microstepresolution(front, axis)?;
    let raw = pos_to_raw(target, microsteps);
    // Step 3's busy-semaphore acquisition happens in
    // `crate::protocol::motor::MotorAdapter::execute` against the
    // Supervisor's own `ctx.busy` — the only authoritative copy (spec line
    // 132). `self.moving` is this coordinator's local record of which axis
    // currently owns that permit, kept in sync by `observe_event` below.
    self.moving = Some(axis);
    let command = if relative { "moverel_raw" } else { "moveto_raw" };
    if let Err(e) = front.execute_command(command, vec![Argument::Int(axis as i64), Argument::Int(raw as i64)]) {
      self.moving = None;
      return Err(SupervisorError::device(e.to_string()));
    }
    Ok(())
  }

  pub fn moveto(&mut self, front: &mut DeviceFront, axis: u8, position: f64) -> Result<(), SupervisorError> {
    self.begin_move(front, axis, position, false)
  }

  pub fn moverel(&mut self, front: &mut DeviceFront, axis: u8, delta: f64) -> Result<(), SupervisorError> {
    self.begin_move(front, axis, delta, true)
  }

  pub fn stop(&mut self, front: &mut DeviceFront, axis: u8) -> Result<(), SupervisorError> {
    front
      .execute_command("stop", vec![Argument::Int(axis as i64)])
      .map_err(|e| SupervisorError::device(e.to_string()))
  }

  pub fn calibrate(&mut self, front: &mut DeviceFront, axis: u8, position: f64) -> Result<(), SupervisorError> {
    if !Self::checklimits(front, axis, position) {
      return Err(SupervisorError::device("cannot calibrate outside soft limits"));
    }
    front
      .set_variable(format!("rampmode${axis}"), Value::Int(2))
      .map_err(|e| SupervisorError::device(e.to_string()))?;
    front
      .set_variable(format!("actualposition${axis}"), Value::Float(position))
      .map_err(|e| SupervisorError::device(e.to_string()))?;
    front
      .set_variable(format!("targetposition${axis}"), Value::Float(position))
      .map_err(|e| SupervisorError::device(e.to_string()))
  }

  /// Feed one drained [`FrontEvent`] through the coordinator. Clears the
  /// moving record once `actualspeed` for the moving axis reaches zero,
  /// matching the original's detection of move completion by watching the
  /// speed variable it explicitly refreshes after sending a move command.
  /// The busy semaphore itself is released on the Supervisor side, in
  /// `crate::protocol::motor::MotorAdapter::process_incoming`, when it
  /// decodes that same zero-speed reply — this only clears the coordinator's
  /// own local record of which axis holds it.
  pub fn observe_event(&mut self, _front: &DeviceFront, event: &FrontEvent) {
    let FrontEvent::VariableChange { name, value } = event else {
      return;
    };
    let Some(axis) = self.moving else {
      return;
    };
    if name != &format!("actualspeed${axis}") {
      return;
    }
    if value.as_float() == Some(0.0) {
      self.moving = None;
    }
  }

  /// Parses a `.motorpos` file's contents into one [`SavedPosition`] per
  /// line, matching `RE_FLOAT`/`TMCMcard._load_positions`'s line grammar.
  pub fn parse_positions(text: &str) -> Result<Vec<SavedPosition>, SupervisorError> {
    let re = position_line_regex();
    text
      .lines()
      .filter(|line| !line.trim().is_empty())
      .map(|line| {
        let captures = re
          .captures(line)
          .ok_or_else(|| SupervisorError::device(format!("invalid line in motor position file: {line}")))?;
        let axis: u8 = captures["axis"].parse().map_err(|_| SupervisorError::device(format!("invalid axis index in: {line}")))?;
        let position: f64 = captures["position"].parse().map_err(|_| SupervisorError::device(format!("invalid position in: {line}")))?;
        let softleft: f64 = captures["left"].parse().map_err(|_| SupervisorError::device(format!("invalid soft left in: {line}")))?;
        let softright: f64 = captures["right"].parse().map_err(|_| SupervisorError::device(format!("invalid soft right in: {line}")))?;
        Ok(SavedPosition { axis, position, softleft, softright })
      })
      .collect()
  }

  /// Loads a controller's position file, pushing soft limits into the
  /// front's state and calibrating any axis whose live position has
  /// drifted from the stored one by more than [`CALIBRATION_TOLERANCE_MM`].
  /// A missing file is not an error: the original treats it as "nothing to
  /// load" and marks positions loaded anyway.
  pub fn load_positions(&mut self, front: &mut DeviceFront, path: impl AsRef<Path>) -> Result<(), SupervisorError> {
    if self.moving.is_some() {
      return Err(SupervisorError::device("cannot load positions from file if a motor is moving"));
    }
    let path = path.as_ref();
    let text = match fs::read_to_string(path) {
      Ok(text) => text,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        self.positions_loaded = true;
        return Ok(());
      }
      Err(e) => return Err(SupervisorError::device(format!("failed to read {}: {e}", path.display()))),
    };
    for saved in Self::parse_positions(&text)? {
      front
        .set_variable(format!("softleft${}", saved.axis), Value::Float(saved.softleft))
        .map_err(|e| SupervisorError::device(e.to_string()))?;
      front
        .set_variable(format!("softright${}", saved.axis), Value::Float(saved.softright))
        .map_err(|e| SupervisorError::device(e.to_string()))?;
      if let Some(live) = actual_position(front, saved.axis) {
        if (live - saved.position).abs() > CALIBRATION_TOLERANCE_MM {
          self.calibrate(front, saved.axis, saved.position)?;
        }
      }
    }
    self.positions_loaded = true;
    Ok(())
  }

  /// Renders the current position and soft limits of every axis in the
  /// format `_load_positions` parses back, one line per axis. Returns
  /// `None` (writes nothing) if positions have not yet been loaded, so a
  /// fresh controller never overwrites a file it hasn't read yet.
  pub fn render_positions(&self, front: &DeviceFront, axis_count: u8) -> Option<String> {
    if !self.positions_loaded {
      return None;
    }
    let mut out = String::new();
    for axis in 0..axis_count {
      let position = actual_position(front, axis).unwrap_or(0.0);
      let (left, right) = soft_limits(front, axis).unwrap_or((0.0, 0.0));
      out.push_str(&format!("{axis}: {position} ({left}, {right})\n"));
    }
    Some(out)
  }

  pub fn save_positions(&self, front: &DeviceFront, axis_count: u8, path: impl AsRef<Path>) -> Result<(), SupervisorError> {
    let Some(text) = self.render_positions(front, axis_count) else {
      return Ok(());
    };
    fs::write(path.as_ref(), text).map_err(|e| SupervisorError::device(format!("failed to write {}: {e}", path.as_ref().display())))
  }
}

pub fn position_file_path(configdir: impl AsRef<Path>, instance_name: &str) -> PathBuf {
  configdir.as_ref().join(format!("{instance_name}.motorpos"))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::message::MessageKind;

  fn front_pair() -> (DeviceFront, crate::bus::BusSender, crate::bus::BusReceiver) {
    let (to_sup, from_front) = crate::bus::channel(8);
    let (to_front, from_sup) = crate::bus::channel(8);
    (DeviceFront::new("mot1", to_sup, from_sup), to_front, from_front)
  }

  fn deliver(front: &mut DeviceFront, to_front: &crate::bus::BusSender, name: &str, value: Value) {
    to_front
      .send(crate::message::Message::new(MessageKind::Update { name: name.into(), value }, 0, "mot1"))
      .unwrap();
    front.poll_events(std::time::Duration::from_millis(50));
  }

  fn ready_front() -> (DeviceFront, crate::bus::BusSender) {
    let (mut front, to_front, _from_front) = front_pair();
    deliver(&mut front, &to_front, "microstepresolution$0", Value::Int(6));
    deliver(&mut front, &to_front, "softleft$0", Value::Float(-50.0));
    deliver(&mut front, &to_front, "softright$0", Value::Float(50.0));
    deliver(&mut front, &to_front, "actualposition$0", Value::Float(0.0));
    (front, to_front)
  }

  #[test]
  fn moveto_outside_soft_limits_is_rejected_before_any_command_is_sent() {
    let (mut front, _to_front) = ready_front();
    let mut coordinator = MotorCoordinator::new();
    coordinator.positions_loaded = true;

    let result = coordinator.moveto(&mut front, 0, 1000.0);
    assert!(result.is_err());
    assert!(coordinator.moving_axis().is_none());
  }

  #[test]
  fn moveto_within_limits_records_the_moving_axis() {
    let (mut front, _to_front) = ready_front();
    let mut coordinator = MotorCoordinator::new();
    coordinator.positions_loaded = true;

    coordinator.moveto(&mut front, 0, 10.0).unwrap();
    assert_eq!(coordinator.moving_axis(), Some(0));
  }

  #[test]
  fn a_second_motor_cannot_start_moving_while_the_first_is_in_flight() {
    let (mut front, _to_front) = ready_front();
    let mut coordinator = MotorCoordinator::new();
    coordinator.positions_loaded = true;

    coordinator.moveto(&mut front, 0, 10.0).unwrap();
    let result = coordinator.moveto(&mut front, 1, 10.0);
    assert!(result.is_err());
    assert_eq!(coordinator.moving_axis(), Some(0));
  }

  /// Spec §4.6 move-arbitration step 2 ("check `_status == idle`; reject
  /// otherwise") applies even when the second request names the *same* axis
  /// already in flight, not just a different one.
  #[test]
  fn a_second_move_on_the_same_axis_is_rejected_while_the_first_is_in_flight() {
    let (mut front, _to_front) = ready_front();
    let mut coordinator = MotorCoordinator::new();
    coordinator.positions_loaded = true;

    coordinator.moveto(&mut front, 0, 10.0).unwrap();
    let result = coordinator.moveto(&mut front, 0, 20.0);
    assert!(result.is_err());
    assert_eq!(coordinator.moving_axis(), Some(0));
  }

  #[test]
  fn actualspeed_reaching_zero_clears_the_moving_record() {
    let (mut front, to_front) = ready_front();
    let mut coordinator = MotorCoordinator::new();
    coordinator.positions_loaded = true;
    coordinator.moveto(&mut front, 0, 10.0).unwrap();

    to_front
      .send(crate::message::Message::new(
        MessageKind::Update {
          name: "actualspeed$0".into(),
          value: Value::Float(0.0),
        },
        0,
        "mot1",
      ))
      .unwrap();
    for event in front.poll_events(std::time::Duration::from_millis(50)) {
      coordinator.observe_event(&front, &event);
    }
    assert!(coordinator.moving_axis().is_none());
  }

  #[test]
  fn moveto_before_positions_are_loaded_is_rejected() {
    let (mut front, _to_front) = ready_front();
    let mut coordinator = MotorCoordinator::new();
    let result = coordinator.moveto(&mut front, 0, 10.0);
    assert!(result.is_err());
  }

  #[test]
  fn parse_positions_reads_the_documented_line_grammar() {
    let text = "0: 12.5 (-50, 50)\n1: -3.25 (-10, 10)\n";
    let saved = MotorCoordinator::parse_positions(text).unwrap();
    assert_eq!(saved.len(), 2);
    assert_eq!(saved[0], SavedPosition { axis: 0, position: 12.5, softleft: -50.0, softright: 50.0 });
    assert_eq!(saved[1], SavedPosition { axis: 1, position: -3.25, softleft: -10.0, softright: 10.0 });
  }

  #[test]
  fn parse_positions_rejects_a_malformed_line() {
    let result = MotorCoordinator::parse_positions("not a valid line\n");
    assert!(result.is_err());
  }

  #[test]
  fn missing_position_file_marks_positions_loaded_without_erroring() {
    let (mut front, _to_front) = ready_front();
    let mut coordinator = MotorCoordinator::new();
    let result = coordinator.load_positions(&mut front, "/nonexistent/path/does-not-exist.motorpos");
    assert!(result.is_ok());
    assert!(coordinator.positions_loaded());
  }

  #[test]
  fn a_stored_position_far_from_the_live_one_triggers_calibration() {
    let (mut front, to_front, from_front) = front_pair();
    deliver(&mut front, &to_front, "actualposition$0", Value::Float(0.0));
    let mut coordinator = MotorCoordinator::new();

    let dir = std::env::temp_dir().join(format!("motorpos-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("mot1.motorpos");
    std::fs::write(&path, "0: 25.0 (-50, 50)\n").unwrap();

    coordinator.load_positions(&mut front, &path).unwrap();
    assert!(coordinator.positions_loaded());

    // calibrate() pushes rampmode=2, actualposition=25.0, targetposition=25.0
    // as Set requests over the bus, in that order.
    let mut saw_rampmode = false;
    let mut saw_actualposition = false;
    while let Ok(message) = from_front.try_recv() {
      if let MessageKind::Set { name, value } = message.kind {
        if name == "rampmode$0" && matches!(value, Value::Int(2)) {
          saw_rampmode = true;
        }
        if name == "actualposition$0" && matches!(value, Value::Float(v) if (v - 25.0).abs() < 1e-9) {
          saw_actualposition = true;
        }
      }
    }
    assert!(saw_rampmode);
    assert!(saw_actualposition);

    std::fs::remove_dir_all(&dir).ok();
  }
}
