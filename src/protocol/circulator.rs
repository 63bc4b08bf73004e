//! Thermostatted-bath circulator (Thermo Haake Phoenix), grounded on
//! `cct/core/devices/circulator.py::HaakePhoenix`. Line-ASCII protocol,
//! terminated by `\r`; data replies additionally carry a `$` just before
//! the terminator, stripped off once a complete frame is confirmed.
//!
//! The original keeps a private one-message send queue and a `_lastsent`
//! slot to force strictly sequential request/reply traffic on top of a
//! generic Transport that otherwise allows pipelining. Here that constraint
//! already falls out of how every query is sent with `expected_replies: 1`
//! and `asynchronous: false` — [`super::super::transport::stream::StreamTransport`]
//! never has more than one request outstanding in that case, so the private
//! queue does not need to be reimplemented.

use std::time::Duration;

use crate::error::SupervisorError;
use crate::value::Value;

use super::{AdapterContext, Argument, FrameResult, ProtocolAdapter};

pub const ALL_VARIABLES: &[&str] = &[
  "firmwareversion",
  "faultstatus",
  "fuzzycontrol",
  "fuzzystatus",
  "temperature_internal",
  "temperature_external",
  "setpoint",
  "highlimit",
  "lowlimit",
  "diffcontrol_on",
  "autostart",
  "fuzzyid",
  "beep",
  "time",
  "date",
  "watchdog_on",
  "watchdog_setpoint",
  "cooling_on",
  "pump_power",
];

pub const URGENT_VARIABLES: &[&str] = &[
  "faultstatus",
  "time",
  "temperature_internal",
  "temperature_external",
];

const REPLY_TIMEOUT: Duration = Duration::from_secs(1);

pub struct HaakePhoenixAdapter {
  stash: Vec<u8>,
}

impl HaakePhoenixAdapter {
  pub fn new() -> Self {
    HaakePhoenixAdapter { stash: Vec::new() }
  }

  fn send(&self, ctx: &mut AdapterContext, command: impl Into<Vec<u8>>) {
    ctx.push_send(command.into(), 1, REPLY_TIMEOUT, false);
  }
}

impl Default for HaakePhoenixAdapter {
  fn default() -> Self {
    Self::new()
  }
}

impl ProtocolAdapter for HaakePhoenixAdapter {
  fn frame(&self, buffer: &[u8]) -> FrameResult {
    let mut frames = Vec::new();
    let mut consumed = 0;
    while let Some(idx) = buffer[consumed..].iter().position(|&b| b == b'\r') {
      frames.push(buffer[consumed..consumed + idx + 1].to_vec());
      consumed += idx + 1;
    }
    FrameResult { frames, consumed }
  }

  fn query(&mut self, name: &str, ctx: &mut AdapterContext) -> bool {
    let command: &[u8] = match name {
      "firmwareversion" => b"R V1\r",
      "faultstatus" => b"R BS\r",
      "fuzzycontrol" => b"R FB\r",
      "fuzzystatus" => b"R FE\r",
      "temperature_internal" => b"R T1\r",
      "temperature_external" => b"R T3\r",
      "setpoint" => b"R SW\r",
      "highlimit" => b"R HL\r",
      "lowlimit" => b"R LL\r",
      "control_on" => b"IN MODE 5\r",
      "control_external" => b"IN MODE 2\r",
      "diffcontrol_on" => b"R FR\r",
      "autostart" => b"R ZA\r",
      "fuzzyid" => b"R ZI\r",
      "beep" => b"R ZB\r",
      "time" => b"R XT\r",
      "date" => b"R XD\r",
      "watchdog_on" => b"R WD\r",
      "watchdog_setpoint" => b"R WS\r",
      "cooling_on" => b"R CC\r",
      "pump_power" => b"R PF\r",
      _ => {
        ctx.push_error(SupervisorError::UnknownVariable {
          variable: name.to_string(),
        });
        return false;
      }
    };
    self.send(ctx, command.to_vec());
    true
  }

  fn set(&mut self, name: &str, value: &Value, ctx: &mut AdapterContext) {
    let command: Vec<u8> = match (name, value) {
      ("setpoint", Value::Float(v)) => format!("W SW {v:.2}\r").into_bytes(),
      ("highlimit", Value::Float(v)) => format!("W HL {v:.2}\r").into_bytes(),
      ("lowlimit", Value::Float(v)) => format!("W LL {v:.2}\r").into_bytes(),
      ("control_external", Value::Bool(v)) => format!("OUT MODE 2 {}\r", *v as i32).into_bytes(),
      ("diffcontrol_on", Value::Bool(v)) => format!("W FR {}\r", *v as i32).into_bytes(),
      ("autostart", Value::Bool(v)) => format!("W ZA {}\r", *v as i32).into_bytes(),
      ("fuzzyid", Value::Bool(v)) => format!("W ZI {}\r", *v as i32).into_bytes(),
      ("beep", Value::Bool(v)) => format!("W ZB {}\r", *v as i32).into_bytes(),
      ("date", Value::Date(d)) => {
        format!("W XD {:02}.{:02}.{:02}\r", d.format("%d"), d.format("%m"), d.format("%y")).into_bytes()
      }
      ("time", Value::Time(t)) => {
        format!("W XT {:02}:{:02}:{:02}\r", t.format("%H"), t.format("%M"), t.format("%S")).into_bytes()
      }
      ("watchdog_on", Value::Bool(v)) => format!("W WD {}\r", *v as i32).into_bytes(),
      ("watchdog_setpoint", Value::Float(v)) => format!("W WS {v:6.2}\r").into_bytes(),
      ("cooling_on", Value::Bool(v)) => format!("W CC {}\r", *v as i32).into_bytes(),
      ("pump_power", Value::Float(v)) => {
        if !(5.0..=100.0).contains(v) {
          ctx.push_error(SupervisorError::InvalidValue {
            variable: name.to_string(),
            message: "pump_power must be between 5 and 100".into(),
          });
          return;
        }
        format!("W PF {v:5.2}\r").into_bytes()
      }
      (_, _) if ALL_VARIABLES.contains(&name) => {
        ctx.push_error(SupervisorError::ReadOnlyVariable {
          variable: name.to_string(),
        });
        return;
      }
      _ => {
        ctx.push_error(SupervisorError::UnknownVariable {
          variable: name.to_string(),
        });
        return;
      }
    };
    self.send(ctx, command);
    ctx.outstanding.clear_one(name);
  }

  fn execute(&mut self, name: &str, _arguments: &[Argument], ctx: &mut AdapterContext) {
    let command: &[u8] = match name {
      "start" => b"W TS 1\r",
      "stop" => b"W TS 0\r",
      "alarm" => b"W AL\r",
      "alarm_confirm" => b"W EG\r",
      _ => {
        ctx.push_error(SupervisorError::UnknownCommand {
          command: name.to_string(),
        });
        return;
      }
    };
    self.send(ctx, command.to_vec());
  }

  fn process_incoming(&mut self, frame: &[u8], original_sent: Option<&[u8]>, ctx: &mut AdapterContext) {
    let mut message = std::mem::take(&mut self.stash);
    message.extend_from_slice(frame);

    let last_sent = match original_sent {
      Some(bytes) => bytes,
      None => {
        log::debug!("no outstanding request for reply: {:?}", String::from_utf8_lossy(&message));
        return;
      }
    };

    if message == b"F001\r" {
      log::debug!(
        "unknown command reported by circulator, last sent {:?}",
        String::from_utf8_lossy(last_sent)
      );
      return;
    }
    if message == b"F123\r" {
      ctx.push_error(SupervisorError::device("error 123 reported by circulator"));
      return;
    }
    if message == b"FE00\r" {
      // The firmware occasionally drops the '$' from this particular
      // reply; treat it exactly as if it had been present.
      message = b"FE00$\r".to_vec();
    }
    if !message.ends_with(b"$\r") {
      log::warn!("malformed circulator message: {:?}", String::from_utf8_lossy(&message));
      self.stash = message;
      return;
    }
    message.pop(); // strip trailing '\r'

    if last_sent == b"R V1\r" {
      let text = String::from_utf8_lossy(&message[..message.len() - 1]).to_string();
      ctx.push_update("firmwareversion", text, false);
    } else if let Some(rest) = message.strip_prefix(b"BS") {
      let digits = std::str::from_utf8(&rest[..rest.len() - 1]).unwrap_or("0");
      let flags = u32::from_str_radix(digits, 2).unwrap_or(0);
      ctx.push_update("external_pt100_error", flags & 0b1 != 0, false);
      ctx.push_update("internal_pt100_error", flags & 0b10 != 0, false);
      ctx.push_update("liquid_level_low_error", flags & 0b100 != 0, false);
      ctx.push_update("cooling_error", flags & 0b10000 != 0, false);
      ctx.push_update("external_alarm_error", flags & 0b100000 != 0, false);
      ctx.push_update("pump_overload_error", flags & 0b1000000 != 0, false);
      ctx.push_update("liquid_level_alarm_error", flags & 0b10000000 != 0, false);
      ctx.push_update("overtemperature_error", flags & 0b100000000 != 0, false);
      ctx.push_update("main_relay_missing_error", flags & 0b1000000000 != 0, false);
      ctx.push_update("control_external", flags & 0b10000000000 != 0, false);
      ctx.push_update("control_on", flags & 0b100000000000 != 0, false);
      ctx.push_update("faultstatus", flags as i64, false);
    } else if let Some(rest) = message.strip_prefix(b"FB") {
      let text = String::from_utf8_lossy(&rest[..rest.len() - 1]).to_string();
      ctx.push_update("fuzzycontrol", text, false);
    } else if let Some(rest) = message.strip_prefix(b"FE") {
      let text = std::str::from_utf8(&rest[..rest.len() - 1]).unwrap_or("0");
      ctx.push_update("fuzzystatus", text.parse::<i64>().unwrap_or(0), false);
    } else if let Some(rest) = message.strip_prefix(b"T1") {
      ctx.push_update("temperature_internal", parse_f64(rest), false);
    } else if let Some(rest) = message.strip_prefix(b"T3") {
      ctx.push_update("temperature_external", parse_f64(rest), false);
    } else if let Some(rest) = message.strip_prefix(b"SW") {
      ctx.push_update("setpoint", parse_f64(rest), false);
    } else if let Some(rest) = message.strip_prefix(b"HL") {
      ctx.push_update("highlimit", parse_f64(rest), false);
    } else if let Some(rest) = message.strip_prefix(b"LL") {
      ctx.push_update("lowlimit", parse_f64(rest), false);
    } else if last_sent == b"IN MODE 5\r" {
      if message.len() == 2 {
        ctx.push_update("control_on", message[0] != b'0', false);
      } else {
        log::debug!("invalid message for control_on: {:?}", String::from_utf8_lossy(&message));
      }
    } else if last_sent == b"IN MODE 2\r" {
      if message.len() == 2 {
        ctx.push_update("control_external", message[0] != b'0', false);
      } else {
        log::debug!("invalid message for control_external: {:?}", String::from_utf8_lossy(&message));
      }
    } else if let Some(rest) = message.strip_prefix(b"FR") {
      ctx.push_update("diffcontrol_on", rest[0] != b'0', false);
    } else if let Some(rest) = message.strip_prefix(b"ZA") {
      ctx.push_update("autostart", rest[0] != b'0', false);
    } else if let Some(rest) = message.strip_prefix(b"ZI") {
      ctx.push_update("fuzzyid", rest[0] != b'0', false);
    } else if let Some(rest) = message.strip_prefix(b"ZB") {
      ctx.push_update("beep", rest[0] != b'0', false);
    } else if let Some(rest) = message.strip_prefix(b"XT") {
      let text = String::from_utf8_lossy(&rest[..rest.len() - 1]);
      let parts: Vec<i64> = text.split(':').filter_map(|p| p.parse().ok()).collect();
      if let [h, m, s] = parts[..] {
        if let Some(time) = chrono::NaiveTime::from_hms_opt(h as u32, m as u32, s as u32) {
          ctx.push_update("time", Value::Time(time), false);
        } else {
          ctx.push_update("time", Value::Time(chrono::NaiveTime::from_hms_opt(0, 0, 0).unwrap()), false);
        }
      }
    } else if let Some(rest) = message.strip_prefix(b"XD") {
      let text = String::from_utf8_lossy(&rest[..rest.len() - 1]);
      let parts: Vec<i32> = text.split('.').filter_map(|p| p.parse().ok()).collect();
      if let [day, month, year] = parts[..] {
        let date = chrono::NaiveDate::from_ymd_opt(year + 2000, month as u32, day as u32)
          .unwrap_or_else(|| chrono::NaiveDate::from_ymd_opt(1900, 1, 1).unwrap());
        ctx.push_update("date", Value::Date(date), false);
      }
    } else if let Some(rest) = message.strip_prefix(b"WD") {
      ctx.push_update("watchdog_on", rest[0] != b'0', false);
    } else if let Some(rest) = message.strip_prefix(b"WS") {
      ctx.push_update("watchdog_setpoint", parse_f64(rest), false);
    } else if let Some(rest) = message.strip_prefix(b"CC") {
      ctx.push_update("cooling_on", rest[0] != b'0', false);
    } else if let Some(rest) = message.strip_prefix(b"PF") {
      let power = parse_f64(rest);
      ctx.push_update("pump_power", power, false);
      ctx.push_update(
        "_status",
        if power > 0.0 { "running" } else { "stopped" },
        false,
      );
    } else if message == b"$" {
      log::debug!("confirmation for message {:?} received", String::from_utf8_lossy(last_sent));
    } else {
      log::debug!("unknown circulator message: {:?}", String::from_utf8_lossy(&message));
    }
  }

  fn initialize_after_connect(&mut self, ctx: &mut AdapterContext) {
    for name in URGENT_VARIABLES {
      self.query(name, ctx);
    }
  }
}

fn parse_f64(bytes_with_trailing_terminator: &[u8]) -> f64 {
  let text = std::str::from_utf8(&bytes_with_trailing_terminator[..bytes_with_trailing_terminator.len() - 1])
    .unwrap_or("0");
  text.parse().unwrap_or(0.0)
}
