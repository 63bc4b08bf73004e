//! Microfocus X-ray source (Xenocs GeniX), grounded on
//! `cct/core/devices/xray_source.py::GeniX_Backend`. Register-based; every
//! `query`/`execute` call talks straight through
//! [`crate::transport::register::RegisterTransport`] instead of going
//! through a send queue, since each Modbus/TCP transaction already is a
//! self-contained request/reply round trip.

use std::time::{Duration, Instant};

use crate::error::SupervisorError;
use crate::value::Value;

use super::{AdapterContext, Argument, FrameResult, ProtocolAdapter};

const INTERLOCK_FIXING_TIME: Duration = Duration::from_secs(3);

const REG_HT: u16 = 50;
const REG_CURRENT: u16 = 51;
const REG_TUBETIME_MINUTES: u16 = 55;
const REG_TUBETIME_HOURS: u16 = 56;

const COIL_STATUS_BASE: u16 = 210;
const COIL_STATUS_COUNT: u16 = 36;
const COIL_RESET_FAULTS: u16 = 249;
const COIL_POWEROFF: u16 = 244;
const COIL_START_WARMUP: u16 = 245;
const COIL_STOP_WARMUP: u16 = 246;
const COIL_SHUTTER_CLOSE: u16 = 247;
const COIL_SHUTTER_OPEN: u16 = 248;
const COIL_STANDBY: u16 = 250;
const COIL_XRAYS: u16 = 251;
const COIL_FULL_POWER: u16 = 252;

fn write_coil(ctx: &mut AdapterContext, register: &crate::transport::register::RegisterTransport, coil: u16, value: bool) {
  if let Err(e) = register.write_coil(coil, value) {
    ctx.push_error(SupervisorError::Communication { message: e.to_string() });
  }
}

fn pulse(ctx: &mut AdapterContext, register: &crate::transport::register::RegisterTransport, coil: u16) {
  write_coil(ctx, register, coil, true);
  write_coil(ctx, register, coil, false);
}

pub struct GenixAdapter {
  interlock_lowlevel: Option<bool>,
  interlock_change_at: Instant,
}

impl GenixAdapter {
  pub fn new() -> Self {
    GenixAdapter {
      interlock_lowlevel: None,
      interlock_change_at: Instant::now(),
    }
  }

  fn read_status_bits(&mut self, ctx: &mut AdapterContext) -> Result<(), SupervisorError> {
    let register = ctx.register.ok_or_else(|| {
      SupervisorError::device("GeniX adapter used without a register transport")
    })?;
    let bits = register
      .read_coils(COIL_STATUS_BASE, COIL_STATUS_COUNT)
      .map_err(|e| SupervisorError::Communication {
        message: e.to_string(),
      })?;
    let bit = |i: usize| bits.get(i).unwrap_or(false);

    ctx.push_update("remote_mode", bit(0), false);
    ctx.push_update("xrays", bit(1), false);
    if !bit(1) {
      ctx.push_update("_status", "X-rays off", false);
    }
    ctx.push_update("goingtostandby", bit(2), false);
    if bit(2) {
      ctx.push_update("_status", "Going to stand-by", false);
    }
    ctx.push_update("rampingup", bit(3), false);
    if bit(3) {
      ctx.push_update("_status", "Ramping up", false);
    }
    ctx.push_update("conditions_auto", bit(4), false);
    ctx.push_update("poweringdown", bit(5), false);
    if bit(5) {
      ctx.push_update("_status", "Powering down", false);
    }
    ctx.push_update("warmingup", bit(6), false);
    if bit(6) {
      ctx.push_update("_status", "Warming up", false);
    }
    ctx.push_update("tube_power", if bit(7) { 50i64 } else { 30i64 }, false);
    // bit 8 is unknown.
    ctx.push_update("faults", bit(9), false);
    ctx.push_update("xray_light_fault", bit(10), false);
    ctx.push_update("shutter_light_fault", bit(11), false);
    ctx.push_update("sensor2_fault", bit(12), false);
    ctx.push_update("tube_position_fault", bit(13), false);
    ctx.push_update("vacuum_fault", bit(14), false);
    ctx.push_update("waterflow_fault", bit(15), false);
    ctx.push_update("safety_shutter_fault", bit(16), false);
    ctx.push_update("temperature_fault", bit(17), false);
    ctx.push_update("sensor1_fault", bit(18), false);
    ctx.push_update("relay_interlock_fault", bit(19), false);
    ctx.push_update("door_fault", bit(20), false);
    ctx.push_update("filament_fault", bit(21), false);
    ctx.push_update("tube_warmup_needed", bit(22), false);
    // bit 23 is unknown, bit 24 is a 1 Hz heartbeat pulse.

    // bit 25: the interlock line. Constantly true means OK; constantly
    // false means broken; alternating at 1 Hz means the door circuit is
    // open. `interlock` only becomes true once the line has held steady for
    // `INTERLOCK_FIXING_TIME`.
    let lowlevel = bit(25);
    if self.interlock_lowlevel != Some(lowlevel) {
      self.interlock_lowlevel = Some(lowlevel);
      self.interlock_change_at = Instant::now();
    }
    ctx.push_update("interlock_lowlevel", lowlevel, false);
    if lowlevel {
      if self.interlock_change_at.elapsed() > INTERLOCK_FIXING_TIME {
        ctx.push_update("interlock", true, false);
      }
    } else {
      ctx.push_update("interlock", false, false);
    }

    if bit(26) && !bit(27) {
      ctx.push_update("shutter", false, false);
    } else if bit(27) && !bit(26) {
      ctx.push_update("shutter", true, false);
    }
    // bit 28 is unknown.
    ctx.push_update("overridden", bit(29), false);

    if bit(1) && !(bit(2) || bit(3) || bit(5) || bit(6)) {
      if let (Some(ht), Some(current)) = (ctx.state.value("ht").and_then(Value::as_float), ctx.state.value("current").and_then(Value::as_float)) {
        if ht == 0.0 && current == 0.0 {
          ctx.push_update("_status", "Power off", false);
        } else if let Some(power) = ctx.state.value("power").and_then(Value::as_float) {
          if power == 9.0 {
            ctx.push_update("_status", "Low power", false);
          } else if power == 30.0 {
            ctx.push_update("_status", "Full power", false);
          }
        }
      }
    }
    Ok(())
  }
}

impl Default for GenixAdapter {
  fn default() -> Self {
    Self::new()
  }
}

const STATUS_VARIABLES: &[&str] = &[
  "shutter",
  "remote_mode",
  "xrays",
  "conditions_auto",
  "tube_power",
  "faults",
  "xray_light_fault",
  "shutter_light_fault",
  "sensor2_fault",
  "tube_position_fault",
  "vacuum_fault",
  "waterflow_fault",
  "safety_shutter_fault",
  "temperature_fault",
  "sensor1_fault",
  "relay_interlock_fault",
  "door_fault",
  "filament_fault",
  "tube_warmup_needed",
  "interlock",
  "overridden",
  "_status",
  "warmingup",
  "goingtostandby",
  "rampingup",
  "poweringdown",
];

impl ProtocolAdapter for GenixAdapter {
  fn frame(&self, _buffer: &[u8]) -> FrameResult {
    // No stream traffic; Transport is register-based.
    FrameResult {
      frames: Vec::new(),
      consumed: 0,
    }
  }

  fn query(&mut self, name: &str, ctx: &mut AdapterContext) -> bool {
    let register = match ctx.register {
      Some(r) => r,
      None => {
        ctx.push_error(SupervisorError::device("GeniX adapter used without a register transport"));
        return false;
      }
    };
    match name {
      "power" => {
        let (ht, current) = (
          ctx.state.value("ht").and_then(Value::as_float),
          ctx.state.value("current").and_then(Value::as_float),
        );
        match (ht, current) {
          (Some(ht), Some(current)) => {
            ctx.push_update("power", ht * current, false);
            true
          }
          _ => false,
        }
      }
      "ht" => match register.read_register(REG_HT) {
        Ok(raw) => {
          let ht = raw as f64 / 100.0;
          ctx.push_update("ht", ht, false);
          if let Some(current) = ctx.state.value("current").and_then(Value::as_float) {
            ctx.push_update("_auxstatus", format!("{ht:.2} kV, {current:.2} mA"), false);
          }
          true
        }
        Err(e) => {
          ctx.push_error(SupervisorError::Communication { message: e.to_string() });
          false
        }
      },
      "current" => match register.read_register(REG_CURRENT) {
        Ok(raw) => {
          let current = raw as f64 / 100.0;
          ctx.push_update("current", current, false);
          if let Some(ht) = ctx.state.value("ht").and_then(Value::as_float) {
            ctx.push_update("_auxstatus", format!("{ht:.2} kV, {current:.2} mA"), false);
          }
          true
        }
        Err(e) => {
          ctx.push_error(SupervisorError::Communication { message: e.to_string() });
          false
        }
      },
      "tubetime" => {
        let minutes = register.read_register(REG_TUBETIME_MINUTES);
        let hours = register.read_register(REG_TUBETIME_HOURS);
        match (minutes, hours) {
          (Ok(m), Ok(h)) => {
            ctx.push_update("tubetime", m as f64 / 60.0 + h as f64, false);
            true
          }
          (Err(e), _) | (_, Err(e)) => {
            ctx.push_error(SupervisorError::Communication { message: e.to_string() });
            false
          }
        }
      }
      n if STATUS_VARIABLES.contains(&n) => match self.read_status_bits(ctx) {
        Ok(()) => true,
        Err(e) => {
          ctx.push_error(e);
          false
        }
      },
      _ => {
        ctx.push_error(SupervisorError::UnknownVariable {
          variable: name.to_string(),
        });
        false
      }
    }
  }

  fn set(&mut self, name: &str, _value: &Value, ctx: &mut AdapterContext) {
    ctx.push_error(SupervisorError::ReadOnlyVariable {
      variable: name.to_string(),
    });
  }

  fn execute(&mut self, name: &str, arguments: &[Argument], ctx: &mut AdapterContext) {
    let register = match ctx.register {
      Some(r) => r,
      None => {
        ctx.push_error(SupervisorError::device("GeniX adapter used without a register transport"));
        return;
      }
    };
    match name {
      "shutter" => {
        let open = matches!(arguments.first(), Some(Argument::Bool(b)) if *b);
        let coil = if open { COIL_SHUTTER_OPEN } else { COIL_SHUTTER_CLOSE };
        pulse(ctx, register, coil);
        ctx.outstanding.clear_one("shutter");
      }
      "poweroff" => {
        write_coil(ctx, register, COIL_STANDBY, false);
        pulse(ctx, register, COIL_POWEROFF);
        ctx.outstanding.clear_one("_status");
      }
      "xrays" => {
        let on = matches!(arguments.first(), Some(Argument::Bool(b)) if *b);
        write_coil(ctx, register, COIL_XRAYS, on);
        ctx.outstanding.clear_one("xrays");
      }
      "reset_faults" => {
        pulse(ctx, register, COIL_RESET_FAULTS);
        ctx.outstanding.clear_one("faults");
      }
      "start_warmup" => {
        write_coil(ctx, register, COIL_STANDBY, false);
        pulse(ctx, register, COIL_START_WARMUP);
        ctx.outstanding.clear_one("_status");
      }
      "stop_warmup" => {
        write_coil(ctx, register, COIL_STANDBY, false);
        pulse(ctx, register, COIL_STOP_WARMUP);
        ctx.outstanding.clear_one("_status");
      }
      "standby" => {
        write_coil(ctx, register, COIL_STANDBY, true);
        ctx.outstanding.clear_one("_status");
      }
      "full_power" => {
        write_coil(ctx, register, COIL_STANDBY, false);
        pulse(ctx, register, COIL_FULL_POWER);
        ctx.outstanding.clear_one("_status");
      }
      _ => ctx.push_error(SupervisorError::UnknownCommand {
        command: name.to_string(),
      }),
    }
  }

  fn process_incoming(&mut self, _frame: &[u8], _original_sent: Option<&[u8]>, ctx: &mut AdapterContext) {
    ctx.push_error(SupervisorError::InvalidMessage {
      message: "GeniX communicates synchronously through registers; no incoming frame is expected".into(),
    });
  }

  fn initialize_after_connect(&mut self, ctx: &mut AdapterContext) {
    if let Err(e) = self.read_status_bits(ctx) {
      ctx.push_error(e);
    }
  }
}
