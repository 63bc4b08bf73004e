//! Pressure gauge (Pfeiffer/Balzers TPG201), grounded on
//! `cct/core/devices/vacuumgauge.py::TPG201`. Fixed-prefix ASCII protocol
//! terminated by `\r`, with a mod-64 checksum over every byte but the last.

use std::time::Duration;

use crate::error::SupervisorError;
use crate::value::Value;

use super::{AdapterContext, Argument, FrameResult, ProtocolAdapter};

const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Tpg201Adapter;

impl Tpg201Adapter {
  pub fn new() -> Self {
    Tpg201Adapter
  }

  fn send(&self, ctx: &mut AdapterContext, command: &'static [u8]) {
    ctx.push_send(command.to_vec(), 1, REPLY_TIMEOUT, false);
  }
}

impl Default for Tpg201Adapter {
  fn default() -> Self {
    Self::new()
  }
}

impl ProtocolAdapter for Tpg201Adapter {
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
    match name {
      "pressure" => self.send(ctx, b"001M^\r"),
      "version" => self.send(ctx, b"001Te\r"),
      "units" => self.send(ctx, b"001Uf\r"),
      _ => {
        ctx.push_error(SupervisorError::UnknownVariable {
          variable: name.to_string(),
        });
        return false;
      }
    }
    true
  }

  fn set(&mut self, name: &str, _value: &Value, ctx: &mut AdapterContext) {
    ctx.push_error(SupervisorError::ReadOnlyVariable {
      variable: name.to_string(),
    });
  }

  fn execute(&mut self, name: &str, _arguments: &[Argument], ctx: &mut AdapterContext) {
    ctx.push_error(SupervisorError::UnknownCommand {
      command: name.to_string(),
    });
  }

  fn process_incoming(&mut self, frame: &[u8], _original_sent: Option<&[u8]>, ctx: &mut AdapterContext) {
    if !(frame.starts_with(b"001") && frame.ends_with(b"\r")) {
      ctx.push_error(SupervisorError::InvalidMessage {
        message: format!("invalid vacuum gauge message: {:?}", String::from_utf8_lossy(frame)),
      });
      return;
    }
    let message = &frame[..frame.len() - 1];
    let checksum = message[..message.len() - 1].iter().map(|&b| b as u32).sum::<u32>() % 64 + 64;
    if checksum != message[message.len() - 1] as u32 {
      ctx.push_error(SupervisorError::InvalidMessage {
        message: format!("checksum error on vacuum gauge message {:?}", String::from_utf8_lossy(message)),
      });
      return;
    }
    match message[3] {
      b'M' => {
        let mantissa: f64 = std::str::from_utf8(&message[4..8]).unwrap_or("0").parse().unwrap_or(0.0);
        let exponent: f64 = std::str::from_utf8(&message[8..10]).unwrap_or("0").parse().unwrap_or(0.0);
        let pressure = mantissa * 10f64.powf(-23.0 + exponent);
        ctx.push_update("pressure", pressure, false);
        let status = if pressure > 1.0 {
          "No vacuum"
        } else if pressure > 0.1 {
          "Medium vacuum"
        } else {
          "Vacuum OK"
        };
        ctx.push_update("_status", status, false);
        ctx.push_update("_auxstatus", format!("{pressure:.2} mbar"), false);
      }
      b'T' => {
        let version = String::from_utf8_lossy(&message[4..10]).to_string();
        ctx.push_update("version", version, false);
      }
      b'U' => {
        let units = String::from_utf8_lossy(&message[4..10]).to_string();
        ctx.push_update("units", units, false);
      }
      other => {
        ctx.push_error(SupervisorError::InvalidMessage {
          message: format!("unknown message code {} in {:?}", other as char, String::from_utf8_lossy(message)),
        });
      }
    }
  }

  fn initialize_after_connect(&mut self, ctx: &mut AdapterContext) {
    self.send(ctx, b"001Te\r");
    self.send(ctx, b"001Uf\r");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::device::{BusySemaphore, OutstandingQueries, RefreshCounters, StateTable};
  use crate::watchdog::Watchdog;

  fn context(
    state: &mut StateTable,
    outstanding: &mut OutstandingQueries,
    refresh: &mut RefreshCounters,
    busy: &BusySemaphore,
    watchdog: &mut Watchdog,
  ) -> AdapterContext<'_> {
    AdapterContext {
      state,
      outstanding,
      refresh,
      busy,
      watchdog,
      register: None,
      outbound: Vec::new(),
    }
  }

  #[test]
  fn decodes_pressure_reading() {
    let mut state = StateTable::new();
    let mut outstanding = OutstandingQueries::new();
    let mut refresh = RefreshCounters::new();
    let busy = BusySemaphore::new(1);
    let mut watchdog = Watchdog::new(Duration::from_secs(10));
    let mut ctx = context(&mut state, &mut outstanding, &mut refresh, &busy, &mut watchdog);

    let mut adapter = Tpg201Adapter::new();
    let payload = b"001M1234-2";
    let checksum = (payload.iter().map(|&b| b as u32).sum::<u32>() % 64 + 64) as u8;
    let mut frame = payload.to_vec();
    frame.push(checksum);
    frame.push(b'\r');

    adapter.process_incoming(&frame, None, &mut ctx);
    let pressure_update = ctx.outbound.iter().any(|effect| {
      matches!(effect, super::super::OutboundEffect::Update { name, .. } if name == "pressure")
    });
    assert!(pressure_update);
  }
}
