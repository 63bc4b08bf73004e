//! DATAQ DI-149 USB data-acquisition unit, grounded on
//! `cct/core/devices/dataq.py::DATAQ_DI_149_Backend`. A mixed protocol: an
//! ASCII command/echo channel while idle, a fixed 22-byte little-endian
//! binary scan-point stream once scanning. The two framings are handled by
//! [`crate::transport::ModeSwitchingFramer`] sharing the same `scanning`
//! flag this adapter flips; this module only ever sees one already-framed
//! line or scan point per call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;

use crate::error::SupervisorError;
use crate::value::Value;

use super::{AdapterContext, Argument, FrameResult, ProtocolAdapter};

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const SAMPLES_PER_MIN: u32 = 50;

/// Sample-rate range in Hz, and the divisor code the `slist` rate-counter
/// command needs for it.
const RATE_RANGES: &[(f64, u8)] = &[
  (10000.0, 1),
  (5000.0, 2),
  (2000.0, 3),
  (1000.0, 4),
  (500.0, 5),
  (200.0, 6),
  (100.0, 7),
  (50.0, 8),
  (20.0, 9),
  (10.0, 10),
  (5.0, 11),
];

static INFO_RE: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^info (?P<num>\d+) (?P<info>[\d\w]+)\r?$").unwrap());
static SLIST_RE: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^slist (?P<num>\d+) (?P<listitem>x[0-9a-f]{4})\r?$").unwrap());
static SRATE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^srate (?P<rate>\d+)\r?$").unwrap());
static RESET_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^reset \d+\r?$").unwrap());

fn unpack_number(bytes: &[u8]) -> i32 {
  let mut value = ((((bytes[1] ^ 128) >> 1) as i32) << 5) + (bytes[0] >> 3) as i32;
  if value & (1 << 11) != 0 {
    value -= 1 << 12;
  }
  value
}

fn unpack_rate_and_counter(bytes: &[u8]) -> i32 {
  (((bytes[1] >> 1) as i32) << 7) + (bytes[0] >> 1) as i32
}

fn rate_divisor(rate_range: f64) -> u8 {
  RATE_RANGES
    .iter()
    .find(|(rate, _)| *rate == rate_range)
    .map(|(_, divisor)| *divisor)
    .unwrap_or(1)
}

/// One acquired scan point: 8 analog channels, decoded but not published
/// as state variables (there is no single-variable home for a vector
/// reading); callers interested in the raw waveform drain
/// [`DataqAdapter::take_scan_points`].
pub struct ScanPoint {
  pub channels: [i32; 8],
}

pub struct DataqAdapter {
  scanning: Arc<AtomicBool>,
  rate_range: f64,
  scan_points: Vec<ScanPoint>,
}

impl DataqAdapter {
  pub fn new(scanning: Arc<AtomicBool>) -> Self {
    DataqAdapter {
      scanning,
      rate_range: 10000.0,
      scan_points: Vec::new(),
    }
  }

  /// Drain all scan points accumulated since the last call.
  pub fn take_scan_points(&mut self) -> Vec<ScanPoint> {
    std::mem::take(&mut self.scan_points)
  }

  fn send_line(&self, ctx: &mut AdapterContext, line: &[u8], expected_replies: u32) {
    ctx.push_send(line.to_vec(), expected_replies, REPLY_TIMEOUT, false);
  }

  fn decode_scan_point(&mut self, frame: &[u8], ctx: &mut AdapterContext) {
    if frame[0] & 1 != 0 {
      ctx.push_error(SupervisorError::InvalidMessage {
        message: "scan-point frame has its sync bit set on the first byte".into(),
      });
      return;
    }
    let mut channels = [0i32; 8];
    for (i, channel) in channels.iter_mut().enumerate() {
      *channel = unpack_number(&frame[2 * i..2 * i + 2]);
    }
    let rate_raw = unpack_rate_and_counter(&frame[18..20]);
    let counter = unpack_rate_and_counter(&frame[20..22]);
    ctx.push_update("rate_raw", rate_raw as i64, false);
    ctx.push_update("rate", self.rate_range * rate_raw as f64 / 16384.0, false);
    ctx.push_update("counter", counter as i64, false);
    self.scan_points.push(ScanPoint { channels });
  }
}

impl ProtocolAdapter for DataqAdapter {
  fn frame(&self, _buffer: &[u8]) -> FrameResult {
    // Framing is owned by ModeSwitchingFramer on the Transport thread.
    FrameResult {
      frames: Vec::new(),
      consumed: 0,
    }
  }

  fn query(&mut self, name: &str, ctx: &mut AdapterContext) -> bool {
    if let Some(rest) = name.strip_prefix("info_") {
      let Ok(idx) = rest.parse::<u32>() else {
        ctx.push_error(SupervisorError::UnknownVariable {
          variable: name.to_string(),
        });
        return false;
      };
      self.send_line(ctx, format!("info {idx}\r").as_bytes(), 1);
      return true;
    }
    match name {
      "comm_mode" | "scan_rate_raw" | "rate" | "rate_raw" | "counter" => true,
      n if n.starts_with("slist_") => true,
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

  fn execute(&mut self, name: &str, _arguments: &[Argument], ctx: &mut AdapterContext) {
    match name {
      "start_scan" => {
        if !ctx.busy.try_acquire() {
          ctx.push_error(SupervisorError::device("cannot start scan: already scanning"));
          return;
        }
        self.scan_points.clear();
        self.scanning.store(true, Ordering::Release);
        ctx.push_send(b"start\r".to_vec(), 0, REPLY_TIMEOUT, true);
      }
      "stop_scan" => {
        self.send_line(ctx, b"stop\r", 1);
      }
      _ => ctx.push_error(SupervisorError::UnknownCommand {
        command: name.to_string(),
      }),
    }
  }

  fn process_incoming(&mut self, frame: &[u8], _original_sent: Option<&[u8]>, ctx: &mut AdapterContext) {
    if self.scanning.load(Ordering::Acquire) {
      if frame == b"stop\r" {
        self.scanning.store(false, Ordering::Release);
        ctx.busy.release();
        return;
      }
      if frame.len() != 22 {
        ctx.push_error(SupervisorError::InvalidMessage {
          message: format!("scan-point frame must be 22 bytes, got {}", frame.len()),
        });
        return;
      }
      self.decode_scan_point(frame, ctx);
      return;
    }

    let text = String::from_utf8_lossy(frame).to_string();

    if let Some(caps) = INFO_RE.captures(&text) {
      ctx.push_update(format!("info_{}", &caps["num"]), caps["info"].to_string(), false);
    } else if text == "stop\r" {
      ctx.busy.release();
    } else if text == "start\r" {
      // Acknowledgement of a start that has already flipped `scanning` at
      // execute() time; nothing further to do.
    } else if let Some(caps) = SLIST_RE.captures(&text) {
      ctx.push_update(format!("slist_{}", &caps["num"]), caps["listitem"].to_string(), false);
    } else if text == "asc\r" {
      ctx.push_update("comm_mode", "asc", false);
    } else if text == "bin\r" {
      ctx.push_update("comm_mode", "bin", false);
    } else if RESET_RE.is_match(&text) {
      // acknowledgement only, nothing to update.
    } else if let Some(caps) = SRATE_RE.captures(&text) {
      if let Ok(rate) = caps["rate"].parse::<i64>() {
        ctx.push_update("scan_rate_raw", rate, false);
      }
    } else {
      ctx.push_error(SupervisorError::InvalidMessage {
        message: format!("unrecognized DATAQ message: {text:?}"),
      });
    }
  }

  fn initialize_after_connect(&mut self, ctx: &mut AdapterContext) {
    self.send_line(ctx, b"stop\rasc\rreset 1\rslist 0 xffff\rbin\r", 5);

    let divisor = rate_divisor(self.rate_range);
    let mut commands: Vec<String> = vec!["asc".to_string()];
    for i in 0..9 {
      commands.push(format!("slist {i} x{i:04x}"));
    }
    commands.push(format!("slist 9 x0{divisor:x}095"));
    commands.push("slist 10 x000a".to_string());

    let srate = 75_000 / SAMPLES_PER_MIN;
    if !(75..=65535).contains(&srate) {
      ctx.push_error(SupervisorError::device(format!(
        "sample rate out of range: srate={srate}"
      )));
      return;
    }
    commands.push(format!("srate {srate}"));
    commands.push("bin".to_string());

    let joined = commands.join("\r");
    let expected = commands.len() as u32;
    self.send_line(ctx, joined.as_bytes(), expected);
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
  fn decodes_info_reply() {
    let mut state = StateTable::new();
    let mut outstanding = OutstandingQueries::new();
    let mut refresh = RefreshCounters::new();
    let busy = BusySemaphore::new(1);
    let mut watchdog = Watchdog::new(Duration::from_secs(10));
    let mut ctx = context(&mut state, &mut outstanding, &mut refresh, &busy, &mut watchdog);

    let mut adapter = DataqAdapter::new(Arc::new(AtomicBool::new(false)));
    adapter.process_incoming(b"info 0 1234abcd\r", None, &mut ctx);
    let got = ctx.outbound.iter().any(|e| {
      matches!(e, super::super::OutboundEffect::Update { name, value, .. } if name == "info_0" && matches!(value, Value::Str(s) if s == "1234abcd"))
    });
    assert!(got);
  }

  #[test]
  fn rejects_scan_point_with_sync_bit_set() {
    let mut state = StateTable::new();
    let mut outstanding = OutstandingQueries::new();
    let mut refresh = RefreshCounters::new();
    let busy = BusySemaphore::new(1);
    let mut watchdog = Watchdog::new(Duration::from_secs(10));
    let mut ctx = context(&mut state, &mut outstanding, &mut refresh, &busy, &mut watchdog);

    let scanning = Arc::new(AtomicBool::new(true));
    let mut adapter = DataqAdapter::new(scanning);
    let mut frame = vec![0u8; 22];
    frame[0] = 1; // sync bit set: invalid
    adapter.process_incoming(&frame, None, &mut ctx);
    assert!(ctx.outbound.iter().any(|e| matches!(e, super::super::OutboundEffect::Error(_))));
  }

  #[test]
  fn stop_echo_while_scanning_clears_scanning_flag() {
    let mut state = StateTable::new();
    let mut outstanding = OutstandingQueries::new();
    let mut refresh = RefreshCounters::new();
    let busy = BusySemaphore::new(1);
    busy.try_acquire();
    let mut watchdog = Watchdog::new(Duration::from_secs(10));
    let mut ctx = context(&mut state, &mut outstanding, &mut refresh, &busy, &mut watchdog);

    let scanning = Arc::new(AtomicBool::new(true));
    let mut adapter = DataqAdapter::new(Arc::clone(&scanning));
    adapter.process_incoming(b"stop\r", None, &mut ctx);
    assert!(!scanning.load(Ordering::Acquire));
    assert!(!busy.is_busy());
  }
}
