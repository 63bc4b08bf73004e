//! Area detector (Dectris Pilatus), grounded on
//! `cct/core/devices/detector.py::Pilatus`. Line-ASCII protocol terminated
//! by `0x18`; replies are formatted `"<idnum> <status> <payload>\x18"` and
//! dispatched by `idnum` against a fixed table of regexes, each producing a
//! set of named captures that map onto typed state variables.

use std::sync::LazyLock;
use std::time::Duration;

use chrono::NaiveDateTime;
use regex::Regex;

use crate::error::SupervisorError;
use crate::value::Value;

use super::{AdapterContext, Argument, FrameResult, ProtocolAdapter};

const SENTINEL: u8 = 0x18;
const REPLY_TIMEOUT: Duration = Duration::from_secs(20);

const FLOAT_VARS: &[&str] = &[
  "tau", "cutoff", "exptime", "expperiod", "temperature0", "temperature1", "temperature2",
  "humidity0", "humidity1", "humidity2", "threshold", "vcmp", "timeleft",
];
const INT_VARS: &[&str] = &[
  "wpix", "hpix", "sel_bank", "sel_module", "sel_chip", "diskfree", "nimages", "masterPID",
  "controllingPID", "pid",
];
const DATE_VARS: &[&str] = &["starttime"];

enum Converted {
  Float(f64),
  Int(i64),
  Str(String),
  Date(NaiveDateTime),
}

fn convert(name: &str, raw: &str) -> Option<Converted> {
  if FLOAT_VARS.contains(&name) {
    raw.parse().ok().map(Converted::Float)
  } else if INT_VARS.contains(&name) {
    raw.parse().ok().map(Converted::Int)
  } else if DATE_VARS.contains(&name) {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
      .ok()
      .map(Converted::Date)
  } else {
    Some(Converted::Str(raw.to_string()))
  }
}

struct ReplyPattern {
  idnum: i32,
  regex: Regex,
}

const RE_FLOAT: &str = r"[+-]?(\d+)*\.?\d+([eE][+-]?\d+)?";
const RE_DATE: &str = r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}.\d+";
const RE_INT: &str = r"[+-]?\d+";

static REPLY_TABLE: LazyLock<Vec<ReplyPattern>> = LazyLock::new(|| {
  let pat = |idnum: i32, body: String| ReplyPattern {
    idnum,
    regex: Regex::new(&format!("^{body}")).expect("static regex"),
  };
  vec![
    pat(15, format!(r"Rate correction is on; tau = (?P<tau>{RE_FLOAT}) s, cutoff = (?P<cutoff>{RE_INT}) counts")),
    pat(15, format!(r"Rate correction is off, cutoff = (?P<cutoff>{RE_INT}) counts")),
    pat(15, format!(r"Set up rate correction: tau = (?P<tau>{RE_FLOAT}) s")),
    pat(15, format!(r"Exposure time set to: (?P<exptime>{RE_FLOAT}) sec\.")),
    pat(15, format!(r"Exposure period set to: (?P<expperiod>{RE_FLOAT}) sec")),
    pat(15, "Illegal exposure period".to_string()),
    pat(15, format!(r"Starting (?P<exptime>{RE_FLOAT}) second background: (?P<starttime>{RE_DATE})")),
    pat(7, r"(?P<filename>.*)".to_string()),
    pat(24, r"Code release:\s*(?P<version>.*)".to_string()),
    pat(
      18,
      format!(
        r"=== Telemetry at {RE_DATE} ===\s*\nImage format: (?P<wpix>{RE_INT})\(w\) x (?P<hpix>{RE_INT})\(h\) pixels\s*\nSelected bank: (?P<sel_bank>{RE_INT})\s*\nSelected module: (?P<sel_module>{RE_INT})\s*\nSelected chip: (?P<sel_chip>{RE_INT})\s*\nChannel {RE_INT}: Temperature = (?P<temperature0>{RE_FLOAT})C, Rel. Humidity = (?P<humidity0>{RE_FLOAT})%\s*\nChannel {RE_INT}: Temperature = (?P<temperature1>{RE_FLOAT})C, Rel. Humidity = (?P<humidity1>{RE_FLOAT})%\s*\nChannel {RE_INT}: Temperature = (?P<temperature2>{RE_FLOAT})C, Rel. Humidity = (?P<humidity2>{RE_FLOAT})%\s*"
      ),
    ),
    pat(5, format!(r"(?P<diskfree>{RE_INT})")),
    pat(
      15,
      format!(r"Settings: (?P<gain>\w+) gain; threshold: (?P<threshold>{RE_INT}) eV; vcmp: (?P<vcmp>{RE_FLOAT}) V\n\s*Trim file:\s*\n\s*(?P<trimfile>.*)"),
    ),
    pat(15, r"/tmp/setthreshold\.cmd".to_string()),
    pat(15, "Threshold has not been set".to_string()),
    pat(15, format!(r"Requested threshold \({RE_FLOAT} eV\) is out of range")),
    pat(13, "kill".to_string()),
    pat(15, format!(r"N images set to: (?P<nimages>{RE_INT})")),
    pat(
      2,
      format!(
        r"\n*\s*Camera definition:\n\s+(?P<cameradef>.*)\n\s*Camera name: (?P<cameraname>.*),\sS/N\s(?P<cameraSN>{RE_INT}-{RE_INT})\n\s*Camera state: (?P<_status>.*)\n\s*Target file: (?P<targetfile>.*)\n\s*Time left: (?P<timeleft>{RE_FLOAT})\n\s*Last image: (?P<lastimage>.*)\n\s*Master PID is: (?P<masterPID>{RE_INT})\n\s*Controlling PID is: (?P<controllingPID>{RE_INT})\n\s*Exposure time: (?P<exptime>{RE_FLOAT})\n\s*Last completed image:\s*\n\s*(?P<lastcompletedimage>.*)\n\s*Shutter is: (?P<shutterstate>.*)\n*"
      ),
    ),
    pat(10, r"(?P<imgpath>.*)".to_string()),
    pat(15, r"ImgMode is (?P<imgmode>.*)".to_string()),
    pat(16, format!(r"PID = (?P<pid>{RE_INT})")),
    pat(-1, "access denied".to_string()),
    pat(1, "access denied".to_string()),
    pat(-1, r"/tmp/setthreshold\.cmd".to_string()),
    pat(-1, r"(?P<filename>/home/det/p2_det/images/.*)".to_string()),
    pat(-1, r"(?P<filename>/disk2/images/.*)".to_string()),
    pat(15, String::new()),
  ]
});

pub struct PilatusAdapter {
  expected_status: &'static str,
}

impl PilatusAdapter {
  pub fn new() -> Self {
    PilatusAdapter {
      expected_status: "idle",
    }
  }

  fn send(&self, ctx: &mut AdapterContext, command: impl Into<Vec<u8>>) {
    ctx.push_send(command.into(), 1, REPLY_TIMEOUT, false);
  }
}

impl Default for PilatusAdapter {
  fn default() -> Self {
    Self::new()
  }
}

impl ProtocolAdapter for PilatusAdapter {
  fn frame(&self, buffer: &[u8]) -> FrameResult {
    let mut frames = Vec::new();
    let mut consumed = 0;
    while let Some(idx) = buffer[consumed..].iter().position(|&b| b == SENTINEL) {
      frames.push(buffer[consumed..consumed + idx + 1].to_vec());
      consumed += idx + 1;
    }
    FrameResult { frames, consumed }
  }

  fn query(&mut self, name: &str, ctx: &mut AdapterContext) -> bool {
    let command: &[u8] = match name {
      "gain" | "threshold" | "vcmp" => b"SetThreshold\n",
      "trimfile" | "wpix" | "hpix" | "sel_bank" | "sel_module" | "sel_chip" => b"Telemetry\n",
      n if n.starts_with("humidity") || n.starts_with("temperature") => b"THread\n",
      "nimages" => b"NImages\n",
      "cameradef" | "cameraname" | "cameraSN" | "_status" | "targetfile" | "timeleft"
      | "lastimage" | "masterPID" | "controllingPID" | "exptime" | "lastcompletedimage"
      | "shutterstate" => b"camsetup\n",
      "imgpath" => b"imgpath\n",
      "imgmode" => b"imgmode\n",
      "PID" => b"ShowPID\n",
      "expperiod" => b"expperiod\n",
      "tau" | "cutoff" => b"tau\n",
      "diskfree" => b"df\n",
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
    let command = match (name, value) {
      ("expperiod", Value::Float(v)) => format!("expperiod {v}\n"),
      ("nimages", Value::Int(v)) => format!("nimages {v}\n"),
      ("tau", Value::Float(v)) => format!("tau {v}\n"),
      ("imgpath", Value::Str(v)) => format!("imgpath {v}\n"),
      ("exptime", Value::Float(v)) => format!("exptime {v}\n"),
      _ => {
        ctx.push_error(SupervisorError::ReadOnlyVariable {
          variable: name.to_string(),
        });
        return;
      }
    };
    self.send(ctx, command.into_bytes());
  }

  fn execute(&mut self, name: &str, arguments: &[Argument], ctx: &mut AdapterContext) {
    let status = ctx.state.value("_status").and_then(Value::as_str).map(str::to_string);
    match name {
      "setthreshold" => {
        if status.as_deref() != Some("idle") {
          ctx.push_error(SupervisorError::device("cannot trim when not idle"));
          return;
        }
        let (threshold, gain) = match arguments {
          [Argument::Float(t), Argument::Str(g)] => (*t, g.clone()),
          _ => {
            ctx.push_error(SupervisorError::device("setthreshold needs (threshold, gain)"));
            return;
          }
        };
        self.send(ctx, format!("SetThreshold {threshold} {gain}\n").into_bytes());
        ctx.push_update("_status", "trimming", false);
      }
      "expose" => {
        if status.as_deref() != Some("idle") {
          ctx.push_error(SupervisorError::device("cannot start exposure when not idle"));
          return;
        }
        let filename = match arguments {
          [Argument::Str(f)] => f.clone(),
          _ => {
            ctx.push_error(SupervisorError::device("expose needs a filename"));
            return;
          }
        };
        self.send(ctx, format!("Exposure {filename}\n").into_bytes());
        let multi = ctx.state.value("nimages").and_then(Value::as_int).map(|n| n != 1).unwrap_or(false);
        self.expected_status = if multi { "exposing multi" } else { "exposing" };
        ctx.push_update("_status", self.expected_status, false);
        ctx.watchdog.disable();
      }
      "kill" => match status.as_deref() {
        Some("exposing") | Some("exposing multi") => {
          self.send(ctx, b"K\nresetcam\n".to_vec());
          ctx.watchdog.enable();
        }
        _ => ctx.push_error(SupervisorError::device("no running exposures to be killed")),
      },
      "resetcam" => self.send(ctx, b"resetcam\n".to_vec()),
      _ => ctx.push_error(SupervisorError::UnknownCommand {
        command: name.to_string(),
      }),
    }
  }

  fn process_incoming(&mut self, frame: &[u8], _original_sent: Option<&[u8]>, ctx: &mut AdapterContext) {
    let original = frame;
    let space_count = frame.iter().filter(|&&b| b == b' ').count();
    let (idnum, status, mut body): (i32, Vec<u8>, Vec<u8>);
    if space_count < 2 {
      let parts: Vec<&[u8]> = frame.splitn(2, |&b| b == b' ').collect();
      if parts.len() != 2 {
        idnum = -1;
        status = b"OK".to_vec();
        body = frame.to_vec();
        if !body.ends_with(&[SENTINEL]) {
          body.push(SENTINEL);
        }
      } else {
        match std::str::from_utf8(parts[0]).ok().and_then(|s| s.parse::<i32>().ok()) {
          Some(n) => {
            idnum = n;
            let mut st = parts[1].to_vec();
            st.pop(); // cut the 0x18 sentinel
            status = st;
            body = vec![SENTINEL];
          }
          None => {
            idnum = -1;
            status = b"OK".to_vec();
            body = frame.to_vec();
            if !body.ends_with(&[SENTINEL]) {
              body.push(SENTINEL);
            }
          }
        }
      }
    } else {
      let parts: Vec<&[u8]> = frame.splitn(3, |&b| b == b' ').collect();
      if parts.len() == 3 {
        idnum = std::str::from_utf8(parts[0]).ok().and_then(|s| s.parse().ok()).unwrap_or(-1);
        status = parts[1].to_vec();
        body = parts[2].to_vec();
      } else {
        idnum = -1;
        status = b"OK".to_vec();
        body = frame.to_vec();
        if !body.ends_with(&[SENTINEL]) {
          body.push(SENTINEL);
        }
      }
    }

    while body.first() == Some(&b' ') || body.last() == Some(&b' ') {
      if body.first() == Some(&b' ') {
        body.remove(0);
      }
      if body.last() == Some(&b' ') {
        body.pop();
      }
    }
    if !body.ends_with(&[SENTINEL]) {
      ctx.push_error(SupervisorError::InvalidMessage {
        message: format!("does not end with 0x18: {:?}", String::from_utf8_lossy(&body)),
      });
      return;
    }
    body.pop();

    if body.contains(&SENTINEL) {
      for part in body.split(|&b| b == SENTINEL) {
        let mut sub = part.to_vec();
        sub.push(SENTINEL);
        self.process_incoming(&sub, None, ctx);
      }
      return;
    }

    if status != b"OK" {
      ctx.push_error(SupervisorError::device(format!(
        "status of message is not OK, but {:?}: {:?}",
        String::from_utf8_lossy(&status),
        String::from_utf8_lossy(original)
      )));
    }

    if body == b"/tmp/setthreshold.cmd" {
      ctx.push_update("_status", "idle", false);
      self.send(ctx, b"SetThreshold\n".to_vec());
      return;
    }

    let patterns = REPLY_TABLE.iter().filter(|p| p.idnum == idnum);
    if idnum == -1 && body == b"access denied" {
      ctx.push_error(SupervisorError::Communication {
        message: "could only connect to Pilatus in read-only mode".into(),
      });
      return;
    }
    if idnum == 7 && status == b"OK" {
      ctx.watchdog.pat();
    }
    let text = String::from_utf8_lossy(&body).trim().to_string();
    if idnum == 15 && text.starts_with("Starting") {
      ctx.push_update("_status", self.expected_status, false);
    }

    let mut matched = false;
    for p in patterns {
      if let Some(caps) = p.regex.captures(&text) {
        for name in p.regex.capture_names().flatten() {
          if let Some(m) = caps.name(name) {
            match convert(name, m.as_str()) {
              Some(Converted::Float(v)) => ctx.push_update(name, v, false),
              Some(Converted::Int(v)) => ctx.push_update(name, v, false),
              Some(Converted::Str(v)) => ctx.push_update(name, v, false),
              Some(Converted::Date(v)) => ctx.push_update(name, Value::Date(v.date()), false),
              None => ctx.push_error(SupervisorError::device_for(name, "error updating variable")),
            }
          }
        }
        matched = true;
        break;
      }
    }
    if !matched {
      ctx.push_error(SupervisorError::InvalidMessage {
        message: format!("cannot decode message: {idnum} {:?} {text}", String::from_utf8_lossy(&status)),
      });
    }
  }

  fn initialize_after_connect(&mut self, ctx: &mut AdapterContext) {
    // The real device requires a threshold to be re-applied after every
    // reconnect, else readout stays at whatever was last loaded into SRAM.
    self.send(ctx, b"SetThreshold 4024 highg\n".to_vec());
  }
}
