//! [`DeviceSupervisor`] (spec §4.4): the per-device state machine —
//! `Disconnected → Connecting → Initializing → Polling → Disconnecting →
//! Exited` — that owns a single [`ProtocolAdapter`], its state-variable
//! table, and the housekeeping that keeps the table fresh.
//!
//! One Supervisor, one Transport (or none, for register devices), one
//! DeviceFront: three cooperating loops linked only by
//! [`crate::bus::MessageBus`] pairs, the same shape the teacher's
//! connection/session actors use.

use std::time::{Duration, Instant};

use crate::bus::{BusReceiver, BusSender};
use crate::device::{BusySemaphore, DeviceSpec, OutstandingQueries, RefreshCounters, StateTable};
use crate::error::SupervisorError;
use crate::message::{IdAllocator, Message, MessageKind};
use crate::protocol::{AdapterContext, OutboundEffect, ProtocolAdapter};
use crate::telemetry::Telemetry;
use crate::transport::register::RegisterTransport;
use crate::value::Value;
use crate::watchdog::Watchdog;

/// Why the run loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
  Normal,
  Abnormal,
}

pub struct DeviceSupervisor {
  spec: DeviceSpec,
  adapter: Box<dyn ProtocolAdapter>,
  register: Option<RegisterTransport>,

  /// Merged inbound queue: carries both DeviceFront requests and Transport
  /// status messages (both hold clones of the paired `BusSender`).
  inbound: BusReceiver,
  /// Update/error/ready/telemetry/log events, bound for the DeviceFront.
  front: BusSender,
  /// `send` effects, bound for the Transport thread. `None` for
  /// register-only devices, which talk through `register` inline instead.
  transport: Option<BusSender>,

  ids: IdAllocator,
  state: StateTable,
  outstanding: OutstandingQueries,
  refresh: RefreshCounters,
  busy: BusySemaphore,
  watchdog: Watchdog,

  config: Vec<(String, String)>,
  ready: bool,
  should_abort: bool,

  last_queryall: Instant,
  last_recv: Instant,
  last_query: Instant,
  last_send: Instant,
  last_telemetry: Instant,
  queryall_counter: u32,
}

impl DeviceSupervisor {
  pub fn new(
    spec: DeviceSpec,
    adapter: Box<dyn ProtocolAdapter>,
    register: Option<RegisterTransport>,
    inbound: BusReceiver,
    front: BusSender,
    transport: Option<BusSender>,
  ) -> Self {
    let max_busy = spec.max_busy_level;
    let watchdog_timeout = spec.watchdog_timeout;
    DeviceSupervisor {
      spec,
      adapter,
      register,
      inbound,
      front,
      transport,
      ids: IdAllocator::new(),
      state: StateTable::new(),
      outstanding: OutstandingQueries::new(),
      refresh: RefreshCounters::new(),
      busy: BusySemaphore::new(max_busy),
      watchdog: Watchdog::new(watchdog_timeout),
      config: Vec::new(),
      ready: false,
      should_abort: false,
      last_queryall: Instant::now(),
      last_recv: Instant::now(),
      last_query: Instant::now(),
      last_send: Instant::now(),
      last_telemetry: Instant::now(),
      queryall_counter: 0,
    }
  }

  fn emit_to_front(&mut self, kind: MessageKind) {
    let id = self.ids.next_id();
    let _ = self.front.send(Message::new(kind, id, self.spec.name.clone()));
  }

  fn emit_to_transport(&mut self, kind: MessageKind) {
    if let Some(transport) = &self.transport {
      let id = self.ids.next_id();
      let _ = transport.send(Message::new(kind, id, self.spec.name.clone()));
    }
  }

  /// Call one `ProtocolAdapter` method, lending it a fresh `AdapterContext`
  /// borrowed from our own fields, then apply whatever `OutboundEffect`s it
  /// produced.
  fn call_adapter<R>(&mut self, f: impl FnOnce(&mut dyn ProtocolAdapter, &mut AdapterContext) -> R) -> R {
    let mut ctx = AdapterContext {
      state: &mut self.state,
      outstanding: &mut self.outstanding,
      refresh: &mut self.refresh,
      busy: &self.busy,
      watchdog: &mut self.watchdog,
      register: self.register.as_ref(),
      outbound: Vec::new(),
    };
    let result = f(self.adapter.as_mut(), &mut ctx);
    let effects = std::mem::take(&mut ctx.outbound);
    drop(ctx);
    self.apply_effects(effects);
    result
  }

  fn apply_effects(&mut self, effects: Vec<OutboundEffect>) {
    for effect in effects {
      match effect {
        OutboundEffect::Send {
          bytes,
          expected_replies,
          timeout,
          asynchronous,
        } => {
          self.emit_to_transport(MessageKind::Send {
            bytes,
            expected_replies,
            timeout,
            asynchronous,
          });
          self.last_send = Instant::now();
        }
        OutboundEffect::Update { name, value, force } => self.update(&name, value, force),
        OutboundEffect::Error(error) => self.handle_adapter_error(error),
        OutboundEffect::Fatal(error) => {
          self.report_error(error, true);
          self.should_abort = true;
        }
      }
    }
  }

  /// [`SupervisorError::ConversionUnavailable`] is re-queued rather than
  /// reported: the missing axis parameter is queried again immediately so
  /// the next poll has a chance of resolving it (error.rs doc comment).
  /// `InvalidMessage` additionally clears the outstanding-query table so a
  /// fresh query can go out instead of waiting out `query_timeout` (spec
  /// §4.4, §7).
  fn handle_adapter_error(&mut self, error: SupervisorError) {
    match &error {
      SupervisorError::ConversionUnavailable { missing_parameter } => {
        let name = missing_parameter.clone();
        self.call_adapter(|a, ctx| {
          a.query(&name, ctx);
        });
      }
      SupervisorError::InvalidMessage { .. } => {
        self.outstanding.clear_all();
        self.report_error(error, false);
      }
      _ => {
        let fatal = error.is_fatal();
        self.report_error(error, fatal);
        if fatal {
          self.should_abort = true;
        }
      }
    }
  }

  fn report_error(&mut self, error: SupervisorError, fatal: bool) {
    self.emit_to_front(MessageKind::Error { error, fatal });
  }

  /// update(name, value, force) (spec §4.4): always pats the watchdog and
  /// clears any outstanding query for `name`; emits `update` to the
  /// front-end iff the value differs, `force` is set, or a refresh was
  /// explicitly requested.
  fn update(&mut self, name: &str, value: Value, force: bool) {
    let changed = self.state.value(name) != Some(&value);
    self.state.set(name, value.clone());
    self.watchdog.pat();
    self.outstanding.clear_one(name);
    let refresh_pending = self.refresh.take_pending(name);
    if changed || force || refresh_pending {
      self.emit_to_front(MessageKind::Update {
        name: name.to_string(),
        value,
      });
    }
  }

  /// queryone(name) (spec §4.4): skip if a query for `name` is already in
  /// flight and still fresh; otherwise mark it sent and dispatch. If the
  /// adapter reports the query was never actually dispatched, the
  /// outstanding entry is removed again so a retry is possible on the next
  /// pass.
  fn queryone(&mut self, name: &str) {
    if self.outstanding.is_fresh(name, self.spec.query_timeout) {
      return;
    }
    self.outstanding.mark_sent(name);
    self.last_query = Instant::now();
    let owned = name.to_string();
    let dispatched = self.call_adapter(|a, ctx| a.query(&owned, ctx));
    if !dispatched {
      self.outstanding.clear_one(name);
    }
  }

  /// queryall() (spec §4.4): recompute the refresh list and queryone() each
  /// entry, at most once per `queryall_interval`.
  fn queryall(&mut self) {
    if self.last_queryall.elapsed() < self.spec.queryall_interval {
      return;
    }
    self.last_queryall = Instant::now();
    self.queryall_counter += 1;

    // `urgency_modulo == 0` disables the urgent-variable rotation entirely
    // (this device always refreshes via `minimum_query_variables`).
    let mut names: Vec<String> = if self.spec.urgency_modulo != 0
      && self.queryall_counter % self.spec.urgency_modulo != 0
      && !self.spec.urgent_variables.is_empty()
    {
      self.spec.urgent_variables.clone()
    } else {
      self.spec.minimum_query_variables.clone()
    };

    names.retain(|n| !(self.spec.constant_variables.contains(n) && self.state.contains(n)));

    for missing in self.state.missing_from(&self.spec.all_variables) {
      if !names.iter().any(|n| n == missing) {
        names.push(missing.to_string());
      }
    }

    for name in names {
      self.queryone(&name);
    }
  }

  fn maybe_fire_ready(&mut self) {
    if !self.ready && self.state.missing_from(&self.spec.all_variables).is_empty() {
      self.ready = true;
      self.emit_to_front(MessageKind::Ready);
    }
  }

  fn maybe_emit_telemetry(&mut self) {
    if self.last_telemetry.elapsed() < self.spec.telemetry_interval {
      return;
    }
    self.last_telemetry = Instant::now();
    let status = self.state.value("_status").map(|v| v.to_string());
    let status_age = self
      .state
      .get("_status")
      .map(|sv| sv.updated_at.elapsed())
      .unwrap_or_default();
    let data = Telemetry {
      last_queryall: self.last_queryall.elapsed(),
      last_recv: self.last_recv.elapsed(),
      last_query: self.last_query.elapsed(),
      last_send: self.last_send.elapsed(),
      watchdog_elapsed: self.watchdog.elapsed(),
      watchdog_active: self.watchdog.is_active(),
      watchdog_timeout: self.watchdog.timeout(),
      message_instances: Message::total_instances(),
      missing_variables: self
        .state
        .missing_from(&self.spec.all_variables)
        .into_iter()
        .map(str::to_string)
        .collect(),
      busy_level: self.busy.level(),
      outstanding_queries: self.outstanding.names_sorted(),
      status,
      status_age,
    };
    self.emit_to_front(MessageKind::Telemetry { data });
  }

  fn maybe_write_log(&mut self) {
    let Some(format) = &self.spec.log_format else {
      return;
    };
    let template = crate::device::LogTemplate::new(format.clone());
    if let Some(line) = template.render(&self.state) {
      self.emit_to_front(MessageKind::Log { line });
    }
  }

  /// One dispatch step (spec §4.4 step 2). Returns `true` if `exit` was
  /// received and the loop should terminate normally.
  fn dispatch(&mut self, message: Message) -> bool {
    self.last_recv = Instant::now();
    match message.kind {
      MessageKind::Config { config } => self.config = config,
      MessageKind::Exit => return true,
      MessageKind::Query { name, signal_needed } => {
        if signal_needed {
          self.refresh.request(name.clone());
        }
        self.call_adapter(|a, ctx| {
          a.query(&name, ctx);
        });
      }
      MessageKind::Set { name, value } => {
        self.call_adapter(|a, ctx| {
          a.set(&name, &value, ctx);
        });
      }
      MessageKind::Execute { name, arguments } => {
        self.call_adapter(|a, ctx| {
          a.execute(&name, &arguments, ctx);
        });
      }
      MessageKind::Incoming { bytes, original_sent } => {
        self.call_adapter(|a, ctx| {
          a.process_incoming(&bytes, original_sent.as_deref(), ctx);
        });
      }
      MessageKind::CommunicationError { error } => {
        self.report_error(error, true);
        self.should_abort = true;
      }
      MessageKind::Timeout => {
        self.report_error(
          SupervisorError::Communication {
            message: "request timed out waiting for a reply".into(),
          },
          true,
        );
        self.should_abort = true;
      }
      MessageKind::Log { line } => self.emit_to_front(MessageKind::Log { line }),
      MessageKind::SendComplete => self.last_send = Instant::now(),
      MessageKind::TelemetryRequest => {
        self.last_telemetry = Instant::now() - self.spec.telemetry_interval;
        self.maybe_emit_telemetry();
      }
      // Every other kind only ever flows Supervisor -> Front/Transport.
      _ => {}
    }
    false
  }

  /// One housekeeping pass (spec §4.4 step 3).
  fn housekeeping(&mut self) {
    self.maybe_fire_ready();
    if let Err(error) = self.watchdog.check() {
      self.report_error(error, true);
      self.should_abort = true;
      return;
    }
    self.queryall();
    self.maybe_write_log();
    self.maybe_emit_telemetry();
  }

  /// Run the Disconnected → Connecting → Initializing → Polling →
  /// Disconnecting → Exited state machine to completion (spec §4.4). This
  /// call is the entire body of the Supervisor's own thread/process.
  pub fn run(mut self) -> Termination {
    self.call_adapter(|a, ctx| a.initialize_after_connect(ctx));
    if self.should_abort {
      self.emit_to_front(MessageKind::Exited {
        normal_termination: false,
      });
      return Termination::Abnormal;
    }

    let mut normal_termination = true;
    loop {
      let timeout = self.spec.sane_inqueue_timeout();
      match self.inbound.recv_timeout(timeout) {
        Ok(message) => {
          if self.dispatch(message) {
            break;
          }
        }
        Err(crate::bus::RecvError::Timeout) => {}
        Err(crate::bus::RecvError::Disconnected) => {
          normal_termination = false;
          break;
        }
      }

      if self.should_abort {
        normal_termination = false;
        break;
      }

      self.housekeeping();
      if self.should_abort {
        normal_termination = false;
        break;
      }
    }

    // Disconnecting: tell the Transport to tear down and wait (briefly) for
    // its own `exited` confirmation before declaring ourselves done, so a
    // socket is never left to the OS to close asynchronously.
    self.emit_to_transport(MessageKind::Exit);
    if self.transport.is_some() {
      let deadline = Instant::now() + Duration::from_secs(5);
      while Instant::now() < deadline {
        match self.inbound.recv_timeout(Duration::from_millis(50)) {
          Ok(message) if matches!(message.kind, MessageKind::Exited { .. }) => break,
          Ok(_) => continue,
          Err(_) => break,
        }
      }
    }
    self.emit_to_front(MessageKind::Exited { normal_termination });
    if normal_termination {
      Termination::Normal
    } else {
      Termination::Abnormal
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::protocol::{Argument, FrameResult};

  struct EchoAdapter {
    queried: Vec<String>,
  }

  impl ProtocolAdapter for EchoAdapter {
    fn frame(&self, _buffer: &[u8]) -> FrameResult {
      FrameResult {
        frames: Vec::new(),
        consumed: 0,
      }
    }

    fn query(&mut self, name: &str, ctx: &mut AdapterContext) -> bool {
      self.queried.push(name.to_string());
      ctx.push_update(name, 1.0, false);
      true
    }

    fn set(&mut self, _name: &str, _value: &Value, _ctx: &mut AdapterContext) {}

    fn execute(&mut self, _name: &str, _arguments: &[Argument], _ctx: &mut AdapterContext) {}

    fn process_incoming(&mut self, _frame: &[u8], _original_sent: Option<&[u8]>, _ctx: &mut AdapterContext) {}

    fn initialize_after_connect(&mut self, ctx: &mut AdapterContext) {
      ctx.push_update("online", true, false);
    }
  }

  fn spec() -> DeviceSpec {
    DeviceSpec {
      name: "test".into(),
      all_variables: vec!["online".into(), "x".into()],
      minimum_query_variables: vec!["x".into()],
      constant_variables: vec![],
      urgent_variables: vec![],
      urgency_modulo: 0,
      poll_interval: Duration::from_millis(10),
      query_timeout: Duration::from_millis(50),
      watchdog_timeout: Duration::from_secs(5),
      telemetry_interval: Duration::from_secs(60),
      queryall_interval: Duration::from_millis(1),
      inqueue_timeout: Duration::from_millis(10),
      max_busy_level: 1,
      log_format: None,
      log_path: None,
    }
  }

  #[test]
  fn fires_ready_once_all_variables_present() {
    let (front_tx, front_rx) = crate::bus::channel(8);
    let (sup_tx, sup_rx) = crate::bus::channel(8);
    let adapter = Box::new(EchoAdapter { queried: Vec::new() });
    let supervisor = DeviceSupervisor::new(spec(), adapter, None, sup_rx, front_tx, None);

    let handle = std::thread::spawn(move || supervisor.run());
    // `x` must actually be queried before `all_variables` is fully present;
    // `exit` breaks the loop before that iteration's housekeeping runs, so
    // it cannot be the message that causes readiness to fire.
    sup_tx
      .send(Message::new(
        MessageKind::Query {
          name: "x".into(),
          signal_needed: false,
        },
        0,
        "test",
      ))
      .unwrap();
    sup_tx.send(Message::new(MessageKind::Exit, 1, "test")).unwrap();
    let term = handle.join().unwrap();
    assert_eq!(term, Termination::Normal);

    let mut saw_ready = false;
    while let Ok(message) = front_rx.recv_timeout(Duration::from_millis(20)) {
      if matches!(message.kind, MessageKind::Ready) {
        saw_ready = true;
      }
    }
    assert!(saw_ready);
  }

  #[test]
  fn explicit_query_with_signal_needed_always_emits_update() {
    let (front_tx, front_rx) = crate::bus::channel(8);
    let (sup_tx, sup_rx) = crate::bus::channel(8);
    let adapter = Box::new(EchoAdapter { queried: Vec::new() });
    let supervisor = DeviceSupervisor::new(spec(), adapter, None, sup_rx, front_tx, None);

    let handle = std::thread::spawn(move || supervisor.run());
    sup_tx
      .send(Message::new(
        MessageKind::Query {
          name: "x".into(),
          signal_needed: true,
        },
        0,
        "test",
      ))
      .unwrap();
    sup_tx.send(Message::new(MessageKind::Exit, 1, "test")).unwrap();
    handle.join().unwrap();

    let mut updates = 0;
    while let Ok(message) = front_rx.recv_timeout(Duration::from_millis(20)) {
      if matches!(message.kind, MessageKind::Update { ref name, .. } if name == "x") {
        updates += 1;
      }
    }
    assert!(updates >= 1);
  }

  #[test]
  fn conversion_unavailable_is_requeued_not_reported() {
    struct FlakyAdapter;
    impl ProtocolAdapter for FlakyAdapter {
      fn frame(&self, _buffer: &[u8]) -> FrameResult {
        FrameResult {
          frames: Vec::new(),
          consumed: 0,
        }
      }
      fn query(&mut self, _name: &str, ctx: &mut AdapterContext) -> bool {
        ctx.push_update("online", true, false);
        ctx.push_update("x", true, false);
        true
      }
      fn set(&mut self, _name: &str, _value: &Value, _ctx: &mut AdapterContext) {}
      fn execute(&mut self, _name: &str, _arguments: &[Argument], _ctx: &mut AdapterContext) {}
      fn process_incoming(&mut self, _frame: &[u8], _original_sent: Option<&[u8]>, ctx: &mut AdapterContext) {
        ctx.push_error(SupervisorError::ConversionUnavailable {
          missing_parameter: "microstepresolution$0".into(),
        });
      }
      fn initialize_after_connect(&mut self, ctx: &mut AdapterContext) {
        ctx.push_update("online", true, false);
      }
    }

    let (front_tx, front_rx) = crate::bus::channel(8);
    let (sup_tx, sup_rx) = crate::bus::channel(8);
    let supervisor = DeviceSupervisor::new(spec(), Box::new(FlakyAdapter), None, sup_rx, front_tx, None);

    let handle = std::thread::spawn(move || supervisor.run());
    sup_tx
      .send(Message::new(
        MessageKind::Incoming {
          bytes: vec![],
          original_sent: None,
        },
        0,
        "test",
      ))
      .unwrap();
    sup_tx.send(Message::new(MessageKind::Exit, 1, "test")).unwrap();
    handle.join().unwrap();

    let mut saw_error = false;
    while let Ok(message) = front_rx.recv_timeout(Duration::from_millis(20)) {
      if matches!(message.kind, MessageKind::Error { .. }) {
        saw_error = true;
      }
    }
    assert!(!saw_error);
  }
}
