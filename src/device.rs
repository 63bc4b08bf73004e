//! Supporting data model shared by every [`crate::supervisor::DeviceSupervisor`]:
//! [`DeviceSpec`] (immutable per-instance configuration), the state-variable
//! table, the outstanding-query and refresh-counter tables, and the busy
//! semaphore (spec §3).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::value::Value;

/// Immutable for the lifetime of one Supervisor instance (spec §3).
#[derive(Debug, Clone)]
pub struct DeviceSpec {
  pub name: String,
  pub all_variables: Vec<String>,
  pub minimum_query_variables: Vec<String>,
  pub constant_variables: Vec<String>,
  pub urgent_variables: Vec<String>,
  pub urgency_modulo: u32,
  pub poll_interval: Duration,
  pub query_timeout: Duration,
  pub watchdog_timeout: Duration,
  pub telemetry_interval: Duration,
  pub queryall_interval: Duration,
  pub inqueue_timeout: Duration,
  pub max_busy_level: u32,
  pub log_format: Option<String>,
  pub log_path: Option<std::path::PathBuf>,
}

impl DeviceSpec {
  /// `inqueue_timeout` must not exceed half of `queryall_interval` so the
  /// poll loop never starves waiting on the inbound queue (spec §5).
  pub fn sane_inqueue_timeout(&self) -> Duration {
    self.inqueue_timeout.min(self.queryall_interval / 2)
  }
}

/// A single state variable: typed value plus the monotonic timestamp of its
/// last update (spec §3).
#[derive(Debug, Clone)]
pub struct StateVariable {
  pub value: Value,
  pub updated_at: Instant,
}

/// The per-Supervisor state-variable table. Once a variable is present it
/// remains present for the Supervisor's lifetime (invariant 1); timestamps
/// only move forward because every write replaces `updated_at` with `now`.
#[derive(Debug, Default)]
pub struct StateTable {
  entries: HashMap<String, StateVariable>,
}

impl StateTable {
  pub fn new() -> Self {
    StateTable::default()
  }

  pub fn get(&self, name: &str) -> Option<&StateVariable> {
    self.entries.get(name)
  }

  pub fn value(&self, name: &str) -> Option<&Value> {
    self.entries.get(name).map(|sv| &sv.value)
  }

  pub fn set(&mut self, name: impl Into<String>, value: Value) {
    self.entries.insert(
      name.into(),
      StateVariable {
        value,
        updated_at: Instant::now(),
      },
    );
  }

  pub fn contains(&self, name: &str) -> bool {
    self.entries.contains_key(name)
  }

  /// Names in `all_variables` not yet present — drives both the ready gate
  /// and the telemetry snapshot.
  pub fn missing_from<'a>(&self, all_variables: &'a [String]) -> Vec<&'a str> {
    all_variables
      .iter()
      .filter(|v| !self.entries.contains_key(v.as_str()))
      .map(|v| v.as_str())
      .collect()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&String, &StateVariable)> {
    self.entries.iter()
  }
}

/// Tracks variables with a query in flight (spec §3). An entry either
/// resolves into an `update` or expires past `query_timeout` and is deleted
/// (invariant 2).
#[derive(Debug, Default)]
pub struct OutstandingQueries {
  sent_at: HashMap<String, Instant>,
}

impl OutstandingQueries {
  pub fn new() -> Self {
    OutstandingQueries::default()
  }

  /// True if a query for `name` was sent less than `query_timeout` ago —
  /// in that case a fresh query must be skipped (spec §4.4 `queryone`).
  pub fn is_fresh(&self, name: &str, query_timeout: Duration) -> bool {
    self
      .sent_at
      .get(name)
      .map(|t| t.elapsed() < query_timeout)
      .unwrap_or(false)
  }

  pub fn mark_sent(&mut self, name: impl Into<String>) {
    self.sent_at.insert(name.into(), Instant::now());
  }

  pub fn clear_one(&mut self, name: &str) {
    self.sent_at.remove(name);
  }

  pub fn clear_all(&mut self) {
    self.sent_at.clear();
  }

  pub fn names_sorted(&self) -> Vec<String> {
    let mut names: Vec<String> = self.sent_at.keys().cloned().collect();
    names.sort();
    names
  }
}

/// Per-variable count of outstanding client requests requiring an `update`
/// even on an unchanged value (spec §3). Incremented on refresh with
/// `signal_needed=true`, decremented on the next update delivery.
#[derive(Debug, Default)]
pub struct RefreshCounters {
  counts: HashMap<String, u32>,
}

impl RefreshCounters {
  pub fn new() -> Self {
    RefreshCounters::default()
  }

  pub fn request(&mut self, name: impl Into<String>) {
    *self.counts.entry(name.into()).or_insert(0) += 1;
  }

  /// True if there is a pending refresh for `name`; decrements the counter
  /// as a side effect (spec §4.4 `update`).
  pub fn take_pending(&mut self, name: &str) -> bool {
    if let Some(count) = self.counts.get_mut(name) {
      if *count > 0 {
        *count -= 1;
        return true;
      }
    }
    false
  }
}

/// A counting semaphore with capacity `max_busy_level` (spec §3). Acquired
/// non-blockingly before starting a long operation (move, trim, exposure),
/// released on completion or error. `std::sync::Semaphore` does not exist in
/// stable std, so this is a small atomic CAS loop, the same shape as
/// `multiprocessing.BoundedSemaphore` in the original.
#[derive(Debug)]
pub struct BusySemaphore {
  capacity: u32,
  level: AtomicU32,
}

impl BusySemaphore {
  pub fn new(capacity: u32) -> Self {
    BusySemaphore {
      capacity,
      level: AtomicU32::new(0),
    }
  }

  /// Attempt to acquire one permit. Returns `true` on success.
  pub fn try_acquire(&self) -> bool {
    let mut current = self.level.load(Ordering::Acquire);
    loop {
      if current >= self.capacity {
        return false;
      }
      match self.level.compare_exchange_weak(
        current,
        current + 1,
        Ordering::AcqRel,
        Ordering::Acquire,
      ) {
        Ok(_) => return true,
        Err(observed) => current = observed,
      }
    }
  }

  /// Release one permit. A no-op (never panics) if the level is already
  /// zero, matching "leaks are prevented by a terminal release in the error
  /// path" (spec §5) being safe to call defensively.
  pub fn release(&self) {
    let _ = self
      .level
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
        if v == 0 {
          None
        } else {
          Some(v - 1)
        }
      });
  }

  pub fn level(&self) -> u32 {
    self.level.load(Ordering::Acquire)
  }

  pub fn capacity(&self) -> u32 {
    self.capacity
  }

  pub fn is_busy(&self) -> bool {
    self.level() > 0
  }
}

/// A minimal `{name}`-placeholder template over the state-variable table,
/// standing in for the original's `log_formatstr.format(**properties)`
/// (spec §6). No templating crate in the retrieval pack is pulled in for
/// anything this small, so this is hand-rolled.
pub struct LogTemplate {
  template: String,
}

impl LogTemplate {
  pub fn new(template: impl Into<String>) -> Self {
    LogTemplate {
      template: template.into(),
    }
  }

  /// Render the template against `table`. Returns `None` (matching the
  /// original's `KeyError` swallow) if a referenced variable is missing.
  pub fn render(&self, table: &StateTable) -> Option<String> {
    let mut out = String::new();
    let bytes = self.template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
      if bytes[i] == b'{' {
        if let Some(end) = self.template[i..].find('}') {
          let name = &self.template[i + 1..i + end];
          let value = table.value(name)?;
          out.push_str(&value.to_string());
          i += end + 1;
          continue;
        }
      }
      let ch = self.template[i..].chars().next().unwrap();
      out.push(ch);
      i += ch.len_utf8();
    }
    Some(out)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn busy_semaphore_respects_capacity() {
    let sem = BusySemaphore::new(1);
    assert!(sem.try_acquire());
    assert!(!sem.try_acquire());
    sem.release();
    assert!(sem.try_acquire());
  }

  #[test]
  fn busy_semaphore_no_motor_moving_when_zero() {
    let sem = BusySemaphore::new(2);
    assert!(!sem.is_busy());
    sem.try_acquire();
    assert!(sem.is_busy());
  }

  #[test]
  fn outstanding_query_freshness() {
    let mut oq = OutstandingQueries::new();
    oq.mark_sent("T1");
    assert!(oq.is_fresh("T1", Duration::from_secs(5)));
    assert!(!oq.is_fresh("T1", Duration::from_nanos(1)));
  }

  #[test]
  fn refresh_counter_fires_once_per_request() {
    let mut rc = RefreshCounters::new();
    rc.request("pump_power");
    assert!(rc.take_pending("pump_power"));
    assert!(!rc.take_pending("pump_power"));
  }

  #[test]
  fn log_template_renders_known_variables() {
    let mut table = StateTable::new();
    table.set("pump_power", Value::Float(50.0));
    let tmpl = LogTemplate::new("power={pump_power}");
    assert_eq!(tmpl.render(&table), Some("power=50".to_string()));
  }

  #[test]
  fn log_template_missing_variable_yields_none() {
    let table = StateTable::new();
    let tmpl = LogTemplate::new("power={pump_power}");
    assert_eq!(tmpl.render(&table), None);
  }
}
