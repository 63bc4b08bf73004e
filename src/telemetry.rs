//! Periodic introspection snapshot (spec §4.statement "Telemetry"), fields
//! grounded on `DeviceBackend.get_telemetry` in the original implementation.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Telemetry {
  pub last_queryall: Duration,
  pub last_recv: Duration,
  pub last_query: Duration,
  pub last_send: Duration,
  pub watchdog_elapsed: Duration,
  pub watchdog_active: bool,
  pub watchdog_timeout: Duration,
  pub message_instances: u64,
  pub missing_variables: Vec<String>,
  pub busy_level: u32,
  pub outstanding_queries: Vec<String>,
  pub status: Option<String>,
  pub status_age: Duration,
}
