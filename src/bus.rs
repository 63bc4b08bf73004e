//! The [`MessageBus`] (spec §4.1): a bounded, ordered producer → consumer
//! channel carrying [`Message`] values, with one extra guarantee the plain
//! bounded channel can't give us on its own — an `exit` message always
//! lands even if the bounded lane is full, so a shutdown request is never
//! starved by a busy device.
//!
//! Built on `crossbeam-channel` rather than `std::sync::mpsc`: we need a
//! non-blocking priority lane selected alongside a timed receive on the
//! bounded lane, which `std::sync::mpsc` cannot express without polling.

use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Select};

use crate::message::Message;

/// Sending half of a [`MessageBus`].
#[derive(Clone)]
pub struct BusSender {
  normal: crossbeam_channel::Sender<Message>,
  priority: crossbeam_channel::Sender<Message>,
}

/// Receiving half of a [`MessageBus`]. Single-consumer by convention (one
/// Supervisor, one Transport) even though the underlying channels are MPMC.
pub struct BusReceiver {
  normal: crossbeam_channel::Receiver<Message>,
  priority: crossbeam_channel::Receiver<Message>,
}

/// Create a bounded bus with the given normal-lane capacity. The priority
/// lane is unbounded: it only ever carries rare, singleton control messages
/// (`exit`, fatal `communication-error`) so it cannot grow without bound in
/// practice, and bounding it would reintroduce the exact starvation this
/// lane exists to avoid.
pub fn channel(capacity: usize) -> (BusSender, BusReceiver) {
  let (normal_tx, normal_rx) = bounded(capacity);
  let (priority_tx, priority_rx) = unbounded();
  (
    BusSender {
      normal: normal_tx,
      priority: priority_tx,
    },
    BusReceiver {
      normal: normal_rx,
      priority: priority_rx,
    },
  )
}

/// Whether a message kind must use the priority lane. Only `exit` is
/// specified to never be blocked out by a full queue (spec §4.1); fatal
/// communication errors are routed the same way since, by the time one is
/// raised, the normal lane may already be the reason nothing is draining.
fn is_urgent(message: &Message) -> bool {
  matches!(
    message.kind,
    crate::message::MessageKind::Exit | crate::message::MessageKind::CommunicationError { .. }
  )
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
  #[error("receiver has disconnected")]
  Disconnected,
}

#[derive(Debug, thiserror::Error)]
pub enum RecvError {
  #[error("receive timed out")]
  Timeout,
  #[error("sender has disconnected")]
  Disconnected,
}

impl BusSender {
  /// Send a message. Blocks if the normal lane is full, unless `message` is
  /// urgent (§4.1), in which case it is placed on the unbounded priority
  /// lane and never blocks.
  pub fn send(&self, message: Message) -> Result<(), SendError> {
    if is_urgent(&message) {
      self
        .priority
        .send(message)
        .map_err(|_| SendError::Disconnected)
    } else {
      self
        .normal
        .send(message)
        .map_err(|_| SendError::Disconnected)
    }
  }

}

impl BusReceiver {
  /// Block for up to `timeout`, preferring a priority-lane message over a
  /// normal-lane one whenever both are ready, matching the "always lands"
  /// guarantee even under contention.
  pub fn recv_timeout(&self, timeout: Duration) -> Result<Message, RecvError> {
    if let Ok(message) = self.priority.try_recv() {
      return Ok(message);
    }

    let mut select = Select::new();
    let priority_idx = select.recv(&self.priority);
    let normal_idx = select.recv(&self.normal);

    let op = match select.select_timeout(timeout) {
      Ok(op) => op,
      Err(_) => return Err(RecvError::Timeout),
    };

    let result = if op.index() == priority_idx {
      op.recv(&self.priority)
    } else if op.index() == normal_idx {
      op.recv(&self.normal)
    } else {
      unreachable!("only two operands registered")
    };

    result.map_err(|_| RecvError::Disconnected)
  }

  /// Non-blocking receive, checking the priority lane first.
  pub fn try_recv(&self) -> Result<Message, RecvError> {
    match self.priority.try_recv() {
      Ok(message) => return Ok(message),
      Err(crossbeam_channel::TryRecvError::Disconnected) => return Err(RecvError::Disconnected),
      Err(crossbeam_channel::TryRecvError::Empty) => {}
    }
    match self.normal.try_recv() {
      Ok(message) => Ok(message),
      Err(crossbeam_channel::TryRecvError::Empty) => Err(RecvError::Timeout),
      Err(crossbeam_channel::TryRecvError::Disconnected) => Err(RecvError::Disconnected),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::message::MessageKind;

  #[test]
  fn exit_lands_even_when_normal_lane_full() {
    let (tx, rx) = channel(1);
    tx.send(Message::new(
      MessageKind::Query {
        name: "a".into(),
        signal_needed: false,
      },
      0,
      "front",
    ))
    .unwrap();
    // Normal lane is now full (capacity 1); exit must still land.
    tx.send(Message::new(MessageKind::Exit, 1, "front")).unwrap();

    let first = rx.recv_timeout(Duration::from_millis(50)).unwrap();
    assert!(matches!(first.kind, MessageKind::Exit));
  }

  #[test]
  fn normal_messages_are_delivered_in_order() {
    let (tx, rx) = channel(4);
    for i in 0..3u64 {
      tx.send(Message::new(
        MessageKind::Query {
          name: format!("v{i}"),
          signal_needed: false,
        },
        i,
        "front",
      ))
      .unwrap();
    }
    for i in 0..3u64 {
      let m = rx.recv_timeout(Duration::from_millis(50)).unwrap();
      assert_eq!(m.id, i);
    }
  }
}
