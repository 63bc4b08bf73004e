//! [`StreamTransport`]: the async TCP transport (spec §4.3.1). Runs its own
//! `mio` readiness-polling loop on a dedicated thread, exchanging `Message`s
//! with its owning Supervisor over a [`crate::bus::MessageBus`] pair exactly
//! like every other inter-component link in the process.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};

use crate::bus::{BusReceiver, BusSender};
use crate::error::SupervisorError;
use crate::message::{IdAllocator, Message, MessageKind};

use super::Framer;

const SOCKET: Token = Token(0);

/// A `send` still waiting for its turn at the front of the queue.
struct QueuedSend {
  bytes: Vec<u8>,
  expected_replies: u32,
  timeout: Duration,
  asynchronous: bool,
}

/// A `send` that has gone out and is waiting on `remaining` more incoming
/// frames before it is fully resolved (spec: "pending reply stack").
struct PendingSend {
  remaining: u32,
  deadline: Instant,
  original_sent: Vec<u8>,
  asynchronous: bool,
}

/// Async, single-threaded, cooperative-readiness-polling TCP transport.
pub struct StreamTransport {
  addr: SocketAddr,
  framer: Box<dyn Framer>,
  inbound: BusReceiver,
  outbound: BusSender,
  ids: IdAllocator,
  name: String,
  poll_quantum: Duration,
}

impl StreamTransport {
  pub fn new(
    addr: SocketAddr,
    framer: Box<dyn Framer>,
    inbound: BusReceiver,
    outbound: BusSender,
    name: impl Into<String>,
  ) -> Self {
    StreamTransport {
      addr,
      framer,
      inbound,
      outbound,
      ids: IdAllocator::new(),
      name: name.into(),
      poll_quantum: Duration::from_millis(50),
    }
  }

  fn emit(&mut self, kind: MessageKind) {
    let id = self.ids.next_id();
    let _ = self.outbound.send(Message::new(kind, id, self.name.clone()));
  }

  fn fatal(&mut self, message: impl Into<String>) {
    self.emit(MessageKind::CommunicationError {
      error: SupervisorError::Communication {
        message: message.into(),
      },
    });
  }

  /// Run the event loop until `exit` is received or an unrecoverable I/O
  /// error occurs. Consumes `self`; intended to be the body of a dedicated
  /// thread spawned by the Supervisor.
  pub fn run(mut self) {
    let mut poll = match Poll::new() {
      Ok(p) => p,
      Err(e) => {
        self.fatal(format!("poll setup failed: {e}"));
        return;
      }
    };
    let mut events = Events::with_capacity(32);

    let mut stream = match TcpStream::connect(self.addr) {
      Ok(s) => s,
      Err(e) => {
        self.fatal(format!("connect to {} failed: {e}", self.addr));
        return;
      }
    };
    if let Err(e) = poll
      .registry()
      .register(&mut stream, SOCKET, Interest::READABLE | Interest::WRITABLE)
    {
      self.fatal(format!("register failed: {e}"));
      return;
    }

    let mut send_queue: VecDeque<QueuedSend> = VecDeque::new();
    let mut pending: VecDeque<PendingSend> = VecDeque::new();
    let mut clear_to_send = true;
    let mut partial: Vec<u8> = Vec::new();
    let mut killed = false;

    while !killed {
      while let Ok(msg) = self.inbound.try_recv() {
        match msg.kind {
          MessageKind::Send {
            bytes,
            expected_replies,
            timeout,
            asynchronous,
          } => send_queue.push_back(QueuedSend {
            bytes,
            expected_replies,
            timeout,
            asynchronous,
          }),
          MessageKind::Exit => killed = true,
          _ => {}
        }
      }
      if killed {
        break;
      }

      // Step 1: write the head of the send queue if we are clear to send.
      if clear_to_send {
        if let Some(req) = send_queue.pop_front() {
          match stream.write_all(&req.bytes) {
            Ok(()) => {
              if req.expected_replies > 0 {
                pending.push_back(PendingSend {
                  remaining: req.expected_replies,
                  deadline: Instant::now() + req.timeout,
                  original_sent: req.bytes,
                  asynchronous: req.asynchronous,
                });
              }
              clear_to_send = req.asynchronous || pending.is_empty();
              self.emit(MessageKind::SendComplete);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
              send_queue.push_front(req);
            }
            Err(e) => {
              self.fatal(format!("write failed: {e}"));
              break;
            }
          }
        }
      }

      // Step 2: poll for readability, bounded so the inbound bus keeps
      // getting drained even when the device is silent.
      if let Err(e) = poll.poll(&mut events, Some(self.poll_quantum)) {
        if e.kind() != io::ErrorKind::Interrupted {
          self.fatal(format!("poll failed: {e}"));
          break;
        }
      }

      let mut peer_closed = false;
      for event in events.iter() {
        if event.token() == SOCKET && event.is_readable() {
          let mut buf = [0u8; 4096];
          loop {
            match stream.read(&mut buf) {
              Ok(0) => {
                peer_closed = true;
                break;
              }
              Ok(n) => partial.extend_from_slice(&buf[..n]),
              Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
              Err(e) => {
                self.fatal(format!("read failed: {e}"));
                killed = true;
                break;
              }
            }
          }
        }
      }
      if killed {
        break;
      }
      if peer_closed {
        self.fatal("peer closed the connection");
        break;
      }

      // Step 3: frame the accumulated buffer and correlate each frame with
      // the oldest unresolved pending send.
      for frame in self.framer.find_frames(&mut partial) {
        match pending.front_mut() {
          Some(top) => {
            let original = top.original_sent.clone();
            self.emit(MessageKind::Incoming {
              bytes: frame,
              original_sent: Some(original),
            });
            top.remaining = top.remaining.saturating_sub(1);
            if top.remaining == 0 {
              pending.pop_front();
            }
            clear_to_send = pending.front().map(|p| p.asynchronous).unwrap_or(true);
          }
          None => {
            self.emit(MessageKind::CommunicationError {
              error: SupervisorError::Communication {
                message: "unsolicited frame received with no pending request".into(),
              },
            });
            self.emit(MessageKind::Incoming {
              bytes: frame,
              original_sent: None,
            });
          }
        }
      }
      if pending.is_empty() {
        clear_to_send = true;
      }

      // Step 4: timeout check on the oldest pending request.
      if let Some(top) = pending.front() {
        if Instant::now() > top.deadline {
          pending.pop_front();
          clear_to_send = pending.is_empty();
          self.emit(MessageKind::Timeout);
        }
      }
    }

    // Step 5: flush and tear down.
    send_queue.clear();
    let _ = poll.registry().deregister(&mut stream);
    self.emit(MessageKind::Exited {
      normal_termination: true,
    });
  }
}
