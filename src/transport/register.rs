//! [`RegisterTransport`]: the synchronous Modbus/TCP client used by register
//! devices (spec §4.3.2 — today just the XraySource/GeniX family). Unlike
//! [`super::stream::StreamTransport`] there is no send queue, no framer and
//! no separate thread: every call is a request/reply round trip, performed
//! inline on whichever thread the ProtocolAdapter is running on (the
//! Supervisor's own thread).

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use bit_vec::BitVec;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::TransportError;

const READ_HOLDING_REGISTERS: u8 = 0x03;
const WRITE_SINGLE_REGISTER: u8 = 0x06;
const READ_COILS: u8 = 0x01;
const WRITE_SINGLE_COIL: u8 = 0x05;
const MAX_RETRIES: u32 = 3;

/// A blocking Modbus/TCP client with automatic reconnect. Holds its
/// connection behind a mutex rather than `&mut self` because
/// `crate::protocol::AdapterContext::register` hands adapters a shared
/// reference — several register calls inside one `query`/`execute` may need
/// to happen back to back without the caller juggling mutability.
pub struct RegisterTransport {
  addr: SocketAddr,
  unit_id: u8,
  timeout: Duration,
  stream: Mutex<Option<TcpStream>>,
  transaction_id: AtomicU16,
}

impl RegisterTransport {
  pub fn new(addr: SocketAddr, unit_id: u8, timeout: Duration) -> Self {
    RegisterTransport {
      addr,
      unit_id,
      timeout,
      stream: Mutex::new(None),
      transaction_id: AtomicU16::new(0),
    }
  }

  pub fn read_register(&self, register: u16) -> Result<u16, TransportError> {
    let mut payload = Vec::with_capacity(4);
    payload.write_u16::<BigEndian>(register).unwrap();
    payload.write_u16::<BigEndian>(1).unwrap();
    let reply = self.transact(READ_HOLDING_REGISTERS, &payload)?;
    // byte count (1) + 2 data bytes
    if reply.len() < 3 {
      return Err(TransportError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "short register reply",
      )));
    }
    Ok(u16::from_be_bytes([reply[1], reply[2]]))
  }

  pub fn write_register(&self, register: u16, value: u16) -> Result<(), TransportError> {
    let mut payload = Vec::with_capacity(4);
    payload.write_u16::<BigEndian>(register).unwrap();
    payload.write_u16::<BigEndian>(value).unwrap();
    self.transact(WRITE_SINGLE_REGISTER, &payload)?;
    Ok(())
  }

  pub fn read_coil(&self, coil: u16) -> Result<bool, TransportError> {
    let mut payload = Vec::with_capacity(4);
    payload.write_u16::<BigEndian>(coil).unwrap();
    payload.write_u16::<BigEndian>(1).unwrap();
    let reply = self.transact(READ_COILS, &payload)?;
    if reply.len() < 2 {
      return Err(TransportError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "short coil reply",
      )));
    }
    Ok(reply[1] & 0x01 != 0)
  }

  /// Read `count` consecutive coils starting at `start`, returned in the
  /// device's own bit order (coil `start` is bit 0). Modbus packs coils
  /// LSB-first within each reply byte, the opposite of `BitVec::from_bytes`,
  /// so bits are set one at a time rather than constructed from the raw
  /// byte slice.
  pub fn read_coils(&self, start: u16, count: u16) -> Result<BitVec, TransportError> {
    let mut payload = Vec::with_capacity(4);
    payload.write_u16::<BigEndian>(start).unwrap();
    payload.write_u16::<BigEndian>(count).unwrap();
    let reply = self.transact(READ_COILS, &payload)?;
    if reply.is_empty() {
      return Err(TransportError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "empty coil reply",
      )));
    }
    let byte_count = reply[0] as usize;
    let bytes = &reply[1..];
    if bytes.len() < byte_count {
      return Err(TransportError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "short coil reply",
      )));
    }
    let mut bits = BitVec::from_elem(count as usize, false);
    for i in 0..count as usize {
      if bytes[i / 8] & (1 << (i % 8)) != 0 {
        bits.set(i, true);
      }
    }
    Ok(bits)
  }

  pub fn write_coil(&self, coil: u16, value: bool) -> Result<(), TransportError> {
    let mut payload = Vec::with_capacity(4);
    payload.write_u16::<BigEndian>(coil).unwrap();
    payload
      .write_u16::<BigEndian>(if value { 0xFF00 } else { 0x0000 })
      .unwrap();
    self.transact(WRITE_SINGLE_COIL, &payload)?;
    Ok(())
  }

  /// Perform one MBAP-framed request/reply, retrying up to
  /// [`MAX_RETRIES`] times and reconnecting whenever the socket looks
  /// closed, matching the original `device_modbustcp.py` retry loop.
  fn transact(&self, function: u8, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
    let mut last_err = None;
    for _attempt in 0..MAX_RETRIES {
      match self.transact_once(function, payload) {
        Ok(reply) => return Ok(reply),
        Err(e) => {
          self.drop_connection();
          last_err = Some(e);
        }
      }
    }
    Err(last_err.unwrap_or(TransportError::RetriesExhausted(MAX_RETRIES)))
  }

  fn transact_once(&self, function: u8, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
    let mut guard = self.stream.lock().unwrap();
    if guard.is_none() {
      *guard = Some(self.connect()?);
    }
    let stream = guard.as_mut().unwrap();

    let transaction_id = self.transaction_id.fetch_add(1, Ordering::Relaxed);
    let mut request = Vec::with_capacity(8 + payload.len());
    request.write_u16::<BigEndian>(transaction_id).unwrap();
    request.write_u16::<BigEndian>(0).unwrap(); // protocol id, always 0
    request
      .write_u16::<BigEndian>((payload.len() + 2) as u16)
      .unwrap();
    request.push(self.unit_id);
    request.push(function);
    request.extend_from_slice(payload);

    stream.write_all(&request)?;

    let mut header = [0u8; 7];
    stream.read_exact(&mut header)?;
    let length = u16::from_be_bytes([header[4], header[5]]) as usize;
    if length < 2 {
      return Err(TransportError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "MBAP length too short",
      )));
    }
    let mut body = vec![0u8; length - 2];
    stream.read_exact(&mut body)?;

    let reply_function = body[0];
    if reply_function & 0x80 != 0 {
      let exception_code = body.get(1).copied().unwrap_or(0);
      return Err(TransportError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("Modbus exception 0x{exception_code:02x}"),
      )));
    }
    Ok(body[1..].to_vec())
  }

  fn connect(&self) -> Result<TcpStream, TransportError> {
    let stream = TcpStream::connect_timeout(&self.addr, self.timeout)?;
    stream.set_read_timeout(Some(self.timeout))?;
    stream.set_write_timeout(Some(self.timeout))?;
    stream.set_nodelay(true)?;
    Ok(stream)
  }

  fn drop_connection(&self) {
    *self.stream.lock().unwrap() = None;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Read as _;
  use std::net::TcpListener;
  use std::thread;

  #[test]
  fn read_register_round_trips_through_mbap_framing() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
      let (mut conn, _) = listener.accept().unwrap();
      let mut request = [0u8; 12];
      conn.read_exact(&mut request).unwrap();
      assert_eq!(request[7], READ_HOLDING_REGISTERS);
      let reply = [
        request[0], request[1], 0x00, 0x00, 0x00, 0x05, 0x01, READ_HOLDING_REGISTERS, 0x02, 0x12,
        0x34,
      ];
      conn.write_all(&reply).unwrap();
    });

    let transport = RegisterTransport::new(addr, 1, Duration::from_secs(1));
    let value = transport.read_register(40001).unwrap();
    assert_eq!(value, 0x1234);
    server.join().unwrap();
  }
}
