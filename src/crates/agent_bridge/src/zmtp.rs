//! ZeroMQ message transport (ZMTP 3.0, NULL mechanism) over a blocking TCP stream.
//!
//! Covers what a single REQ/REP pair needs: the 64-byte greeting, the READY
//! handshake carrying the socket type, and multi-frame messages. Agents built
//! on any ZeroMQ binding talk to the bridge with a plain REP socket.

use std::io::{self, ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::{BridgeError, BridgeResult};

const GREETING_LEN: usize = 64;
const SIGNATURE_HEAD: u8 = 0xFF;
const SIGNATURE_TAIL: u8 = 0x7F;
const VERSION_MAJOR: u8 = 3;
const VERSION_MINOR: u8 = 0;
const MECHANISM: &[u8] = b"NULL";
const MECHANISM_FIELD: std::ops::Range<usize> = 12..32;

const FLAG_MORE: u8 = 0x01;
const FLAG_LONG: u8 = 0x02;
const FLAG_COMMAND: u8 = 0x04;

/// Upper bound on handshake command bodies.
const MAX_COMMAND_LEN: usize = 4096;
/// Upper bound on frames in one message.
const MAX_FRAMES: usize = 16;

/// Empty frame separating the REQ/REP envelope from the body.
pub(crate) const DELIMITER: &[u8] = &[];

/// Which end of the request/reply pair this stream speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SocketType {
    Req,
    Rep,
}

impl SocketType {
    fn name(self) -> &'static str {
        match self {
            SocketType::Req => "REQ",
            SocketType::Rep => "REP",
        }
    }

    fn accepts(self, peer: &[u8]) -> bool {
        match self {
            SocketType::Req => peer == b"REP" || peer == b"ROUTER",
            SocketType::Rep => peer == b"REQ" || peer == b"DEALER",
        }
    }
}

/// Point in time an operation has to finish by, and the error raised after it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    at: Option<Instant>,
    bound: Duration,
    expired: fn(Duration) -> BridgeError,
}

impl Deadline {
    /// `bound` from now. A bound too large to represent never expires.
    pub(crate) fn after(bound: Duration, expired: fn(Duration) -> BridgeError) -> Self {
        Self {
            at: Instant::now().checked_add(bound),
            bound,
            expired,
        }
    }

    pub(crate) fn never(expired: fn(Duration) -> BridgeError) -> Self {
        Self {
            at: None,
            bound: Duration::MAX,
            expired,
        }
    }

    /// Time left, `None` when unbounded. Fails once the deadline has passed.
    pub(crate) fn remaining(&self) -> BridgeResult<Option<Duration>> {
        match self.at {
            None => Ok(None),
            Some(at) => {
                let remaining = at.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    Err(self.expired())
                } else {
                    Ok(Some(remaining))
                }
            }
        }
    }

    pub(crate) fn expired(&self) -> BridgeError {
        (self.expired)(self.bound)
    }
}

/// Send our greeting and READY command.
///
/// Writing first never waits on the peer, so both ends can announce before
/// either reads.
pub(crate) fn announce(
    stream: &mut TcpStream,
    own: SocketType,
    deadline: &Deadline,
) -> BridgeResult<()> {
    let mut bytes = greeting().to_vec();
    encode_ready(own, &mut bytes);
    write_all_until(stream, &bytes, deadline)
}

/// Read the peer's greeting and READY command and check the socket types match.
pub(crate) fn expect_peer(
    stream: &mut TcpStream,
    own: SocketType,
    deadline: &Deadline,
) -> BridgeResult<()> {
    let mut greeting = [0u8; GREETING_LEN];
    read_exact_until(stream, &mut greeting, deadline)?;
    check_greeting(&greeting)?;

    let frame = read_frame(stream, deadline, MAX_COMMAND_LEN)?;
    if !frame.is_command() {
        return Err(handshake_failed("expected READY command"));
    }
    let (name, properties) = split_command(&frame.body)?;
    match name {
        b"READY" => {
            let peer = find_property(properties, b"Socket-Type")?
                .ok_or_else(|| handshake_failed("READY without Socket-Type"))?;
            if !own.accepts(peer) {
                return Err(handshake_failed(format!(
                    "{} socket cannot talk to {}",
                    own.name(),
                    String::from_utf8_lossy(peer)
                )));
            }
            debug!(own = own.name(), peer = %String::from_utf8_lossy(peer), "zmtp handshake complete");
            Ok(())
        }
        b"ERROR" => {
            let reason = properties.get(1..).unwrap_or_default();
            Err(handshake_failed(format!(
                "peer refused: {}",
                String::from_utf8_lossy(reason)
            )))
        }
        other => Err(handshake_failed(format!(
            "unexpected command {}",
            String::from_utf8_lossy(other)
        ))),
    }
}

/// Full handshake for the side that already has the connection in hand.
pub(crate) fn handshake(
    stream: &mut TcpStream,
    own: SocketType,
    deadline: &Deadline,
) -> BridgeResult<()> {
    announce(stream, own, deadline)?;
    expect_peer(stream, own, deadline)
}

/// Write `frames` as one message.
pub(crate) fn write_message(
    stream: &mut TcpStream,
    frames: &[&[u8]],
    deadline: &Deadline,
) -> BridgeResult<()> {
    let bytes = encode_message(frames);
    trace!(frames = frames.len(), bytes = bytes.len(), "writing message");
    write_all_until(stream, &bytes, deadline)
}

/// Read one message, skipping interleaved commands such as heartbeats.
pub(crate) fn read_message(
    stream: &mut TcpStream,
    deadline: &Deadline,
    max_frame_len: usize,
) -> BridgeResult<Vec<Vec<u8>>> {
    let mut frames = Vec::new();
    loop {
        let frame = read_frame(stream, deadline, max_frame_len)?;
        if frame.is_command() {
            trace!(flags = frame.flags, "skipping command frame");
            continue;
        }
        let more = frame.more();
        frames.push(frame.body);
        if !more {
            return Ok(frames);
        }
        if frames.len() >= MAX_FRAMES {
            return Err(BridgeError::malformed(format!(
                "message has more than {MAX_FRAMES} frames"
            )));
        }
    }
}

/// Strip the REQ envelope from a reply, leaving its single body frame.
pub(crate) fn unwrap_reply(frames: Vec<Vec<u8>>) -> BridgeResult<Vec<u8>> {
    let count = frames.len();
    match <[Vec<u8>; 2]>::try_from(frames) {
        Ok([delimiter, body]) if delimiter.is_empty() => Ok(body),
        _ => Err(BridgeError::malformed(format!(
            "reply must be one frame behind an empty delimiter, got {count} frames"
        ))),
    }
}

/// Split a request into the envelope to echo back and its single body frame.
pub(crate) fn split_request(mut frames: Vec<Vec<u8>>) -> BridgeResult<(Vec<Vec<u8>>, Vec<u8>)> {
    let delimiter = frames
        .iter()
        .position(Vec::is_empty)
        .ok_or_else(|| BridgeError::malformed("request has no envelope delimiter"))?;
    let mut rest = frames.split_off(delimiter + 1);
    match (rest.pop(), rest.is_empty()) {
        (Some(body), true) => Ok((frames, body)),
        _ => Err(BridgeError::malformed("request must carry exactly one body frame")),
    }
}

#[derive(Debug)]
struct Frame {
    flags: u8,
    body: Vec<u8>,
}

impl Frame {
    fn more(&self) -> bool {
        self.flags & FLAG_MORE != 0
    }

    fn is_command(&self) -> bool {
        self.flags & FLAG_COMMAND != 0
    }
}

fn greeting() -> [u8; GREETING_LEN] {
    let mut bytes = [0u8; GREETING_LEN];
    bytes[0] = SIGNATURE_HEAD;
    bytes[9] = SIGNATURE_TAIL;
    bytes[10] = VERSION_MAJOR;
    bytes[11] = VERSION_MINOR;
    bytes[MECHANISM_FIELD.start..MECHANISM_FIELD.start + MECHANISM.len()].copy_from_slice(MECHANISM);
    // as-server and filler stay zero
    bytes
}

fn check_greeting(greeting: &[u8; GREETING_LEN]) -> BridgeResult<()> {
    if greeting[0] != SIGNATURE_HEAD || greeting[9] & 0x01 == 0 {
        return Err(handshake_failed("peer is not speaking ZMTP"));
    }
    if greeting[10] < VERSION_MAJOR {
        return Err(handshake_failed(format!(
            "unsupported ZMTP version {}.{}",
            greeting[10], greeting[11]
        )));
    }
    let mechanism = &greeting[MECHANISM_FIELD];
    let end = mechanism
        .iter()
        .position(|byte| *byte == 0)
        .unwrap_or(mechanism.len());
    if &mechanism[..end] != MECHANISM {
        return Err(handshake_failed(format!(
            "unsupported security mechanism {}",
            String::from_utf8_lossy(&mechanism[..end])
        )));
    }
    Ok(())
}

fn encode_ready(own: SocketType, out: &mut Vec<u8>) {
    let value = own.name().as_bytes();
    let mut body = Vec::with_capacity(32);
    push_short(&mut body, b"READY");
    push_short(&mut body, b"Socket-Type");
    body.extend_from_slice(&(value.len() as u32).to_be_bytes());
    body.extend_from_slice(value);
    encode_frame(FLAG_COMMAND, &body, out);
}

fn push_short(out: &mut Vec<u8>, text: &[u8]) {
    out.push(text.len() as u8);
    out.extend_from_slice(text);
}

fn split_command(body: &[u8]) -> BridgeResult<(&[u8], &[u8])> {
    let (&len, rest) = body
        .split_first()
        .ok_or_else(|| handshake_failed("empty command"))?;
    let len = usize::from(len);
    if rest.len() < len {
        return Err(handshake_failed("truncated command name"));
    }
    Ok(rest.split_at(len))
}

/// Look up a metadata property; names compare case-insensitively.
fn find_property<'a>(mut properties: &'a [u8], wanted: &[u8]) -> BridgeResult<Option<&'a [u8]>> {
    let truncated = || handshake_failed("truncated READY metadata");
    while let Some((&name_len, rest)) = properties.split_first() {
        let name_len = usize::from(name_len);
        let name = rest.get(..name_len).ok_or_else(truncated)?;
        let rest = &rest[name_len..];
        let len_bytes: [u8; 4] = rest
            .get(..4)
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(truncated)?;
        let value_len = u32::from_be_bytes(len_bytes) as usize;
        let rest = &rest[4..];
        let value = rest.get(..value_len).ok_or_else(truncated)?;
        if name.eq_ignore_ascii_case(wanted) {
            return Ok(Some(value));
        }
        properties = &rest[value_len..];
    }
    Ok(None)
}

fn encode_frame(flags: u8, body: &[u8], out: &mut Vec<u8>) {
    match u8::try_from(body.len()) {
        Ok(len) => {
            out.push(flags);
            out.push(len);
        }
        Err(_) => {
            out.push(flags | FLAG_LONG);
            out.extend_from_slice(&(body.len() as u64).to_be_bytes());
        }
    }
    out.extend_from_slice(body);
}

fn encode_message(frames: &[&[u8]]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(frames.iter().map(|frame| frame.len() + 9).sum());
    for (index, frame) in frames.iter().enumerate() {
        let flags = if index + 1 < frames.len() { FLAG_MORE } else { 0 };
        encode_frame(flags, frame, &mut bytes);
    }
    bytes
}

fn read_frame(stream: &mut TcpStream, deadline: &Deadline, max_len: usize) -> BridgeResult<Frame> {
    let mut head = [0u8; 2];
    read_exact_until(stream, &mut head, deadline)?;
    let flags = head[0];
    let len = if flags & FLAG_LONG != 0 {
        let mut size = [0u8; 8];
        size[0] = head[1];
        read_exact_until(stream, &mut size[1..], deadline)?;
        usize::try_from(u64::from_be_bytes(size)).unwrap_or(usize::MAX)
    } else {
        usize::from(head[1])
    };
    if len > max_len {
        return Err(BridgeError::FrameTooLarge { len, max: max_len });
    }

    let mut body = vec![0u8; len];
    read_exact_until(stream, &mut body, deadline)?;
    Ok(Frame { flags, body })
}

fn write_all_until(stream: &mut TcpStream, bytes: &[u8], deadline: &Deadline) -> BridgeResult<()> {
    stream.set_write_timeout(deadline.remaining()?)?;
    stream
        .write_all(bytes)
        .and_then(|_| stream.flush())
        .map_err(|err| classify(err, deadline))
}

fn read_exact_until(stream: &mut TcpStream, buf: &mut [u8], deadline: &Deadline) -> BridgeResult<()> {
    stream.set_read_timeout(deadline.remaining()?)?;
    stream
        .read_exact(buf)
        .map_err(|err| classify(err, deadline))
}

fn classify(err: io::Error, deadline: &Deadline) -> BridgeError {
    match err.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => deadline.expired(),
        ErrorKind::UnexpectedEof
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe => BridgeError::PeerDisconnected,
        _ => BridgeError::Io(err),
    }
}

fn handshake_failed(reason: impl Into<String>) -> BridgeError {
    BridgeError::Handshake(reason.into())
}
