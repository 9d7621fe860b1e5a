use std::io::{self, ErrorKind};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::config::ConnectionConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::zmtp::{self, Deadline, SocketType, DELIMITER};

/// Request-initiating side of a strict request/reply exchange.
///
/// Every successful send must be followed by exactly one receive before the
/// next send.
pub trait RequestChannel {
    /// Hand `payload` to the transport as one frame within `timeout`.
    fn send_with_timeout(&mut self, payload: &str, timeout: Duration) -> BridgeResult<()>;

    /// Wait up to `timeout` for the reply to the last request.
    fn receive_with_timeout(&mut self, timeout: Duration) -> BridgeResult<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Turn {
    ReadyToSend,
    AwaitingReply,
}

/// Bound endpoint the agent connects to for the duration of one simulation run.
///
/// The simulation side binds a ZeroMQ REQ endpoint; the agent dials in with a
/// REP socket. The first send after opening (or after the agent dropped)
/// accepts the pending connection and completes the ZMTP handshake within the
/// send bound. Each request and reply is one UTF-8 frame behind the usual
/// empty delimiter.
#[derive(Debug)]
pub struct Channel {
    listener: Option<TcpListener>,
    peer: Option<TcpStream>,
    turn: Turn,
    local_addr: SocketAddr,
    accept_poll_interval: Duration,
    max_frame_len: usize,
}

impl Channel {
    /// Bind a new channel to the configured address.
    pub fn open(config: &ConnectionConfig) -> BridgeResult<Self> {
        let address = config.address();
        let bind_failure = |source: io::Error| BridgeError::BindFailure {
            address: address.clone(),
            source,
        };

        let listener = TcpListener::bind(&address).map_err(bind_failure)?;
        listener.set_nonblocking(true).map_err(bind_failure)?;
        let local_addr = listener.local_addr().map_err(bind_failure)?;
        info!(%local_addr, "agent channel bound");

        Ok(Self {
            listener: Some(listener),
            peer: None,
            turn: Turn::ReadyToSend,
            local_addr,
            accept_poll_interval: config.accept_poll_interval.max(Duration::from_millis(1)),
            max_frame_len: config.max_frame_len,
        })
    }

    /// Address the channel is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the channel is still bound, i.e. `close` has not run.
    pub fn is_open(&self) -> bool {
        self.listener.is_some()
    }

    /// Whether an agent connection is currently held.
    pub fn has_peer(&self) -> bool {
        self.peer.is_some()
    }

    /// Whether a request has been sent and its reply not yet received.
    pub fn awaiting_reply(&self) -> bool {
        self.turn == Turn::AwaitingReply
    }

    /// Release the socket. Calling this more than once is a no-op.
    pub fn close(&mut self) {
        let had_peer = self.drop_peer();
        if self.listener.take().is_some() {
            info!(local_addr = %self.local_addr, had_peer, "agent channel closed");
        }
        self.turn = Turn::ReadyToSend;
    }

    fn drop_peer(&mut self) -> bool {
        match self.peer.take() {
            Some(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
                true
            }
            None => false,
        }
    }

    /// Return a live agent connection, accepting a new one if needed.
    fn connected_peer(&mut self, deadline: &Deadline) -> BridgeResult<&mut TcpStream> {
        let stale = self.peer.as_ref().is_some_and(|stream| !peer_is_idle(stream));
        if stale {
            debug!(local_addr = %self.local_addr, "agent connection went away, waiting for reconnect");
            self.drop_peer();
        }

        if self.peer.is_none() {
            let listener = self.listener.as_ref().ok_or(BridgeError::ChannelClosed)?;
            let stream = accept_until(listener, deadline, self.accept_poll_interval)?;
            self.peer = Some(stream);
        }

        self.peer.as_mut().ok_or(BridgeError::PeerDisconnected)
    }
}

impl RequestChannel for Channel {
    fn send_with_timeout(&mut self, payload: &str, timeout: Duration) -> BridgeResult<()> {
        if !self.is_open() {
            return Err(BridgeError::ChannelClosed);
        }
        if self.turn == Turn::AwaitingReply {
            return Err(BridgeError::OutOfSequence(
                "send issued while a reply is still pending",
            ));
        }
        if payload.len() > self.max_frame_len {
            return Err(BridgeError::FrameTooLarge {
                len: payload.len(),
                max: self.max_frame_len,
            });
        }

        let deadline = Deadline::after(timeout, BridgeError::SendTimeout);
        let stream = self.connected_peer(&deadline)?;
        match zmtp::write_message(stream, &[DELIMITER, payload.as_bytes()], &deadline) {
            Ok(()) => {
                trace!(bytes = payload.len(), "request frame sent");
                self.turn = Turn::AwaitingReply;
                Ok(())
            }
            Err(err) => {
                // A partially written frame leaves the stream unusable.
                self.drop_peer();
                Err(err)
            }
        }
    }

    fn receive_with_timeout(&mut self, timeout: Duration) -> BridgeResult<String> {
        if !self.is_open() {
            return Err(BridgeError::ChannelClosed);
        }
        if self.turn != Turn::AwaitingReply {
            return Err(BridgeError::OutOfSequence(
                "receive issued without a pending request",
            ));
        }
        // The exchange ends here whether or not a reply arrives.
        self.turn = Turn::ReadyToSend;

        let deadline = Deadline::after(timeout, BridgeError::ReceiveTimeout);
        let max_frame_len = self.max_frame_len;
        let stream = self.peer.as_mut().ok_or(BridgeError::PeerDisconnected)?;
        let frames = match zmtp::read_message(stream, &deadline, max_frame_len) {
            Ok(frames) => frames,
            Err(err) => {
                // A late reply must never be paired with the next request.
                warn!(error = %err, "dropping agent connection after failed receive");
                self.drop_peer();
                return Err(err);
            }
        };

        let bytes = zmtp::unwrap_reply(frames)?;
        trace!(bytes = bytes.len(), "reply frame received");
        String::from_utf8(bytes)
            .map_err(|err| BridgeError::malformed(format!("reply is not valid UTF-8: {err}")))
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

fn accept_until(
    listener: &TcpListener,
    deadline: &Deadline,
    poll_interval: Duration,
) -> BridgeResult<TcpStream> {
    loop {
        match listener.accept() {
            Ok((mut stream, addr)) => {
                // Accepted sockets may inherit non-blocking mode from the listener.
                stream.set_nonblocking(false)?;
                stream.set_nodelay(true)?;
                match zmtp::handshake(&mut stream, SocketType::Req, deadline) {
                    Ok(()) => {
                        info!(peer_addr = %addr, "agent connected");
                        return Ok(stream);
                    }
                    Err(err) if err.is_timeout() => return Err(err),
                    Err(err) => {
                        warn!(peer_addr = %addr, error = %err, "rejecting agent connection");
                        let _ = stream.shutdown(Shutdown::Both);
                    }
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                let wait = deadline
                    .remaining()?
                    .map_or(poll_interval, |left| left.min(poll_interval));
                thread::sleep(wait);
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

/// True when the agent is still connected and has nothing unread queued.
///
/// Unsolicited bytes between exchanges cannot belong to any request, so such a
/// connection is treated as unusable too.
fn peer_is_idle(stream: &TcpStream) -> bool {
    if stream.set_nonblocking(true).is_err() {
        return false;
    }
    let mut probe = [0u8; 1];
    let idle = match stream.peek(&mut probe) {
        Ok(_) => false,
        Err(err) => err.kind() == ErrorKind::WouldBlock,
    };
    stream.set_nonblocking(false).is_ok() && idle
}
