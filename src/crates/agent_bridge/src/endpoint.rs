use std::io::{ErrorKind, Read};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::codec::{decode_request, encode_response, AgentRequest, AgentResponse};
use crate::config::DEFAULT_MAX_FRAME_LEN;
use crate::error::{BridgeError, BridgeResult};
use crate::zmtp::{self, Deadline, SocketType};

const REPLY_BOUND: Duration = Duration::from_secs(5);

/// Agent side of the bridge: a REP peer that dials a bound
/// [`Channel`](crate::Channel) and answers one request at a time.
///
/// Speaks the same ZMTP framing as any ZeroMQ REP socket, so it can stand in
/// for an agent written in another language.
#[derive(Debug)]
pub struct AgentEndpoint {
    stream: TcpStream,
    peer_addr: SocketAddr,
    max_frame_len: usize,
    greeted: bool,
    /// Routing envelope of the request awaiting a reply.
    envelope: Option<Vec<Vec<u8>>>,
}

impl AgentEndpoint {
    /// Connect to a bridge, retrying until `timeout` elapses. The simulation
    /// may bind after the agent has started.
    ///
    /// The bridge only accepts when it sends its first request, so the
    /// handshake finishes on the first receive.
    pub fn connect(addr: SocketAddr, timeout: Duration) -> BridgeResult<Self> {
        let deadline = Deadline::after(timeout, BridgeError::ConnectTimeout);
        loop {
            let attempt = deadline
                .remaining()?
                .map_or(Duration::from_secs(5), |left| left.min(Duration::from_secs(5)));
            match TcpStream::connect_timeout(&addr, attempt) {
                Ok(mut stream) => {
                    stream.set_nodelay(true)?;
                    zmtp::announce(&mut stream, SocketType::Rep, &deadline)?;
                    info!(%addr, "connected to simulation bridge");
                    return Ok(Self {
                        stream,
                        peer_addr: addr,
                        max_frame_len: DEFAULT_MAX_FRAME_LEN,
                        greeted: false,
                        envelope: None,
                    });
                }
                Err(err) => {
                    debug!(%addr, error = %err, "bridge not reachable yet");
                    let pause = deadline
                        .remaining()?
                        .map_or(Duration::from_millis(20), |left| {
                            left.min(Duration::from_millis(20))
                        });
                    thread::sleep(pause);
                }
            }
        }
    }

    /// Override the frame size limit for incoming requests.
    pub fn with_max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max;
        self
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Wait for the next raw request frame. `None` waits indefinitely.
    pub fn recv_raw(&mut self, timeout: Option<Duration>) -> BridgeResult<String> {
        if self.envelope.is_some() {
            return Err(BridgeError::OutOfSequence(
                "previous request has not been answered",
            ));
        }
        let deadline = match timeout {
            Some(timeout) => Deadline::after(timeout, BridgeError::ReceiveTimeout),
            None => Deadline::never(BridgeError::ReceiveTimeout),
        };
        if !self.greeted {
            zmtp::expect_peer(&mut self.stream, SocketType::Rep, &deadline)?;
            self.greeted = true;
        }

        let frames = zmtp::read_message(&mut self.stream, &deadline, self.max_frame_len)?;
        let (envelope, body) = zmtp::split_request(frames)?;
        let text = String::from_utf8(body)
            .map_err(|err| BridgeError::malformed(format!("request is not valid UTF-8: {err}")))?;
        self.envelope = Some(envelope);
        Ok(text)
    }

    /// Wait for and decode the next request.
    pub fn recv_request(&mut self, timeout: Option<Duration>) -> BridgeResult<AgentRequest> {
        let text = self.recv_raw(timeout)?;
        decode_request(&text)
    }

    /// Reply to the pending request with arbitrary text.
    pub fn send_raw(&mut self, text: &str) -> BridgeResult<()> {
        let envelope = self
            .envelope
            .take()
            .ok_or(BridgeError::OutOfSequence("no request is pending a reply"))?;
        let mut frames: Vec<&[u8]> = envelope.iter().map(Vec::as_slice).collect();
        frames.push(text.as_bytes());
        let deadline = Deadline::after(REPLY_BOUND, BridgeError::SendTimeout);
        zmtp::write_message(&mut self.stream, &frames, &deadline)
    }

    /// Reply to the pending request.
    pub fn send_response(&mut self, response: &AgentResponse) -> BridgeResult<()> {
        let text = encode_response(response)?;
        self.send_raw(&text)
    }

    /// Block until the bridge hangs up, discarding anything it sends.
    ///
    /// Returns `false` if the connection is still open after `timeout`. A bridge
    /// drops the agent after a reply fails to arrive in time, so an agent that
    /// chose not to answer uses this before reconnecting.
    pub fn wait_for_hangup(&mut self, timeout: Duration) -> BridgeResult<bool> {
        let deadline = Deadline::after(timeout, BridgeError::ReceiveTimeout);
        let mut buf = [0u8; 256];
        loop {
            let remaining = match deadline.remaining() {
                Ok(remaining) => remaining,
                Err(_) => return Ok(false),
            };
            self.stream.set_read_timeout(remaining)?;
            match self.stream.read(&mut buf) {
                Ok(0) => return Ok(true),
                Ok(_) => continue,
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(false)
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(_) => return Ok(true),
            }
        }
    }

    /// Answer requests with `policy` until the bridge hangs up.
    ///
    /// Returns the number of requests answered.
    pub fn serve<F>(&mut self, mut policy: F) -> BridgeResult<u64>
    where
        F: FnMut(&AgentRequest) -> AgentResponse,
    {
        let mut answered = 0;
        loop {
            let request = match self.recv_request(None) {
                Ok(request) => request,
                Err(BridgeError::PeerDisconnected) => return Ok(answered),
                Err(err) => return Err(err),
            };
            let response = policy(&request);
            self.send_response(&response)?;
            answered += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, RequestChannel};
    use crate::codec::{decode_response, encode_request};
    use crate::config::ConnectionConfig;

    #[test]
    fn connect_gives_up_after_deadline() {
        // Bind and release a port so nothing is listening on it.
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let err = AgentEndpoint::connect(addr, Duration::from_millis(80)).unwrap_err();
        assert!(matches!(err, BridgeError::ConnectTimeout(_)), "{err:?}");
        assert!(err.is_timeout());
    }

    #[test]
    fn serves_requests_until_bridge_closes() {
        let mut channel = Channel::open(&ConnectionConfig::new(0).with_host("127.0.0.1")).unwrap();
        let addr = channel.local_addr();

        let agent = thread::spawn(move || {
            let mut endpoint = AgentEndpoint::connect(addr, Duration::from_secs(2)).unwrap();
            endpoint
                .serve(|request| AgentResponse::act(request.states.iter().sum()))
                .unwrap()
        });

        for step in 0..3 {
            let request = AgentRequest::new(0.0, 1.0, 0.0, vec![f64::from(step), 1.0]);
            channel
                .send_with_timeout(&encode_request(&request).unwrap(), Duration::from_secs(2))
                .unwrap();
            let reply = channel.receive_with_timeout(Duration::from_secs(2)).unwrap();
            let response = decode_response(&reply).unwrap();
            assert_eq!(response.action, f64::from(step) + 1.0);
        }
        channel.close();

        assert_eq!(agent.join().unwrap(), 3);
    }

    #[test]
    fn unbounded_connect_and_receive_do_not_overflow() {
        let mut channel = Channel::open(&ConnectionConfig::new(0).with_host("127.0.0.1")).unwrap();
        let addr = channel.local_addr();

        let agent = thread::spawn(move || {
            let mut endpoint = AgentEndpoint::connect(addr, Duration::MAX).unwrap();
            let request = endpoint.recv_request(Some(Duration::MAX)).unwrap();
            endpoint
                .send_response(&AgentResponse::no_op(request.reward))
                .unwrap();
            endpoint.wait_for_hangup(Duration::MAX).unwrap()
        });

        let request = AgentRequest::new(0.0, 1.0, 2.5, vec![]);
        channel
            .send_with_timeout(&encode_request(&request).unwrap(), Duration::from_secs(2))
            .unwrap();
        let reply = channel.receive_with_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(decode_response(&reply).unwrap(), AgentResponse::no_op(2.5));
        channel.close();

        assert!(agent.join().unwrap());
    }

    #[test]
    fn reply_requires_pending_request() {
        let channel = Channel::open(&ConnectionConfig::new(0).with_host("127.0.0.1")).unwrap();
        let mut endpoint =
            AgentEndpoint::connect(channel.local_addr(), Duration::from_secs(2)).unwrap();
        let err = endpoint.send_response(&AgentResponse::act(1.0)).unwrap_err();
        assert!(matches!(err, BridgeError::OutOfSequence(_)));
    }
}
