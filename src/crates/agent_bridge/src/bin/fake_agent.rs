//! Scripted stand-in for a learning agent.
//!
//! Usage: `fake_agent <bridge-addr> <script-file>`
//!
//! Each non-empty script line answers one request:
//! - a JSON object is sent back verbatim,
//! - `echo` replies with the first observation as the action,
//! - `noop` replies with a no-op,
//! - `silent` swallows the request, waits for the bridge to give up and reconnects.
//!
//! Every request is printed as `request <json>` so tests can inspect traffic.

use std::net::SocketAddr;
use std::time::Duration;

use sim_agent_bridge::{AgentEndpoint, AgentResponse, BridgeError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HANGUP_TIMEOUT: Duration = Duration::from_secs(10);

enum Reply {
    Raw(String),
    Echo,
    NoOp,
    Silent,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let addr: SocketAddr = args
        .next()
        .ok_or("missing bridge address argument")?
        .parse()?;
    let script_path = args.next().ok_or("missing script path argument")?;
    let script = parse_script(&std::fs::read_to_string(script_path)?);

    let mut endpoint = AgentEndpoint::connect(addr, CONNECT_TIMEOUT)?;
    println!("connected to {addr}");

    for reply in script {
        let request = match endpoint.recv_raw(None) {
            Ok(request) => request,
            Err(BridgeError::PeerDisconnected) => break,
            Err(err) => return Err(err.into()),
        };
        println!("request {request}");

        match reply {
            Reply::Raw(text) => endpoint.send_raw(&text)?,
            Reply::Echo => {
                let decoded = sim_agent_bridge::decode_request(&request)?;
                let action = decoded.states.first().copied().unwrap_or(0.0);
                endpoint.send_response(&AgentResponse::act(action))?;
            }
            Reply::NoOp => endpoint.send_response(&AgentResponse::no_op(0.0))?,
            Reply::Silent => {
                endpoint.wait_for_hangup(HANGUP_TIMEOUT)?;
                drop(endpoint);
                endpoint = AgentEndpoint::connect(addr, CONNECT_TIMEOUT)?;
                println!("reconnected to {addr}");
            }
        }
    }

    println!("script complete");
    Ok(())
}

fn parse_script(text: &str) -> Vec<Reply> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| match line {
            "echo" => Reply::Echo,
            "noop" => Reply::NoOp,
            "silent" => Reply::Silent,
            other => Reply::Raw(other.to_string()),
        })
        .collect()
}
