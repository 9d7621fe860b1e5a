//! Blocking request/reply bridge between a discrete-event simulation and an
//! external decision agent.
//!
//! At every decision point the simulation sends the current status, episode,
//! reward and observation vector, then waits for the agent's action before
//! resuming. The simulation binds a ZeroMQ REQ endpoint (ZMTP 3.0 over TCP);
//! agents connect with a REP socket from any ZeroMQ binding, or with
//! [`AgentEndpoint`].
//!
//! Typical usage:
//! ```no_run
//! use std::sync::Arc;
//! use sim_agent_bridge::{
//!     AgentConnection, AgentWaitStep, Branch, ConnectionConfig, MemoryHost, SimulationStep,
//!     StepConfig,
//! };
//!
//! let connection = Arc::new(AgentConnection::new(ConnectionConfig::new(5000)));
//! let step = AgentWaitStep::new(
//!     connection.clone(),
//!     StepConfig::new().with_states(["QueueLength", "Utilization"]),
//! )
//! .expect("bindings should be valid");
//!
//! let mut host = MemoryHost::new()
//!     .with_state("Status", 0.0)
//!     .with_state("EpisodeNumber", 1.0)
//!     .with_state("Reward", 0.0)
//!     .with_state("Action", 0.0)
//!     .with_state("QueueLength", 4.0)
//!     .with_state("Utilization", 0.8);
//!
//! let _run = connection.start_run().expect("port should be free");
//! match step.execute(&mut host).branch() {
//!     Some(Branch::First) => println!("agent chose {:?}", host.get("Action")),
//!     Some(Branch::Alternate) => println!("agent skipped this decision"),
//!     None => println!("exchange failed: {:?}", host.errors()),
//! }
//! ```

mod channel;
mod codec;
mod config;
mod driver;
mod endpoint;
mod error;
mod host;
mod lifecycle;
mod zmtp;

pub use channel::{Channel, RequestChannel};
pub use codec::{
    decode_request, decode_response, encode_request, encode_response, AgentRequest,
    AgentResponse, EpisodeStatus,
};
pub use config::{
    ConnectionConfig, StepConfig, DEFAULT_EXCHANGE_TIMEOUT, DEFAULT_MAX_FRAME_LEN, DEFAULT_PORT,
};
pub use driver::{Branch, Phase, StepDriver, StepFailure, StepOutcome};
pub use endpoint::AgentEndpoint;
pub use error::{BridgeError, BridgeResult};
pub use host::{HostContext, MemoryHost};
pub use lifecycle::{AgentConnection, AgentWaitStep, RunGuard, SimulationElement, SimulationStep};
