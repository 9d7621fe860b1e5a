//! One request/response exchange per decision point.
//!
//! Every invocation walks `Idle → Sending → AwaitingResponse → Applying` and
//! ends either in a branch decision or in a failure that has already been
//! reported to the host. Nothing carries over between invocations except the
//! channel the caller lends in.

use tracing::{debug, trace, warn};

use crate::channel::RequestChannel;
use crate::codec::{decode_response, encode_request, AgentRequest};
use crate::config::StepConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::host::HostContext;

/// Where an exchange was when it finished or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Sending,
    AwaitingResponse,
    Applying,
}

/// Which continuation the host should take after a completed exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    /// The agent acted.
    First,
    /// The agent declined to act.
    Alternate,
}

/// A failed exchange. The error has already been reported to the host.
#[derive(Debug)]
pub struct StepFailure {
    pub phase: Phase,
    pub error: BridgeError,
}

/// Result of a single driver invocation.
#[derive(Debug)]
pub enum StepOutcome {
    Done { branch: Branch, action: f64 },
    Failed(StepFailure),
}

impl StepOutcome {
    /// Branch to take, if the exchange completed.
    pub fn branch(&self) -> Option<Branch> {
        match self {
            StepOutcome::Done { branch, .. } => Some(*branch),
            StepOutcome::Failed(_) => None,
        }
    }

    /// Action value the agent returned, for hosts that expose a step return value.
    pub fn action(&self) -> Option<f64> {
        match self {
            StepOutcome::Done { action, .. } => Some(*action),
            StepOutcome::Failed(_) => None,
        }
    }

    /// The failure, if the exchange did not complete. Already reported to the host.
    pub fn failure(&self) -> Option<&StepFailure> {
        match self {
            StepOutcome::Done { .. } => None,
            StepOutcome::Failed(failure) => Some(failure),
        }
    }

    /// Whether the exchange completed and the action was applied.
    pub fn is_done(&self) -> bool {
        matches!(self, StepOutcome::Done { .. })
    }
}

/// Runs exchanges for one configured set of state bindings.
#[derive(Debug, Clone)]
pub struct StepDriver {
    config: StepConfig,
}

impl StepDriver {
    pub fn new(config: StepConfig) -> BridgeResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &StepConfig {
        &self.config
    }

    /// Build the request from the host's current state values.
    pub fn gather(&self, host: &dyn HostContext) -> BridgeResult<AgentRequest> {
        let status = read_state(host, &self.config.status)?;
        let episode_number = read_state(host, &self.config.episode_number)?;
        let reward = read_state(host, &self.config.reward)?;
        let states = self
            .config
            .states
            .iter()
            .map(|name| read_state(host, name))
            .collect::<BridgeResult<Vec<_>>>()?;

        Ok(AgentRequest::new(status, episode_number, reward, states))
    }

    /// Run one exchange over `channel`, applying the result to `host`.
    pub fn invoke(
        &self,
        channel: &mut dyn RequestChannel,
        host: &mut dyn HostContext,
    ) -> StepOutcome {
        let mut phase = Phase::Idle;
        match self.exchange(channel, host, &mut phase) {
            Ok((branch, action)) => {
                debug!(?branch, action, "agent exchange complete");
                StepOutcome::Done { branch, action }
            }
            Err(error) => self.fail(host, phase, error),
        }
    }

    /// Report `error` to the host and turn it into a failed outcome.
    pub(crate) fn fail(
        &self,
        host: &mut dyn HostContext,
        phase: Phase,
        error: BridgeError,
    ) -> StepOutcome {
        warn!(?phase, %error, "agent exchange failed");
        host.report_error(&error.to_string());
        StepOutcome::Failed(StepFailure { phase, error })
    }

    fn exchange(
        &self,
        channel: &mut dyn RequestChannel,
        host: &mut dyn HostContext,
        phase: &mut Phase,
    ) -> BridgeResult<(Branch, f64)> {
        let request = self.gather(host)?;
        let payload = encode_request(&request)?;

        advance(phase, Phase::Sending);
        channel.send_with_timeout(&payload, self.config.send_timeout)?;

        advance(phase, Phase::AwaitingResponse);
        let reply = channel.receive_with_timeout(self.config.receive_timeout)?;

        advance(phase, Phase::Applying);
        let response = decode_response(&reply).map_err(|err| {
            debug!(payload = %reply, "undecodable agent reply");
            err
        })?;
        host.write_state(&self.config.action, response.action)?;
        host.trace(&reply);

        let branch = if response.is_no_op {
            Branch::Alternate
        } else {
            Branch::First
        };
        Ok((branch, response.action))
    }
}

fn read_state(host: &dyn HostContext, name: &str) -> BridgeResult<f64> {
    host.read_state(name)
        .ok_or_else(|| BridgeError::MissingState(name.to_string()))
}

fn advance(phase: &mut Phase, next: Phase) {
    trace!(from = ?*phase, to = ?next, "exchange phase");
    *phase = next;
}
