//! Wire shape of the step exchange.
//!
//! Both directions are single JSON objects with PascalCase field names so an
//! operator can read captured frames directly.

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

/// Episode status codes carried in the `Status` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpisodeStatus {
    Ongoing,
    Failure,
    Success,
}

impl EpisodeStatus {
    /// Numeric code sent on the wire.
    pub fn code(self) -> f64 {
        match self {
            EpisodeStatus::Ongoing => 0.0,
            EpisodeStatus::Failure => 1.0,
            EpisodeStatus::Success => 2.0,
        }
    }

    /// Interpret a raw status value; anything outside the known codes is `None`.
    pub fn from_code(code: f64) -> Option<Self> {
        if code == 0.0 {
            Some(EpisodeStatus::Ongoing)
        } else if code == 1.0 {
            Some(EpisodeStatus::Failure)
        } else if code == 2.0 {
            Some(EpisodeStatus::Success)
        } else {
            None
        }
    }
}

/// Request sent to the agent at each decision point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentRequest {
    pub status: f64,
    pub episode_number: f64,
    pub reward: f64,
    pub states: Vec<f64>,
}

impl AgentRequest {
    pub fn new(status: f64, episode_number: f64, reward: f64, states: Vec<f64>) -> Self {
        Self {
            status,
            episode_number,
            reward,
            states,
        }
    }

    /// Status as a known code, if it is one.
    pub fn episode_status(&self) -> Option<EpisodeStatus> {
        EpisodeStatus::from_code(self.status)
    }
}

/// The agent's answer to a single request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentResponse {
    pub action: f64,
    pub is_no_op: bool,
}

impl AgentResponse {
    pub fn act(action: f64) -> Self {
        Self {
            action,
            is_no_op: false,
        }
    }

    pub fn no_op(action: f64) -> Self {
        Self {
            action,
            is_no_op: true,
        }
    }
}

/// Encode a request frame.
///
/// JSON has no representation for NaN or infinities, so those are rejected here
/// rather than silently turned into `null`.
pub fn encode_request(request: &AgentRequest) -> BridgeResult<String> {
    ensure_finite("Status", request.status)?;
    ensure_finite("EpisodeNumber", request.episode_number)?;
    ensure_finite("Reward", request.reward)?;
    for (index, value) in request.states.iter().enumerate() {
        ensure_finite(&format!("States[{index}]"), *value)?;
    }
    Ok(serde_json::to_string(request)?)
}

/// Decode a response frame. Unknown fields are ignored; a missing or mistyped
/// `Action` or `IsNoOp` is malformed.
pub fn decode_response(text: &str) -> BridgeResult<AgentResponse> {
    serde_json::from_str(text).map_err(|err| BridgeError::malformed(err.to_string()))
}

/// Decode a request frame on the agent side.
pub fn decode_request(text: &str) -> BridgeResult<AgentRequest> {
    serde_json::from_str(text).map_err(|err| BridgeError::malformed(err.to_string()))
}

/// Encode a response frame on the agent side.
pub fn encode_response(response: &AgentResponse) -> BridgeResult<String> {
    ensure_finite("Action", response.action)?;
    Ok(serde_json::to_string(response)?)
}

fn ensure_finite(field: &str, value: f64) -> BridgeResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(BridgeError::non_finite(field))
    }
}
