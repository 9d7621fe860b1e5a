use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::{BridgeError, BridgeResult};

/// Port used when the connection element does not override it.
pub const DEFAULT_PORT: u16 = 5000;

/// Bound applied to both halves of an exchange unless overridden.
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(3);

/// Largest frame either side will accept.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// Element-level configuration for the agent connection.
///
/// Read once when the element is constructed; the bound address never changes
/// for the lifetime of the element.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Interface the channel binds to.
    pub host: String,
    /// Port the channel binds to. `0` asks the OS for a free port.
    pub port: u16,
    /// How often a pending connection is polled for while a send waits for an agent.
    pub accept_poll_interval: Duration,
    /// Upper bound on a single frame in either direction.
    pub max_frame_len: usize,
}

impl ConnectionConfig {
    /// Create a config bound to `localhost` on the given port.
    pub fn new(port: u16) -> Self {
        Self {
            host: "localhost".to_string(),
            port,
            accept_poll_interval: Duration::from_millis(10),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Build a config from a real-valued port property as simulation tools store it.
    pub fn from_port_value(value: f64) -> BridgeResult<Self> {
        if !value.is_finite() || value.fract() != 0.0 {
            return Err(BridgeError::invalid_config(format!(
                "port must be a whole number, got {value}"
            )));
        }
        if !(0.0..=f64::from(u16::MAX)).contains(&value) {
            return Err(BridgeError::invalid_config(format!(
                "port {value} is outside 0..=65535"
            )));
        }
        Ok(Self::new(value as u16))
    }

    /// Override the interface to bind.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Override the accept polling interval.
    pub fn with_accept_poll_interval(mut self, interval: Duration) -> Self {
        self.accept_poll_interval = interval;
        self
    }

    /// Override the frame size limit.
    pub fn with_max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max;
        self
    }

    /// Render the bind address as `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PORT)
    }
}

/// Step-level configuration: which host states feed the request and receive the action.
#[derive(Debug, Clone, PartialEq)]
pub struct StepConfig {
    /// State holding the episode status code.
    pub status: String,
    /// State holding the current episode number.
    pub episode_number: String,
    /// State holding the reward for the previous action.
    pub reward: String,
    /// State the agent's action is written into.
    pub action: String,
    /// Observation states in declaration order.
    pub states: Vec<String>,
    /// Bound on handing the request to the transport.
    pub send_timeout: Duration,
    /// Bound on waiting for the agent's reply.
    pub receive_timeout: Duration,
}

impl StepConfig {
    pub fn new() -> Self {
        Self {
            status: "Status".to_string(),
            episode_number: "EpisodeNumber".to_string(),
            reward: "Reward".to_string(),
            action: "Action".to_string(),
            states: Vec::new(),
            send_timeout: DEFAULT_EXCHANGE_TIMEOUT,
            receive_timeout: DEFAULT_EXCHANGE_TIMEOUT,
        }
    }

    pub fn with_status(mut self, name: impl Into<String>) -> Self {
        self.status = name.into();
        self
    }

    pub fn with_episode_number(mut self, name: impl Into<String>) -> Self {
        self.episode_number = name.into();
        self
    }

    pub fn with_reward(mut self, name: impl Into<String>) -> Self {
        self.reward = name.into();
        self
    }

    pub fn with_action(mut self, name: impl Into<String>) -> Self {
        self.action = name.into();
        self
    }

    /// Append an observation state. Order of calls is the order on the wire.
    pub fn with_state(mut self, name: impl Into<String>) -> Self {
        self.states.push(name.into());
        self
    }

    /// Append several observation states in order.
    pub fn with_states<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.states.extend(names.into_iter().map(Into::into));
        self
    }

    /// Apply the same bound to both send and receive.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self.receive_timeout = timeout;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Check that every binding names a state and that observations are unique.
    pub fn validate(&self) -> BridgeResult<()> {
        let scalars = [
            ("status", &self.status),
            ("episode number", &self.episode_number),
            ("reward", &self.reward),
            ("action", &self.action),
        ];
        for (label, name) in scalars {
            if name.trim().is_empty() {
                return Err(BridgeError::invalid_config(format!(
                    "{label} state name is empty"
                )));
            }
        }

        let mut seen = BTreeSet::new();
        for (index, name) in self.states.iter().enumerate() {
            if name.trim().is_empty() {
                return Err(BridgeError::invalid_config(format!(
                    "observation state {index} has an empty name"
                )));
            }
            if !seen.insert(name.as_str()) {
                return Err(BridgeError::invalid_config(format!(
                    "observation state {name} is declared more than once"
                )));
            }
        }

        if self.send_timeout.is_zero() || self.receive_timeout.is_zero() {
            return Err(BridgeError::invalid_config("exchange timeouts must be non-zero"));
        }

        Ok(())
    }
}

impl Default for StepConfig {
    fn default() -> Self {
        Self::new()
    }
}
