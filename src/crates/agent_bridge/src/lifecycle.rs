use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::info;

use crate::channel::Channel;
use crate::config::{ConnectionConfig, StepConfig};
use crate::driver::{Phase, StepDriver, StepOutcome};
use crate::error::{BridgeError, BridgeResult};
use crate::host::HostContext;

/// Run-scoped element as the host simulation sees it.
pub trait SimulationElement {
    /// Called when a simulation run starts. An error here stops the run.
    fn initialize(&self) -> BridgeResult<()>;

    /// Called when the run ends, normally or not.
    fn shutdown(&self);
}

/// Step executed by the host each time a process token reaches it.
pub trait SimulationStep {
    fn execute(&self, host: &mut dyn HostContext) -> StepOutcome;
}

/// Owns the agent channel for the duration of each simulation run.
///
/// The channel is created fresh on every run start and closed on run end; it
/// is never carried over. Exchanges from any number of steps are serialized on
/// the internal lock, so at most one request is ever outstanding.
#[derive(Debug)]
pub struct AgentConnection {
    config: ConnectionConfig,
    channel: Mutex<Option<Channel>>,
}

impl AgentConnection {
    pub const NAME: &'static str = "AgentConnection";

    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            channel: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Bind the channel for a new run and return the bound address.
    pub fn on_run_start(&self) -> BridgeResult<SocketAddr> {
        let mut slot = self.lock();
        if slot.is_some() {
            return Err(BridgeError::RunAlreadyActive);
        }
        let channel = Channel::open(&self.config)?;
        let addr = channel.local_addr();
        *slot = Some(channel);
        info!(%addr, "agent connection run started");
        Ok(addr)
    }

    /// Close the run's channel. Returns whether a channel was open.
    pub fn on_run_end(&self) -> bool {
        let channel = self.lock().take();
        match channel {
            Some(mut channel) => {
                channel.close();
                info!("agent connection run ended");
                true
            }
            None => false,
        }
    }

    /// Start a run whose channel is released when the returned guard drops.
    pub fn start_run(&self) -> BridgeResult<RunGuard<'_>> {
        let local_addr = self.on_run_start()?;
        Ok(RunGuard {
            connection: self,
            local_addr,
        })
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    /// Address of the current run's channel.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock().as_ref().map(Channel::local_addr)
    }

    /// Run `f` with exclusive use of the channel for the current run.
    pub fn with_channel<R>(&self, f: impl FnOnce(&mut Channel) -> R) -> BridgeResult<R> {
        let mut slot = self.lock();
        let channel = slot.as_mut().ok_or(BridgeError::ChannelClosed)?;
        Ok(f(channel))
    }

    fn lock(&self) -> MutexGuard<'_, Option<Channel>> {
        // The slot is only ever replaced whole, so a panic elsewhere cannot
        // leave it half-updated.
        self.channel.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for AgentConnection {
    fn default() -> Self {
        Self::new(ConnectionConfig::default())
    }
}

impl SimulationElement for AgentConnection {
    fn initialize(&self) -> BridgeResult<()> {
        self.on_run_start().map(|_| ())
    }

    fn shutdown(&self) {
        self.on_run_end();
    }
}

/// Ends the run when dropped, including during unwinding.
#[derive(Debug)]
pub struct RunGuard<'a> {
    connection: &'a AgentConnection,
    local_addr: SocketAddr,
}

impl RunGuard<'_> {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection(&self) -> &AgentConnection {
        self.connection
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.connection.on_run_end();
    }
}

/// Decision-point step: exchanges one message pair with the agent and picks an exit.
#[derive(Debug, Clone)]
pub struct AgentWaitStep {
    connection: Arc<AgentConnection>,
    driver: StepDriver,
}

impl AgentWaitStep {
    pub const NAME: &'static str = "AgentWait";
    pub const NUMBER_OF_EXITS: usize = 2;

    pub fn new(connection: Arc<AgentConnection>, config: StepConfig) -> BridgeResult<Self> {
        Ok(Self {
            connection,
            driver: StepDriver::new(config)?,
        })
    }

    pub fn connection(&self) -> &Arc<AgentConnection> {
        &self.connection
    }

    pub fn driver(&self) -> &StepDriver {
        &self.driver
    }
}

impl SimulationStep for AgentWaitStep {
    fn execute(&self, host: &mut dyn HostContext) -> StepOutcome {
        match self
            .connection
            .with_channel(|channel| self.driver.invoke(channel, &mut *host))
        {
            Ok(outcome) => outcome,
            Err(error) => self.driver.fail(host, Phase::Idle, error),
        }
    }
}
