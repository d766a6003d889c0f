//! Process-wide device emulator.
//!
//! A [`DeviceEmulator`] stands in for a real device on the network: it runs
//! the RBCP register server, a command server with register and generator
//! manipulation commands (prompt `pdev$ `), and a push server streaming
//! fabricated acquisition records to every client that connects to the data
//! port. All three share one register bank and one generator, so commands
//! observe exactly what the UDP face serves.

mod commands;
mod generator;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::info;

use crate::command::CommandHandler;
use crate::error::Result;
use crate::protocol::{wire, RbcpServer, RegisterBank};
use crate::session::SessionServer;

pub use commands::RbcpCommands;
pub use generator::{
    CounterGenerator, DataGenerator, DataPushHandler, PatternGenerator, UNIT_SENTINEL,
};

/// Default TCP port of the emulator's command server.
pub const DEFAULT_COMMAND_PORT: u16 = 9090;
/// Default TCP port of the emulator's data push server.
pub const DEFAULT_DATA_PORT: u16 = 24242;
/// Prompt of the emulator's command server.
pub const PROMPT: &str = "pdev$ ";

/// The emulated device: command server, RBCP server and data push server.
pub struct DeviceEmulator<G: DataGenerator = CounterGenerator> {
    command_server: SessionServer<CommandHandler<RbcpCommands<G>>>,
    rbcp_server: RbcpServer,
    push_server: SessionServer<DataPushHandler<G>>,
    bank: Arc<Mutex<RegisterBank>>,
    generator: Arc<G>,
}

impl DeviceEmulator<CounterGenerator> {
    /// Creates an emulator with the counter generator on the default ports.
    pub fn with_defaults() -> DeviceEmulator<CounterGenerator> {
        DeviceEmulator::new(
            CounterGenerator::new(),
            "0.0.0.0",
            DEFAULT_COMMAND_PORT,
            DEFAULT_DATA_PORT,
            wire::DEFAULT_UDP_PORT,
        )
    }
}

impl<G: DataGenerator> DeviceEmulator<G> {
    /// Composes an emulator from a generator and the three bind points.
    /// Ports may be 0 to pick ephemeral ports, reported by the address
    /// accessors once started.
    pub fn new(
        generator: G,
        host: &str,
        command_port: u16,
        data_port: u16,
        udp_port: u16,
    ) -> DeviceEmulator<G> {
        let bank = Arc::new(Mutex::new(RegisterBank::new()));
        let generator = Arc::new(generator);

        let rbcp_server = RbcpServer::new(bank.clone(), host, udp_port);
        let handler =
            CommandHandler::new(PROMPT, RbcpCommands::new(bank.clone(), generator.clone()));
        let command_server = SessionServer::new(handler, host, command_port);
        let push_server =
            SessionServer::new(DataPushHandler::new(generator.clone()), host, data_port)
                .with_max_buff(1024 * 1024);

        DeviceEmulator { command_server, rbcp_server, push_server, bank, generator }
    }

    /// The register bank shared by the RBCP server and the commands.
    pub fn bank(&self) -> Arc<Mutex<RegisterBank>> {
        self.bank.clone()
    }

    /// The generator feeding the data port.
    pub fn generator(&self) -> &Arc<G> {
        &self.generator
    }

    /// The command server's handler, for running startup command scripts.
    pub fn command_handler(&self) -> &Arc<CommandHandler<RbcpCommands<G>>> {
        self.command_server.handler()
    }

    /// Bound address of the command server, once started.
    pub fn command_addr(&self) -> Option<SocketAddr> {
        self.command_server.local_addr()
    }

    /// Bound address of the data push server, once started.
    pub fn data_addr(&self) -> Option<SocketAddr> {
        self.push_server.local_addr()
    }

    /// Bound address of the RBCP server, once started.
    pub fn rbcp_addr(&self) -> Option<SocketAddr> {
        self.rbcp_server.local_addr()
    }

    /// Starts all three servers.
    pub async fn start(&self) -> Result<()> {
        self.command_server.start().await?;
        self.rbcp_server.start().await?;
        self.push_server.start().await?;
        info!("device emulator started: command, RBCP and data servers running");
        Ok(())
    }

    /// Blocks until the `exit` command is received.
    pub async fn wait_exit(&self) {
        while !self.command_server.is_exit() {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Starts the emulator and serves until the `exit` command, then shuts
    /// down.
    pub async fn run_loop(&self) -> Result<()> {
        self.start().await?;
        self.wait_exit().await;
        info!("exiting device emulator");
        self.stop().await;
        Ok(())
    }

    /// Stops all three servers with bounded joins.
    pub async fn stop(&self) {
        self.push_server.stop().await;
        self.rbcp_server.stop().await;
        self.command_server.stop().await;
    }
}
