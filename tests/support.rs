#![allow(dead_code)]

use async_trait::async_trait;

use rbcp_daq::command::{CommandContext, CommandSet, CommandSpec};
use rbcp_daq::emulator::{CounterGenerator, DeviceEmulator};

/// Starts a device emulator on ephemeral loopback ports.
pub async fn start_emulator() -> DeviceEmulator<CounterGenerator> {
    let emulator = DeviceEmulator::new(CounterGenerator::new(), "127.0.0.1", 0, 0, 0);
    emulator.start().await.expect("start emulator");
    emulator
}

/// A command set with fixed statistics, for exercising `stat` output.
pub struct FixedStatCommands;

#[async_trait]
impl CommandSet for FixedStatCommands {
    fn catalog(&self) -> &'static [CommandSpec] {
        &[]
    }

    async fn dispatch(
        &self,
        _ctx: &CommandContext<'_>,
        _args: &[&str],
    ) -> anyhow::Result<Option<bool>> {
        Ok(None)
    }

    fn stat_list(&self) -> Vec<String> {
        vec!["handler=fixed".to_string(), "events=42".to_string(), "note=two words".to_string()]
    }
}
