//! Register and generator manipulation commands of the device emulator.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::command::{CommandContext, CommandSet, CommandSpec};
use crate::emulator::generator::DataGenerator;
use crate::protocol::RegisterBank;

const CATALOG: &[CommandSpec] = &[
    CommandSpec {
        name: "read",
        usage: "read <address in hexadecimal> <length in decimal>: Read register memory.",
    },
    CommandSpec {
        name: "write",
        usage: "write <address in hexadecimal> <data in hexadecimal 1byte> \
                [<data in hexadecimal 1byte> ..]: Write register memory.",
    },
    CommandSpec {
        name: "initreg",
        usage: "initreg <file_path>: Initialize registers from a file or directory.\n\
                directory - initialize from every file in the directory.\n\
                binary file - register image named \"<address in hexadecimal>.bin\"\n\
                simple text file - hex bytes, named \"<address in hexadecimal>.txt\"\n\
                addressed text file - \"<address>: <hex> <hex> ..\" lines, any other name",
    },
    CommandSpec {
        name: "dataunitcount",
        usage: "dataunitcount [count]: Set data unit count to generate.",
    },
    CommandSpec { name: "dump", usage: "dump: Dump virtual registers." },
];

/// Command set of the device emulator: direct register access, register
/// initialization from files, generator burst control and a register dump.
pub struct RbcpCommands<G: DataGenerator> {
    bank: Arc<Mutex<RegisterBank>>,
    generator: Arc<G>,
}

impl<G: DataGenerator> RbcpCommands<G> {
    /// Creates the command set over the emulator's bank and generator.
    pub fn new(bank: Arc<Mutex<RegisterBank>>, generator: Arc<G>) -> RbcpCommands<G> {
        RbcpCommands { bank, generator }
    }

    async fn cmd_read(&self, ctx: &CommandContext<'_>, args: &[&str]) -> anyhow::Result<()> {
        if args.len() != 3 {
            ctx.print_help(args[0], true).await?;
            return Ok(());
        }
        let (address, length) = match (parse_hex_address(args[1]), args[2].parse::<usize>()) {
            (Ok(address), Ok(length)) => (address, length),
            (Err(err), _) => {
                ctx.reply(&format!("NG:Invalid argument {err}")).await?;
                return Ok(());
            }
            (_, Err(err)) => {
                ctx.reply(&format!("NG:Invalid argument {err}")).await?;
                return Ok(());
            }
        };
        let read = self.bank.lock().expect("register bank mutex poisoned").read(address, length);
        match read {
            Ok(data) => {
                for line in data.chunks(8) {
                    let text: Vec<String> = line.iter().map(|byte| format!("{byte:02X}")).collect();
                    ctx.reply(&text.join(" ")).await?;
                }
            }
            Err(_) => ctx.reply("NG:Bus error").await?,
        }
        Ok(())
    }

    async fn cmd_write(&self, ctx: &CommandContext<'_>, args: &[&str]) -> anyhow::Result<()> {
        if args.len() < 3 {
            ctx.print_help(args[0], true).await?;
            return Ok(());
        }
        let address = match parse_hex_address(args[1]) {
            Ok(address) => address,
            Err(err) => {
                ctx.reply(&format!("NG:Invalid argument {err}")).await?;
                return Ok(());
            }
        };
        let mut bytes = Vec::with_capacity(args.len() - 2);
        for token in &args[2..] {
            match u8::from_str_radix(token.trim_start_matches("0x").trim_start_matches("0X"), 16) {
                Ok(byte) => bytes.push(byte),
                Err(err) => {
                    ctx.reply(&format!("NG:Invalid argument {err}")).await?;
                    return Ok(());
                }
            }
        }
        let written =
            self.bank.lock().expect("register bank mutex poisoned").write(address, &bytes);
        match written {
            Ok(read_back) if read_back == bytes => {
                ctx.reply(&format!("write {} bytes.", bytes.len())).await?;
            }
            Ok(_) => {
                ctx.reply(&format!(
                    "write {} bytes. NOTE:read back data not equal to write data",
                    bytes.len()
                ))
                .await?;
            }
            Err(_) => ctx.reply("NG:Bus error").await?,
        }
        Ok(())
    }

    async fn cmd_initreg(&self, ctx: &CommandContext<'_>, args: &[&str]) -> anyhow::Result<()> {
        match args.len() {
            1 => ctx.print_help(args[0], true).await?,
            2 => {
                let path = Path::new(args[1]);
                let loaded = {
                    let mut bank = self.bank.lock().expect("register bank mutex poisoned");
                    if path.is_dir() {
                        bank.load_dir(path)
                    } else {
                        bank.load_file(path)
                    }
                };
                match loaded {
                    Ok(areas) => {
                        ctx.reply("address area initialized").await?;
                        for (address, length) in areas {
                            ctx.reply(&format!("{address:08X}:{length} bytes")).await?;
                        }
                    }
                    Err(err) => ctx.reply(&format!("NG:{err}")).await?,
                }
            }
            _ => ctx.reply("NG:Too many arguments").await?,
        }
        Ok(())
    }

    async fn cmd_dataunitcount(&self, ctx: &CommandContext<'_>, args: &[&str]) -> anyhow::Result<()> {
        match args.len() {
            1 => ctx.reply(&self.generator.data_unit_count().to_string()).await?,
            2 => match args[1].parse::<usize>() {
                Ok(count) => {
                    self.generator.set_data_unit_count(count);
                    ctx.reply(&format!(
                        "set data unit count {} = {}",
                        count,
                        self.generator.data_unit_count()
                    ))
                    .await?;
                }
                Err(err) => ctx.reply(&format!("NG:{err}")).await?,
            },
            _ => ctx.reply("NG:Too many arguments").await?,
        }
        Ok(())
    }

    async fn cmd_dump(&self, ctx: &CommandContext<'_>) -> anyhow::Result<()> {
        let dump = self.bank.lock().expect("register bank mutex poisoned").dump();
        for line in dump.lines() {
            ctx.reply(line).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<G: DataGenerator> CommandSet for RbcpCommands<G> {
    fn catalog(&self) -> &'static [CommandSpec] {
        CATALOG
    }

    async fn dispatch(
        &self,
        ctx: &CommandContext<'_>,
        args: &[&str],
    ) -> anyhow::Result<Option<bool>> {
        match args[0] {
            "read" => self.cmd_read(ctx, args).await?,
            "write" => self.cmd_write(ctx, args).await?,
            "initreg" => self.cmd_initreg(ctx, args).await?,
            "dataunitcount" => self.cmd_dataunitcount(ctx, args).await?,
            "dump" => self.cmd_dump(ctx).await?,
            _ => return Ok(None),
        }
        Ok(Some(true))
    }
}

fn parse_hex_address(token: &str) -> Result<u32, std::num::ParseIntError> {
    u32::from_str_radix(token.trim_start_matches("0x").trim_start_matches("0X"), 16)
}
