use std::path::PathBuf;

use clap::Parser;
use tracing::error;

use rbcp_daq::emulator::{DeviceEmulator, PatternGenerator};
use rbcp_daq::session::Session;

/// Device emulator: command server, RBCP register server and a data port
/// streaming a fixed pattern.
#[derive(Parser)]
#[command(about = "device emulator")]
struct Args {
    /// Acceptable host to bind.
    #[arg(short = 'a', long = "host", default_value = "0.0.0.0")]
    host: String,

    /// Command server port number.
    #[arg(short = 'p', long = "port", default_value_t = 9090)]
    port: u16,

    /// Emulation data port number.
    #[arg(short = 'd', long = "dataport", default_value_t = 24242)]
    dataport: u16,

    /// Initial command file, one command per line.
    #[arg(short = 's', long = "source")]
    source: Option<PathBuf>,

    /// Initial commands separated with semicolon.
    #[arg(short = 'x', long = "command")]
    command: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let emulator = DeviceEmulator::new(
        PatternGenerator::new(),
        &args.host,
        args.port,
        args.dataport,
        rbcp_daq::protocol::wire::DEFAULT_UDP_PORT,
    );
    if let Err(err) = emulator.start().await {
        error!("could not start the emulator: {}", err);
        std::process::exit(1);
    }

    let mut init_commands = Vec::new();
    if let Some(commands) = &args.command {
        init_commands.push(commands.clone());
    }
    if let Some(source) = &args.source {
        match std::fs::read_to_string(source) {
            Ok(content) => init_commands.extend(content.lines().map(str::to_string)),
            Err(err) => error!("could not read command file {}: {}", source.display(), err),
        }
    }
    if !init_commands.is_empty() {
        let session = Session::detached();
        let handler = emulator.command_handler();
        for line in init_commands {
            if let Err(err) = rbcp_daq::handler::SessionHandler::on_data(
                handler.as_ref(),
                &session,
                line.as_bytes(),
            )
            .await
            {
                error!("initial command failed: {:#}", err);
            }
        }
    }

    tokio::select! {
        _ = emulator.wait_exit() => {}
        _ = tokio::signal::ctrl_c() => {
            println!("detected CTRL + C. exiting server..");
        }
    }
    emulator.stop().await;
}
