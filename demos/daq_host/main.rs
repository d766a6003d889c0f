use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::error;

use rbcp_daq::command::CommandHandler;
use rbcp_daq::daq::DaqRecorder;
use rbcp_daq::handler::SessionHandler;
use rbcp_daq::session::{Session, SessionServer};

mod commands;
mod config;

use commands::DaqCommands;
use config::Config;

/// Acquisition host: a command server (prompt `daq$ `) controlling a DAQ
/// client that records the data stream of one device.
#[derive(Parser)]
#[command(about = "daq host")]
struct Args {
    /// Acceptable host to bind.
    #[arg(short = 'a', long = "host", default_value = "0.0.0.0")]
    host: String,

    /// Server port number; 0 picks an ephemeral port.
    #[arg(short = 'p', long = "port", default_value_t = 0)]
    port: u16,

    /// Initial command file, one command per line.
    #[arg(short = 's', long = "source")]
    source: Option<PathBuf>,

    /// Initial commands separated with semicolon.
    #[arg(short = 'x', long = "command")]
    command: Option<String>,

    /// Configuration file.
    #[arg(long = "config", default_value = "config.json")]
    config: PathBuf,

    /// Run number persistence file.
    #[arg(long = "runno-file", default_value = "run_no.txt")]
    runno_file: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            error!("daq host initialization error ({:#})", err);
            std::process::exit(1);
        }
    };
    let recorder = Arc::new(DaqRecorder::new(config.system.data_unit));
    let commands = DaqCommands::new(config, args.config.clone(), args.runno_file.clone(), recorder);
    let server =
        SessionServer::new(CommandHandler::new("daq$ ", commands), args.host.as_str(), args.port);
    if let Err(err) = server.start().await {
        error!("could not start the daq host: {}", err);
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
        for line in init_commands {
            if let Err(err) = server.handler().on_data(&session, line.as_bytes()).await {
                error!("initial command failed: {:#}", err);
            }
        }
    }

    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(100)) => {
                if server.is_exit() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("detected CTRL + C. exiting server..");
                server.handler().on_shutdown();
                break;
            }
        }
    }
    server.stop().await;
}
