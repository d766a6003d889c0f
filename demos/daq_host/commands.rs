//! DAQ control commands of the acquisition host.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Local;
use tracing::error;

use rbcp_daq::command::{CommandContext, CommandSet, CommandSpec};
use rbcp_daq::daq::{DaqClient, DaqRecorder};

use crate::config::{self, Config};

const CATALOG: &[CommandSpec] = &[
    CommandSpec { name: "run", usage: "run: Run daq." },
    CommandSpec { name: "stop", usage: "stop: Stop current run." },
    CommandSpec { name: "runno", usage: "runno [runno]: Set/show the run number." },
    CommandSpec {
        name: "rawsave",
        usage: "rawsave [on|off]: Set the raw event data save function on/off",
    },
    CommandSpec { name: "reload", usage: "reload [config_file_path]: Reload config.json" },
    CommandSpec {
        name: "exit",
        usage: "exit: Exit the server. To close the session, use the 'close' command.",
    },
];

struct Control {
    config: Config,
    run_no: u32,
    raw_save: bool,
}

/// Command set of the acquisition host: run control, run numbering, raw
/// save arming and config reload. The `exit` built-in is shadowed so a
/// running acquisition stops before the server goes down.
pub struct DaqCommands {
    config_path: PathBuf,
    run_no_path: PathBuf,
    control: Mutex<Control>,
    recorder: Arc<DaqRecorder>,
    client: Mutex<Option<DaqClient<DaqRecorder>>>,
}

impl DaqCommands {
    pub fn new(
        config: Config,
        config_path: PathBuf,
        run_no_path: PathBuf,
        recorder: Arc<DaqRecorder>,
    ) -> DaqCommands {
        let run_no = config::load_run_no(&run_no_path);
        DaqCommands {
            config_path,
            run_no_path,
            control: Mutex::new(Control { config, run_no, raw_save: false }),
            recorder,
            client: Mutex::new(None),
        }
    }

    fn save_run_no(&self, run_no: u32) {
        if let Err(err) = config::save_run_no(&self.run_no_path, run_no) {
            error!("could not save run number: {:#}", err);
        }
    }

    async fn cmd_run(&self, ctx: &CommandContext<'_>, args: &[&str]) -> anyhow::Result<()> {
        if args.len() != 1 {
            ctx.reply("NG:Too many arguments").await?;
            return Ok(());
        }
        if self.client.lock().expect("daq client mutex poisoned").is_some() {
            ctx.reply("NG:Run command status mismatch").await?;
            return Ok(());
        }

        let (target, run_no, raw_save, logging_dir) = {
            let control = self.control.lock().expect("daq control mutex poisoned");
            (
                control.config.target().clone(),
                control.run_no,
                control.raw_save,
                control.config.system.logging_dir.clone(),
            )
        };
        if raw_save {
            let run_dir =
                logging_dir.join(format!("raw{:06}_{}", run_no, Local::now().format("%Y%m%d")));
            if let Err(err) = std::fs::create_dir_all(&run_dir) {
                let message = format!(
                    "NG:Could not create raw data save directory {} ({})",
                    run_dir.display(),
                    err
                );
                error!("{}", message);
                ctx.reply(&message).await?;
                return Ok(());
            }
            self.recorder.set_raw_save(true, run_no, Some(run_dir));
        }

        let client = DaqClient::new(self.recorder.clone(), target.ip.clone(), target.tcp);
        client.start().await;
        *self.client.lock().expect("daq client mutex poisoned") = Some(client);
        Ok(())
    }

    async fn cmd_stop(&self, ctx: &CommandContext<'_>, args: &[&str]) -> anyhow::Result<()> {
        if args.len() != 1 {
            ctx.reply("NG:Too many arguments").await?;
            return Ok(());
        }
        let client = self.client.lock().expect("daq client mutex poisoned").take();
        match client {
            Some(client) => {
                let raw_save =
                    self.control.lock().expect("daq control mutex poisoned").raw_save;
                if raw_save {
                    ctx.reply("waiting for raw data writing...").await?;
                }
                client.stop().await;
                let run_no = {
                    let mut control = self.control.lock().expect("daq control mutex poisoned");
                    control.run_no += 1;
                    control.run_no
                };
                self.save_run_no(run_no);
            }
            None => error!("stop command status mismatch"),
        }
        Ok(())
    }

    async fn cmd_runno(&self, ctx: &CommandContext<'_>, args: &[&str]) -> anyhow::Result<()> {
        match args.len() {
            1 => {
                let run_no = self.control.lock().expect("daq control mutex poisoned").run_no;
                ctx.reply(&run_no.to_string()).await?;
            }
            2 => match args[1].parse::<u32>() {
                Ok(run_no) => {
                    self.control.lock().expect("daq control mutex poisoned").run_no = run_no;
                    self.save_run_no(run_no);
                    ctx.reply(&format!("OK:{run_no}")).await?;
                }
                Err(err) => {
                    error!("runno command error {}", err);
                    ctx.reply(&format!("NG:Error occurred ({err})")).await?;
                }
            },
            _ => ctx.reply("NG:Too many arguments").await?,
        }
        Ok(())
    }

    async fn cmd_rawsave(&self, ctx: &CommandContext<'_>, args: &[&str]) -> anyhow::Result<()> {
        match args.len() {
            1 => {
                let raw_save = self.control.lock().expect("daq control mutex poisoned").raw_save;
                ctx.reply(if raw_save { "on" } else { "off" }).await?;
            }
            2 if args[1].eq_ignore_ascii_case("on") => {
                let (run_no, logging_dir) = {
                    let control = self.control.lock().expect("daq control mutex poisoned");
                    (control.run_no, control.config.system.logging_dir.clone())
                };
                if let Err(err) = std::fs::create_dir_all(&logging_dir) {
                    let message = format!(
                        "NG:Could not create logging dir {}. {}",
                        logging_dir.display(),
                        err
                    );
                    error!("{}", message);
                    ctx.reply(&message).await?;
                    return Ok(());
                }
                self.recorder.set_raw_save(true, run_no, Some(logging_dir));
                self.control.lock().expect("daq control mutex poisoned").raw_save = true;
                ctx.reply("OK:on").await?;
            }
            2 => {
                self.recorder.set_raw_save(false, 0, None);
                self.control.lock().expect("daq control mutex poisoned").raw_save = false;
                ctx.reply("OK:off").await?;
            }
            _ => ctx.reply("NG:Too many arguments").await?,
        }
        Ok(())
    }

    async fn cmd_reload(&self, ctx: &CommandContext<'_>, args: &[&str]) -> anyhow::Result<()> {
        if args.len() > 2 {
            ctx.reply("NG:Too many arguments").await?;
            return Ok(());
        }
        let path = if args.len() == 2 {
            PathBuf::from(args[1])
        } else {
            self.config_path.clone()
        };
        match Config::load(&path) {
            Ok(config) => {
                self.control.lock().expect("daq control mutex poisoned").config = config;
                ctx.reply("OK:Config reloaded").await?;
            }
            Err(err) => {
                let message = format!("NG:Could not reload config {err}");
                error!("{}", message);
                ctx.reply(&message).await?;
            }
        }
        Ok(())
    }

    async fn cmd_exit(&self, ctx: &CommandContext<'_>) -> anyhow::Result<bool> {
        let client = self.client.lock().expect("daq client mutex poisoned").take();
        if let Some(client) = client {
            client.stop().await;
        }
        ctx.reply("exiting server").await?;
        ctx.set_exit();
        Ok(false)
    }
}

#[async_trait]
impl CommandSet for DaqCommands {
    fn catalog(&self) -> &'static [CommandSpec] {
        CATALOG
    }

    async fn dispatch(
        &self,
        ctx: &CommandContext<'_>,
        args: &[&str],
    ) -> anyhow::Result<Option<bool>> {
        match args[0] {
            "run" => self.cmd_run(ctx, args).await?,
            "stop" => self.cmd_stop(ctx, args).await?,
            "runno" => self.cmd_runno(ctx, args).await?,
            "rawsave" => self.cmd_rawsave(ctx, args).await?,
            "reload" => self.cmd_reload(ctx, args).await?,
            "exit" => return Ok(Some(self.cmd_exit(ctx).await?)),
            _ => return Ok(None),
        }
        Ok(Some(true))
    }

    fn stat_list(&self) -> Vec<String> {
        let mut list = Vec::new();
        {
            let client = self.client.lock().expect("daq client mutex poisoned");
            match client.as_ref() {
                None => list.push("daq=stop".to_string()),
                Some(client) => match client.error() {
                    Some(err) => {
                        list.push("daq=error".to_string());
                        list.push(format!("error='{err}'"));
                    }
                    None => list.push("daq=running".to_string()),
                },
            }
        }
        let run_no = self.control.lock().expect("daq control mutex poisoned").run_no;
        list.push(format!("run no={run_no}"));
        list.extend(self.recorder.stat_list());
        list
    }
}
