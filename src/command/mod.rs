//! Command dispatcher on top of the session framework.
//!
//! A command server speaks a line protocol: `\r\n`, `\n` or `\r` terminates
//! a line (detected per session), `;` separates commands within a line,
//! whitespace separates tokens within a command. Replies are zero or more
//! lines followed by a bare prompt. Failure lines start with `NG:`.
//!
//! Applications contribute commands through the [`CommandSet`] trait: a
//! declarative catalog of `(name, usage)` pairs that feeds the built-in
//! `help` command, plus an async `dispatch` that recognizes its own names
//! and falls through (returns `None`) for everything else. Built-in
//! commands (`help`, `state`, `stat`, `pwd`, `ls`, `close`, `exit`) are
//! provided by [`CommandHandler`]; a set may shadow a built-in by listing
//! and dispatching the same name itself.

mod client;

use std::collections::BTreeMap;

use anyhow::anyhow;
use async_trait::async_trait;
use tracing::error;

use crate::handler::{find_line_frame, ExitFlag, Frame, SessionHandler};
use crate::session::Session;

pub use client::CommandClient;

/// Default prompt of a command server.
pub const DEFAULT_PROMPT: &str = "$ ";

/// One entry of a command catalog.
///
/// `usage` may span multiple lines; the first line is the one-line summary
/// shown by a bare `help`, the full text is shown by `help <name>`.
#[derive(Copy, Clone, Debug)]
pub struct CommandSpec {
    /// The command name, as typed by clients.
    pub name: &'static str,
    /// Usage text, first line being the summary.
    pub usage: &'static str,
}

/// Context handed to [`CommandSet::dispatch`]: the requesting session plus
/// the merged command catalog and the server-wide exit flag.
pub struct CommandContext<'a> {
    session: &'a Session,
    catalog: &'a [CommandSpec],
    exit: &'a ExitFlag,
}

impl CommandContext<'_> {
    /// The session the command arrived on.
    pub fn session(&self) -> &Session {
        self.session
    }

    /// Sends one reply line to the requester.
    pub async fn reply(&self, text: &str) -> crate::Result<()> {
        self.session.reply_text(text).await
    }

    /// Sends the usage text of `name`: the summary line only when
    /// `usage_only`, the full text otherwise. Unknown names get an `NG:`
    /// line.
    pub async fn print_help(&self, name: &str, usage_only: bool) -> crate::Result<()> {
        match self.catalog.iter().find(|spec| spec.name == name) {
            Some(spec) => {
                for line in spec.usage.lines() {
                    self.reply(line.trim()).await?;
                    if usage_only {
                        break;
                    }
                }
            }
            None => self.reply(&format!("NG:Unknown command:{name}")).await?,
        }
        Ok(())
    }

    /// Requests server shutdown.
    pub fn set_exit(&self) {
        self.exit.set();
    }
}

/// Application-contributed commands of a command server.
#[async_trait]
pub trait CommandSet: Send + Sync + 'static {
    /// The commands this set contributes, for `help`. Entries sharing a name
    /// with a built-in shadow it.
    fn catalog(&self) -> &'static [CommandSpec];

    /// Handles one command. `args[0]` is the command name. Returns
    /// `Ok(Some(cont))` when handled (`cont` false closes the session) and
    /// `Ok(None)` to fall through to the built-in commands. An error is
    /// reported to the client as `NG:Error occurred (..)` and ends the
    /// session.
    async fn dispatch(
        &self,
        ctx: &CommandContext<'_>,
        args: &[&str],
    ) -> anyhow::Result<Option<bool>>;

    /// `key=value` statistics lines for the built-in `stat` command.
    fn stat_list(&self) -> Vec<String> {
        Vec::new()
    }
}

/// A command set contributing nothing beyond the built-ins.
pub struct EmptyCommands;

#[async_trait]
impl CommandSet for EmptyCommands {
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
}

const BUILTIN_CATALOG: &[CommandSpec] = &[
    CommandSpec {
        name: "help",
        usage: "help [<command>...]: Display usage of all commands.\n\
                with argument <command> shows details of the <command>.",
    },
    CommandSpec { name: "state", usage: "state: Show state of server." },
    CommandSpec {
        name: "stat",
        usage: "stat [j]: Returns statistics of this process.\nj: Returns statistics as json.",
    },
    CommandSpec { name: "pwd", usage: "pwd: Returns current directory" },
    CommandSpec {
        name: "ls",
        usage: "ls [path]: Returns files in the server's current directory or the specified path.",
    },
    CommandSpec {
        name: "close",
        usage: "close: Close the session. The server will not terminate. \
                To exit the server, use the 'exit' command.",
    },
    CommandSpec {
        name: "exit",
        usage: "exit: Exit the server. To close the session, use the 'close' command.",
    },
];

/// The session handler of a command server: prompt cycle, line splitting,
/// dispatch to a [`CommandSet`] and the built-in commands.
pub struct CommandHandler<C: CommandSet> {
    prompt: String,
    separators: Option<Vec<char>>,
    exit: ExitFlag,
    commands: C,
    catalog: Vec<CommandSpec>,
}

impl<C: CommandSet> CommandHandler<C> {
    /// Creates a handler with the given prompt. The prompt must not be
    /// empty: clients use it as the reply terminator.
    pub fn new(prompt: impl Into<String>, commands: C) -> CommandHandler<C> {
        let prompt = prompt.into();
        assert!(!prompt.is_empty(), "prompt is empty");

        let mut merged: BTreeMap<&'static str, CommandSpec> = BTreeMap::new();
        for spec in BUILTIN_CATALOG.iter().chain(commands.catalog()) {
            merged.insert(spec.name, *spec);
        }
        CommandHandler {
            prompt,
            separators: None,
            exit: ExitFlag::new(),
            commands,
            catalog: merged.into_values().collect(),
        }
    }

    /// Replaces whitespace token splitting with an explicit separator set.
    pub fn with_separators(mut self, separators: &str) -> CommandHandler<C> {
        self.separators = Some(separators.chars().collect());
        self
    }

    /// The application command set of this handler.
    pub fn commands(&self) -> &C {
        &self.commands
    }

    /// The merged command catalog, alphabetical.
    pub fn catalog(&self) -> &[CommandSpec] {
        &self.catalog
    }

    /// Sends the prompt, with no line terminator.
    pub async fn put_prompt(&self, session: &Session) -> crate::Result<()> {
        session.reply_raw(&self.prompt).await
    }

    fn split_args<'t>(&self, command_text: &'t str) -> Vec<&'t str> {
        let tokens: Vec<&str> = match &self.separators {
            None => command_text.split_whitespace().collect(),
            Some(separators) => {
                command_text.split(|c: char| separators.contains(&c)).collect()
            }
        };
        tokens.into_iter().map(str::trim).filter(|token| !token.is_empty()).collect()
    }

    /// Runs one delimited message: split on `;`, dispatch each command,
    /// prompt on success.
    async fn handle_message(&self, session: &Session, data: &[u8]) -> anyhow::Result<bool> {
        let text = std::str::from_utf8(data)
            .map_err(|_| anyhow!("command line is not valid utf-8"))?;
        for command_text in text.trim().split(';') {
            let args = self.split_args(command_text);
            if args.is_empty() {
                continue;
            }
            if !self.run_command(session, &args).await? {
                return Ok(false);
            }
        }
        self.put_prompt(session).await?;
        Ok(true)
    }

    /// Dispatches one command: the application set first, built-ins second.
    pub async fn run_command(&self, session: &Session, args: &[&str]) -> anyhow::Result<bool> {
        if args.is_empty() {
            return Ok(true);
        }
        let ctx = CommandContext { session, catalog: &self.catalog, exit: &self.exit };
        match self.commands.dispatch(&ctx, args).await? {
            Some(cont) => Ok(cont),
            None => self.builtin(&ctx, args).await,
        }
    }

    async fn builtin(&self, ctx: &CommandContext<'_>, args: &[&str]) -> anyhow::Result<bool> {
        match args[0] {
            "help" => {
                if args.len() >= 2 {
                    for key in &args[1..] {
                        ctx.print_help(key, false).await?;
                    }
                } else {
                    for spec in &self.catalog {
                        ctx.print_help(spec.name, true).await?;
                    }
                }
                Ok(true)
            }
            "state" => {
                match ctx.session.server() {
                    Some(handle) => {
                        for line in handle.info_lines() {
                            ctx.reply(&line).await?;
                        }
                    }
                    None => ctx.reply("No state information.").await?,
                }
                Ok(true)
            }
            "stat" => self.builtin_stat(ctx, args).await,
            "pwd" => {
                if args.len() == 1 {
                    ctx.reply(&std::env::current_dir()?.display().to_string()).await?;
                } else {
                    ctx.reply("NG:Too many arguments").await?;
                }
                Ok(true)
            }
            "ls" => self.builtin_ls(ctx, args).await,
            "close" => {
                ctx.reply("closing this session").await?;
                Ok(false)
            }
            "exit" => {
                ctx.reply("exiting server").await?;
                ctx.set_exit();
                Ok(false)
            }
            unknown => {
                ctx.reply(&format!("NG:Unknown command [{unknown}]")).await?;
                Ok(true)
            }
        }
    }

    async fn builtin_stat(&self, ctx: &CommandContext<'_>, args: &[&str]) -> anyhow::Result<bool> {
        let json_output = match args {
            [_] => false,
            [_, "j"] => true,
            [_, rest @ ..] => {
                ctx.reply(&format!("NG:Unknown argument {rest:?}")).await?;
                return Ok(true);
            }
            [] => false,
        };

        let stat_list = self.commands.stat_list();
        if json_output {
            let mut object = serde_json::Map::new();
            for stat in &stat_list {
                let (key, value) = stat.split_once('=').unwrap_or((stat.as_str(), ""));
                object.insert(key.to_string(), serde_json::Value::String(value.to_string()));
            }
            ctx.reply(&serde_json::Value::Object(object).to_string()).await?;
        } else {
            for stat in &stat_list {
                ctx.reply(stat).await?;
            }
        }
        Ok(true)
    }

    async fn builtin_ls(&self, ctx: &CommandContext<'_>, args: &[&str]) -> anyhow::Result<bool> {
        if args.len() > 2 {
            ctx.reply("NG:Too many arguments").await?;
            return Ok(true);
        }
        let current = std::env::current_dir()?;
        let target = if args.len() == 2 { current.join(args[1]) } else { current };
        let listing: std::io::Result<Vec<String>> = std::fs::read_dir(&target).and_then(|entries| {
            entries
                .map(|entry| Ok(entry?.file_name().to_string_lossy().into_owned()))
                .collect()
        });
        match listing {
            Ok(names) => {
                for name in names {
                    ctx.reply(&name).await?;
                }
            }
            Err(err) => ctx.reply(&format!("NG:Error occurred ({err})")).await?,
        }
        Ok(true)
    }
}

#[async_trait]
impl<C: CommandSet> SessionHandler for CommandHandler<C> {
    fn find_frame(&self, session: &Session, data: &[u8]) -> Option<Frame> {
        let (frame, sep) = find_line_frame(data)?;
        session.set_line_sep(sep);
        Some(frame)
    }

    async fn on_start(&self, session: &Session) -> anyhow::Result<()> {
        self.put_prompt(session).await?;
        Ok(())
    }

    async fn on_data(&self, session: &Session, data: &[u8]) -> anyhow::Result<bool> {
        match self.handle_message(session, data).await {
            Ok(cont) => Ok(cont),
            Err(err) => {
                error!("command dispatch error: {:#}", err);
                let _ = session.reply_text(&format!("NG:Error occurred ({err})")).await;
                Ok(false)
            }
        }
    }

    fn is_exit(&self) -> bool {
        self.exit.get()
    }

    fn set_exit(&self) {
        self.exit.set();
    }
}
