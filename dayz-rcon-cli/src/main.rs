mod input;
mod shell;

use crate::input::Input;
use crate::shell::{new_shell, ShellRead, ShellWrite};
use ansi_term::Colour::{Cyan, Fixed, Green, Red, Yellow};
use clap::Parser;
use dayz_rcon_client::{Config, Event, Manager, ServerEvent};
use log::{error, info, LevelFilter};
use rpassword::read_password;
use simplelog::{ColorChoice, TermLogger, TerminalMode};
use std::fmt::{Display, Formatter};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// JSON file describing the servers to manage.
    #[clap(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Log more. Twice for everything on the wire.
    #[clap(short, long, parse(from_occurrences))]
    verbose: u64,

    /// Read plain lines from stdin, even on a terminal.
    #[clap(long)]
    no_interactive: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = match load_config(&args.config) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("{}: {}", args.config.display(), message);
            proc_exit::Code::FAILURE.process_exit();
        }
    };

    let level = match args.verbose {
        0 if config.debug => LevelFilter::Debug,
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    if let Err(err) = TermLogger::init(
        level,
        simplelog::Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    ) {
        eprintln!("Could not set up logging: {}", err);
    }

    for server in &mut config.servers {
        if server.rcon_password.is_none() {
            print!("{}'s RCON password: ", server.name);
            let _ = std::io::stdout().flush();
            match read_password() {
                Ok(password) => server.rcon_password = Some(password),
                Err(err) => {
                    error!("Could not read password: {}", err);
                    proc_exit::Code::FAILURE.process_exit();
                }
            }
        }
    }

    let (events, rx) = mpsc::unbounded_channel();
    let manager = match Manager::new(&config, events) {
        Ok(manager) => manager,
        Err(err) => {
            error!("{}", err);
            proc_exit::Code::FAILURE.process_exit();
        }
    };

    let (read, write) = match new_shell(Prompt.to_string(), args.no_interactive) {
        Ok(shell) => shell,
        Err(err) => {
            error!("Could not start the shell: {}", err);
            proc_exit::Code::FAILURE.process_exit();
        }
    };

    manager.start();
    info!(
        "Managing {} server(s). View builtins with `!help`. {} {}",
        config.servers.len(),
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    // Start printing server events
    tokio::spawn(event_loop(rx, write.clone(), level >= LevelFilter::Debug));

    // Start receiving REPL inputs
    repl_loop(&manager, read, write).await;

    info!("End of input, running until interrupted");
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Could not wait for interrupt: {}", err);
    }
    manager.stop();
}

fn load_config(path: &Path) -> Result<Config, String> {
    let text = std::fs::read_to_string(path).map_err(|err| err.to_string())?;
    let config: Config = serde_json::from_str(&text).map_err(|err| err.to_string())?;
    config.validate().map_err(|err| err.to_string())?;
    Ok(config)
}

struct Prompt;

impl Display for Prompt {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}> ", Fixed(10).paint("rcon"))
    }
}

async fn event_loop(
    mut events: mpsc::UnboundedReceiver<ServerEvent>,
    mut write: ShellWrite,
    show_log_lines: bool,
) {
    while let Some(ServerEvent { server, event }) = events.recv().await {
        let server = Fixed(10).paint(format!("[{}]", server));
        match event {
            Event::ChatLine(text) => write.line(format!("{} {}", server, Green.paint(text))),
            Event::PlayerConnected(name) => {
                write.line(format!("{} {} connected", server, Cyan.paint(name)))
            }
            Event::PlayerDisconnected(name) => {
                write.line(format!("{} {} disconnected", server, Cyan.paint(name)))
            }
            Event::Notice(text) => write.line(format!("{} {}", server, Yellow.paint(text))),
            Event::LogLine(text) if show_log_lines => {
                write.line(format!("{} {}", server, Fixed(8).paint(text)))
            }
            Event::LogLine(_) => {}
        }
    }
}

async fn repl_loop(manager: &Manager, mut read: ShellRead, mut write: ShellWrite) {
    let servers: Vec<String> = manager.servers().map(str::to_string).collect();
    let servers: Vec<&str> = servers.iter().map(String::as_str).collect();

    while let Some(line) = read.read_line().await {
        match input::parse(&line, &servers) {
            Ok(input) => run(manager, input, &mut write).await,
            Err(message) => write.error(Red.paint(message)),
        }
    }
}

async fn run(manager: &Manager, input: Input, write: &mut ShellWrite) {
    match input {
        Input::Nothing => {}
        Input::Help => print_help(write),
        Input::Servers => {
            for server in manager.servers() {
                let state = match manager.state(server) {
                    Ok(state) => state,
                    Err(err) => {
                        write.error(err);
                        continue;
                    }
                };
                if manager.shutdown_in_progress(server).unwrap_or(false) {
                    write.line(format!("{}: {:?}, shutting down", server, state));
                } else {
                    write.line(format!("{}: {:?}", server, state));
                }
            }
        }
        Input::Status => {
            for (server, schedules) in manager.schedule_status() {
                write.line(Yellow.paint(server));
                if schedules.is_empty() {
                    write.line("    no scheduled commands");
                }
                for schedule in schedules {
                    write.line(format!("    {}", schedule));
                }
            }
        }
        Input::Skip { server, index } => match manager.skip(&server, index) {
            Ok(()) => write.line(format!("Skipping the next run of #{} on {}", index, server)),
            Err(err) => write.error(Red.paint(err.to_string())),
        },
        Input::Shutdown { server, delay } => {
            match manager.safe_shutdown(&server, delay).await {
                Ok(status) => write.line(format!("{}: {}", server, status)),
                Err(err) => write.error(Red.paint(err.to_string())),
            }
        }
        Input::Command { server, text } => {
            match manager.execute_command(&server, &text).await {
                Ok(response) => write.line(response),
                Err(err) => write.error(Red.paint(err.to_string())),
            }
        }
    }
}

fn print_help(write: &mut ShellWrite) {
    write.line(format!(
        "{} {}",
        Green.paint(env!("CARGO_PKG_NAME")),
        env!("CARGO_PKG_VERSION")
    ));
    write.line("");
    write.line(Yellow.paint("BUILTINS"));
    write.line("    !help                        View this help listing");
    write.line("    !servers                     Show every server and its connection state");
    write.line("    !status                      Show scheduled commands and their next run");
    write.line(format!(
        "    !skip {}      Skip the next run of a scheduled command",
        Green.paint("<SERVER> <INDEX>")
    ));
    write.line(format!(
        "    !shutdown {}  Warn, kick and lock players, then shut down",
        Green.paint("<SERVER> [SECS]")
    ));
    write.line(format!(
        "    {}    Run a command on a server",
        Green.paint("[SERVER] <COMMAND>")
    ));
    write.line("");
    write.line("The server name can be left out when only one server is configured.");
}
