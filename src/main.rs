//! Command-line driver for tn3270r
//!
//! Connects to a host and reads keyboard actions from standard input, one
//! per line (`Enter`, `PF(3)`, `String("logon\n")`, ...). Plain text lines
//! are typed into the current field. Lines starting with `:` are commands:
//! `:connect <host>`, `:disconnect`, `:screen`, `:quit`.

use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{error, info};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use tn3270r::config::{self, EmulatorOptions, SessionConfig};
use tn3270r::controller::{Controller, StateTopic};
use tn3270r::keyboard::Action;

enum Command {
    Action(Action),
    Connect(String),
    Disconnect,
    Screen,
    Quit,
}

struct CliArgs {
    host: Option<String>,
    config_path: Option<String>,
    port: Option<u16>,
    ca_bundle: Option<String>,
    reconnect: bool,
    once: bool,
}

fn print_usage() {
    println!("Usage: tn3270r [options] [host]");
    println!("  host                 [prefix:]*[lu@]hostname[:port] or a hosts file entry");
    println!("  --config <path>      Session configuration file (JSON)");
    println!("  --port, -p <port>    Default port");
    println!("  --ca-bundle <path>   Extra trusted CA certificates (PEM or DER)");
    println!("  --reconnect          Reconnect automatically after a disconnect");
    println!("  --once               Exit when the host disconnects");
    println!("  --help, -h           Show this help");
}

fn parse_args() -> Result<Option<CliArgs>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut cli = CliArgs {
        host: None,
        config_path: None,
        port: None,
        ca_bundle: None,
        reconnect: false,
        once: false,
    };
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                cli.config_path = Some(args.get(i).context("--config requires a path")?.clone());
            }
            "--port" | "-p" => {
                i += 1;
                let value = args.get(i).context("--port requires a value")?;
                cli.port = Some(value.parse().context("--port requires a numeric value")?);
            }
            "--ca-bundle" => {
                i += 1;
                cli.ca_bundle = Some(args.get(i).context("--ca-bundle requires a path")?.clone());
            }
            "--reconnect" => cli.reconnect = true,
            "--once" => cli.once = true,
            "--help" | "-h" => {
                print_usage();
                return Ok(None);
            }
            arg if arg.starts_with("--") => bail!("Unknown option {arg}"),
            arg => {
                if cli.host.is_some() {
                    bail!("Only one host may be given");
                }
                cli.host = Some(arg.to_string());
            }
        }
        i += 1;
    }
    Ok(Some(cli))
}

fn load_options(cli: &CliArgs) -> Result<EmulatorOptions> {
    let path = cli
        .config_path
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(config::default_config_path);
    let mut session = SessionConfig::new(path.to_string_lossy().into_owned(), "tn3270r".to_string());
    match std::fs::read_to_string(&path) {
        Ok(json) => session
            .from_json(&json)
            .with_context(|| format!("parsing {}", path.display()))?,
        // Defaults when the default file does not exist yet
        Err(e) if e.kind() == io::ErrorKind::NotFound && cli.config_path.is_none() => {}
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    }

    if let Some(port) = cli.port {
        session.set_property("connection.port", i64::from(port));
    }
    if let Some(ca) = &cli.ca_bundle {
        session.set_property("connection.tls.caBundlePath", ca.as_str());
    }
    if cli.reconnect {
        session.set_property("session.reconnect", true);
    }
    if cli.once {
        session.set_property("session.once", true);
    }
    Ok(EmulatorOptions::from_config(&session)?)
}

fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim_end_matches(['\r', '\n']);
    if let Some(cmd) = line.strip_prefix(':') {
        let (name, arg) = cmd.split_once(' ').unwrap_or((cmd, ""));
        return match name {
            "connect" => Some(Command::Connect(arg.trim().to_string())),
            "disconnect" => Some(Command::Disconnect),
            "screen" => Some(Command::Screen),
            "quit" => Some(Command::Quit),
            _ => {
                error!("Unknown command :{name}");
                None
            }
        };
    }
    if line.is_empty() {
        return None;
    }
    Some(Command::Action(
        Action::from_str(line).unwrap_or_else(|_| Action::String(line.to_string())),
    ))
}

fn print_screen(ctlr: &Controller) {
    let screen = ctlr.screen();
    for row in 0..screen.rows() {
        println!("{}", screen.row_text(row).trim_end());
    }
    println!(
        "-- {} {}",
        ctlr.state().name(),
        tn3270r::keyboard::KeyboardLock::decode("", ctlr.keyboard().lock().to_bits())
    );
}

/// The session loop, on its own thread: the controller is single-threaded
fn run_session(options: EmulatorOptions, host: Option<String>, mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut ctlr = Controller::new(options);
    ctlr.register(StateTopic::Connect, Box::new(|up| info!("{}", if up { "Connected" } else { "Disconnected" })));
    ctlr.register(StateTopic::Mode3270, Box::new(|on| info!("3270 mode {}", if on { "on" } else { "off" })));

    if let Some(host) = host {
        if let Err(e) = ctlr.host_connect(&host) {
            error!("{e}");
        }
    }

    while !ctlr.is_exiting() {
        loop {
            match rx.try_recv() {
                Ok(Command::Action(action)) => {
                    ctlr.run_action(action);
                }
                Ok(Command::Connect(host)) => {
                    if let Err(e) = ctlr.host_connect(&host) {
                        error!("{e}");
                    }
                }
                Ok(Command::Disconnect) => {
                    ctlr.host_cancel_reconnect();
                    ctlr.host_disconnect(false);
                }
                Ok(Command::Screen) => print_screen(&ctlr),
                Ok(Command::Quit) | Err(mpsc::error::TryRecvError::Disconnected) => {
                    ctlr.host_cancel_reconnect();
                    ctlr.host_disconnect(false);
                    return;
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
            }
        }
        if let Err(e) = ctlr.poll_once(Duration::from_millis(50)) {
            error!("{e}");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let Some(cli) = parse_args()? else {
        return Ok(());
    };
    let options = load_options(&cli)?;

    let (tx, rx) = mpsc::unbounded_channel();
    let host = cli.host.clone();
    let session = tokio::task::spawn_blocking(move || run_session(options, host, rx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let input = tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(cmd) = parse_command(&line) {
                let quit = matches!(cmd, Command::Quit);
                if tx.send(cmd).is_err() || quit {
                    break;
                }
            }
        }
    });

    session.await.context("session thread failed")?;
    input.abort();
    Ok(())
}
