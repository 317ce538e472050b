// Marmot terminal front end: host or join a handoff link, type edges to hand off.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use marmot_core::Message;
use marmot_linux::{config, Config, ConnectionEvent, ConnectionManager};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "marmot", version, about = "Hand an on-screen object between two devices")]
struct Cli {
    /// Config file (default: ~/.config/marmot/config.toml, then /etc/marmot/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Name announced to the peer.
    #[arg(long, global = true)]
    name: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Wait for the other device to join.
    Host {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Connect to a hosting device.
    Join {
        host: String,
        #[arg(long)]
        port: Option<u16>,
    },
}

/// One line typed on stdin.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    HandOff(String),
    Hello,
    Quit,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging();

    let mut cfg = config::load(cli.config.as_deref());
    if let Some(name) = cli.name {
        cfg.name = name;
    }

    let rt = tokio::runtime::Runtime::new().context("starting runtime")?;
    rt.block_on(run(cli.command, cfg))
}

/// Used when `RUST_LOG` is unset or invalid.
const DEFAULT_LOG_FILTER: &str = "warn,marmot_linux=info,marmot_core=info";

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

async fn run(command: Command, cfg: Config) -> anyhow::Result<()> {
    let conn = ConnectionManager::new(cfg.connection());
    let mut inbound = conn.subscribe();
    tokio::spawn(print_events(conn.events()));

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let started = tokio::select! {
        ok = start(&conn, &command, cfg.port) => ok,
        res = &mut shutdown => {
            conn.stop().await;
            return res.context("waiting for signal");
        }
    };
    if !started {
        conn.stop().await;
        bail!("could not establish link");
    }
    conn.send(Message::hello(cfg.name.clone()))
        .await
        .context("sending hello")?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            msg = inbound.recv() => match msg {
                Some(m) => println!("{}", describe(&m)),
                None => break,
            },
            line = stdin.next_line() => {
                let Some(line) = line.context("reading stdin")? else { break };
                let outgoing = match parse_input(&line) {
                    Some(Input::Quit) => break,
                    Some(Input::Hello) => Message::hello(cfg.name.clone()),
                    Some(Input::HandOff(edge)) => Message::hand_off(edge),
                    None if line.trim().is_empty() => continue,
                    None => {
                        eprintln!("unknown command {line:?} (left|right|top|bottom|hello|quit)");
                        continue;
                    }
                };
                if let Err(e) = conn.send(outgoing).await {
                    eprintln!("send failed: {e}");
                }
            }
            res = &mut shutdown => {
                res.context("waiting for signal")?;
                break;
            }
        }
    }
    conn.stop().await;
    Ok(())
}

async fn start(conn: &ConnectionManager, command: &Command, default_port: u16) -> bool {
    match command {
        Command::Host { port } => conn.start_as_host(port.unwrap_or(default_port)).await,
        Command::Join { host, port } => {
            println!("status: connecting to {host}...");
            conn.start_as_join(host, port.unwrap_or(default_port)).await
        }
    }
}

/// Status lines for the terminal; the stand-in for the on-screen status text.
async fn print_events(mut events: broadcast::Receiver<ConnectionEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match event {
            ConnectionEvent::Listening { addr } => println!("status: listening on {addr}..."),
            ConnectionEvent::Connected { peer, .. } => println!("status: connected to {peer}"),
            ConnectionEvent::HandOffReceived { .. } => {}
            ConnectionEvent::Closed { reason } => println!("status: closed ({reason:?})"),
        }
    }
}

fn describe(msg: &Message) -> String {
    match msg {
        Message::Hello { name, .. } => format!("peer: {name}"),
        Message::HandOff { edge, at_ms } => format!("handoff from peer ({edge} @ {at_ms})"),
    }
}

fn parse_input(line: &str) -> Option<Input> {
    match line.trim().to_ascii_lowercase().as_str() {
        edge @ ("left" | "right" | "top" | "bottom") => {
            Some(Input::HandOff(edge.to_ascii_uppercase()))
        }
        "hello" => Some(Input::Hello),
        "quit" | "exit" => Some(Input::Quit),
        _ => None,
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_host_and_join() {
        let cli = Cli::parse_from(["marmot", "--name", "tablet", "host", "--port", "7000"]);
        assert_eq!(cli.name.as_deref(), Some("tablet"));
        assert!(matches!(cli.command, Command::Host { port: Some(7000) }));

        let cli = Cli::parse_from(["marmot", "join", "192.168.1.5"]);
        match cli.command {
            Command::Join { host, port } => {
                assert_eq!(host, "192.168.1.5");
                assert_eq!(port, None);
            }
            other => panic!("expected join, got {other:?}"),
        }
    }

    #[test]
    fn edge_words_become_handoffs() {
        assert_eq!(parse_input("right"), Some(Input::HandOff("RIGHT".into())));
        assert_eq!(parse_input("  Left \n"), Some(Input::HandOff("LEFT".into())));
        assert_eq!(parse_input("hello"), Some(Input::Hello));
        assert_eq!(parse_input("quit"), Some(Input::Quit));
        assert_eq!(parse_input("sideways"), None);
        assert_eq!(parse_input(""), None);
    }

    #[test]
    fn default_log_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
        assert!(DEFAULT_LOG_FILTER.contains("marmot_linux=info"));
        assert!(DEFAULT_LOG_FILTER.contains("marmot_core=info"));
    }

    #[test]
    fn describes_messages() {
        assert_eq!(describe(&Message::hello("Pixel")), "peer: Pixel");
        assert_eq!(
            describe(&Message::hand_off_at("RIGHT", 12)),
            "handoff from peer (RIGHT @ 12)"
        );
    }
}
