//! `crew-cli` — terminal chat client for a crew orchestrator.
//!
//! Connects one session over WebSocket, forwards stdin lines as user
//! messages, and renders the streamed tool/agent events. Local commands:
//! `/edit <n> <text>`, `/cancel`, `/usage`, `/history`, `/quit`.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::prelude::*;

use crew_link::config::{self, ChannelConfig, FileConfig};
use crew_link::dispatch::SessionEvent;
use crew_link::error::SessionError;
use crew_link::session::{Session, SessionConfig};
use crew_link::transport::WsDialer;
use crew_protocol::{ClientId, LocalId, RequestTarget, SessionId};

#[derive(Parser)]
#[command(name = "crew-cli")]
#[command(about = "Terminal chat client for a crew orchestrator")]
struct Cli {
    /// Orchestrator websocket endpoint, e.g. ws://127.0.0.1:8700
    #[arg(long)]
    endpoint: Option<String>,

    /// Crew to address
    #[arg(long, conflicts_with = "agent")]
    crew: Option<String>,

    /// Single agent to address
    #[arg(long)]
    agent: Option<String>,

    /// Model override forwarded with every request
    #[arg(long)]
    model: Option<String>,

    /// Resume an existing session id (default: start a new session)
    #[arg(long)]
    session: Option<String>,

    /// Config/data directory (default: ~/.crewlink)
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("crew_link=info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let cli = Cli::parse();
    let data_dir = cli.data_dir.unwrap_or_else(config::default_data_dir);
    let fc: FileConfig = config::load_config(&data_dir)
        .extract()
        .context("invalid configuration")?;

    let endpoint = cli
        .endpoint
        .or(fc.session.endpoint)
        .context("no endpoint: pass --endpoint or set session.endpoint in config.toml")?;

    let target = match (cli.agent.or(fc.session.agent_id), cli.crew.or(fc.session.crew_id)) {
        (Some(agent_id), _) => RequestTarget::Agent(agent_id),
        (None, Some(crew_id)) => RequestTarget::Crew(crew_id),
        (None, None) => bail!("no target: pass --crew or --agent"),
    };

    let session_id = cli
        .session
        .map(|s| SessionId::from(s.as_str()))
        .unwrap_or_else(SessionId::generate);
    eprintln!("session {session_id}");

    let mut session = Session::connect(
        SessionConfig {
            session_id,
            client_id: ClientId::generate(),
            target,
            model: cli.model.or(fc.session.model),
        },
        ChannelConfig::from_file(&fc.transport),
        Box::new(WsDialer::new(endpoint)),
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                match line? {
                    None => {
                        stdin_open = false;
                        session.close().await.ok();
                    }
                    Some(line) => {
                        if handle_input(&mut session, line.trim()).await? {
                            stdin_open = false;
                            session.close().await.ok();
                        }
                    }
                }
            }
            event = session.next_event() => {
                match event {
                    Some(event) => render(&event),
                    None => break,
                }
            }
        }
    }

    Ok(())
}

/// Handle one stdin line. Returns `true` when the user asked to quit.
async fn handle_input(session: &mut Session, line: &str) -> Result<bool> {
    match line {
        "" => {}
        "/quit" => return Ok(true),
        "/cancel" => session.cancel().await?,
        "/usage" => {
            let usage = session.usage();
            println!(
                "  usage: {} input tokens, {} output tokens",
                usage.input_tokens, usage.output_tokens
            );
        }
        "/history" => {
            for record in session.history() {
                println!("  {} [{:?}] {}", record.local_id, record.role, record.content);
            }
        }
        _ if line.starts_with("/edit ") => {
            let rest = line.trim_start_matches("/edit ").trim();
            let Some((n, text)) = rest.split_once(' ') else {
                eprintln!("usage: /edit <n> <new text>");
                return Ok(false);
            };
            let Ok(n) = n.parse::<u64>() else {
                eprintln!("usage: /edit <n> <new text>");
                return Ok(false);
            };
            match session.edit_message(LocalId(n), text).await {
                Ok(_) => {}
                Err(SessionError::TurnInProgress) => eprintln!("wait for the turn to finish"),
                Err(e) => return Err(e.into()),
            }
        }
        _ if line.starts_with('/') => eprintln!("unknown command: {line}"),
        text => match session.send_message(text).await {
            Ok(_) => {}
            Err(SessionError::TurnInProgress) => eprintln!("wait for the turn to finish"),
            Err(e) => return Err(e.into()),
        },
    }
    Ok(false)
}

fn render(event: &SessionEvent) {
    match event {
        SessionEvent::Connected => eprintln!("[connected]"),
        SessionEvent::Reconnecting { attempt } => eprintln!("[reconnecting, attempt {attempt}]"),
        SessionEvent::ConnectionLost => {
            eprintln!("[connection lost — restart the session]")
        }
        SessionEvent::Closed => eprintln!("[closed]"),
        SessionEvent::SendRejected { reason } => eprintln!("[send rejected: {reason}]"),
        SessionEvent::System { content } => eprintln!("[{content}]"),
        SessionEvent::ToolStarted { frame } => eprintln!("→ {} …", frame.name),
        SessionEvent::ToolCompleted { frame } => eprintln!("← {} done", frame.name),
        SessionEvent::AgentFinished { record } => println!("{}", record.content),
        SessionEvent::CrewMessage { sender, content } => println!("{sender}: {content}"),
        SessionEvent::EditAcknowledged { .. } => eprintln!("[edit applied]"),
        SessionEvent::OrchestratorError { message } => eprintln!("[error: {message}]"),
        SessionEvent::Cancelled => eprintln!("[cancelled]"),
    }
}
