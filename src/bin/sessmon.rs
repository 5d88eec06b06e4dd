//! sessmon - Streaming session monitor
//!
//! Follows a backend analysis or agent execution session and prints every
//! published snapshot as one JSON line on stdout. Logs go to stderr.
//!
//! # Usage
//!
//! ```bash
//! # Follow a session until it finishes
//! sessmon watch exec-42
//!
//! # Pause, resume or stop it
//! sessmon control exec-42 pause
//!
//! # Answer a pending approval
//! sessmon approve exec-42 --response "ship it"
//! sessmon approve exec-42 --reject
//! ```

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sessmon_client::{
    ClientConfig, Command as SessionCommand, ConnectionState, HttpTransport, SessionController,
    SessionTransport, StreamMethod,
};
use sessmon_core::SessionId;
use sessmon_protocol::Framing;

/// sessmon - follow and control streamed backend sessions
#[derive(Parser, Debug)]
#[command(name = "sessmon", version, about)]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/sessmon/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Backend base URL (overrides config and SESSMON_URL)
    #[arg(long, global = true)]
    url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream a session and print snapshots as JSON lines
    Watch {
        session_id: String,

        /// Stream path template containing {session_id}
        #[arg(long)]
        stream_path: Option<String>,

        /// Open the stream with POST and this JSON body
        #[arg(long)]
        post_body: Option<String>,

        #[arg(long, value_enum)]
        framing: Option<FramingArg>,
    },
    /// Send a lifecycle command
    Control {
        session_id: String,
        action: ActionArg,
    },
    /// Answer the pending approval request
    Approve {
        session_id: String,

        /// Reject instead of approving
        #[arg(long)]
        reject: bool,

        /// Free-text response sent with the decision
        #[arg(long)]
        response: Option<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FramingArg {
    DataLines,
    EventStream,
}

impl From<FramingArg> for Framing {
    fn from(arg: FramingArg) -> Self {
        match arg {
            FramingArg::DataLines => Framing::DataLines,
            FramingArg::EventStream => Framing::EventStream,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ActionArg {
    Pause,
    Resume,
    Stop,
}

impl From<ActionArg> for SessionCommand {
    fn from(arg: ActionArg) -> Self {
        match arg {
            ActionArg::Pause => SessionCommand::pause(),
            ActionArg::Resume => SessionCommand::resume(),
            ActionArg::Stop => SessionCommand::stop(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // stdout carries snapshots; logs go to stderr
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sessmon=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config =
        ClientConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(url) = args.url {
        config.base_url = url.trim_end_matches('/').to_string();
    }

    match args.command {
        Command::Watch {
            session_id,
            stream_path,
            post_body,
            framing,
        } => {
            if let Some(path) = stream_path {
                config.stream.path = path;
            }
            if let Some(body) = post_body {
                let body = serde_json::from_str(&body).context("--post-body is not valid JSON")?;
                config.stream.method = StreamMethod::Post;
                config.stream.body = Some(body);
            }
            if let Some(framing) = framing {
                config.framing = framing.into();
            }
            watch(config, SessionId::new(session_id)).await
        }
        Command::Control { session_id, action } => {
            send(&config, SessionId::new(session_id), action.into()).await
        }
        Command::Approve {
            session_id,
            reject,
            response,
        } => {
            let command = if reject {
                SessionCommand::reject(response)
            } else {
                SessionCommand::approve(response)
            };
            send(&config, SessionId::new(session_id), command).await
        }
    }
}

async fn watch(config: ClientConfig, session_id: SessionId) -> Result<()> {
    info!(session_id = %session_id, base_url = %config.base_url, "Watching session");

    let transport = Arc::new(HttpTransport::new(&config).context("Failed to build HTTP client")?);
    let controller = SessionController::new(config, transport);
    let handle = controller.open(session_id).await?;
    let mut updates = handle.subscribe();
    let stdout = std::io::stdout();
    let mut completed = 0;

    let outcome = loop {
        let snapshot = updates.borrow_and_update().clone();
        writeln!(stdout.lock(), "{}", serde_json::to_string(&snapshot)?)
            .context("Failed to write snapshot")?;

        if snapshot.session.completed_steps() != completed {
            completed = snapshot.session.completed_steps();
            info!(
                completed,
                progress_pct = snapshot.session.progress_percentage().round(),
                "Step completed"
            );
        }

        match snapshot.connection {
            ConnectionState::Finished => break Ok(()),
            ConnectionState::Failed { reason } => break Err(reason),
            _ => {}
        }

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break Ok(());
            }
        }
    };

    controller.close().await;
    match outcome {
        Ok(()) => Ok(()),
        Err(reason) => bail!("Session failed: {reason}"),
    }
}

async fn send(config: &ClientConfig, session_id: SessionId, command: SessionCommand) -> Result<()> {
    let transport = HttpTransport::new(config).context("Failed to build HTTP client")?;
    let outbound = command.to_outbound();

    if let Err(e) = transport.send(&session_id, &outbound).await {
        warn!(session_id = %session_id, command = %command.action, error = %e, "Command failed");
        bail!("{} failed: {e}", command.action);
    }
    info!(session_id = %session_id, command = %command.action, "Command delivered");
    Ok(())
}
