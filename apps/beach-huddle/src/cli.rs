use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use doc_store::RedisStore;
use huddle::config::Config;
use huddle::negotiation::{CallEvent, CallHandle, RoleState, join_call, start_call};
use huddle::rtc::{RtcConnection, SilentCapture};
use huddle::schema::SessionDescription;
use huddle::session::Sessions;
use huddle::telemetry::{self, LogConfig, LogLevel};
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "beach-huddle",
    about = "Peer-to-peer audio/video calls signaled through a shared Redis store",
    author,
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "REDIS_URL",
        help = "Redis instance both participants can reach"
    )]
    redis_url: Option<String>,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "HUDDLE_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "HUDDLE_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a call and print its join code
    Start,
    /// Join a call using the code printed by `start`
    Join {
        #[arg(value_name = "CODE")]
        code: String,
    },
    /// Show the signaling state stored for a join code
    Inspect {
        #[arg(value_name = "CODE")]
        code: String,
    },
}

pub async fn run(cli: Cli) -> Result<()> {
    let log_config = cli.logging.to_config();
    telemetry::init(&log_config).context("failed to configure logging")?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let mut config = Config::from_env()?;
    if let Some(url) = cli.redis_url {
        config.redis_url = url;
    }
    let store = RedisStore::connect(&config.redis_url, config.session_ttl_seconds)
        .await
        .with_context(|| format!("failed to connect to {}", config.redis_url))?;
    let sessions = Sessions::with_collection(Arc::new(store), config.collection.clone());

    match cli.command {
        Command::Start => start(&sessions, &config).await,
        Command::Join { code } => join(&sessions, &config, &code).await,
        Command::Inspect { code } => inspect(&sessions, &code).await,
    }
}

async fn open_connection(config: &Config) -> Result<Arc<RtcConnection>> {
    let capture = Arc::new(SilentCapture::new());
    let connection = RtcConnection::new(&config.ice, capture)
        .await
        .context("failed to set up the peer connection")?;
    Ok(Arc::new(connection))
}

async fn start(sessions: &Sessions, config: &Config) -> Result<()> {
    let connection = open_connection(config).await?;
    let call = start_call(sessions, connection.clone()).await?;
    println!("join code: {}", call.session_id());
    println!("on the other machine run: beach-huddle join {}", call.session_id());
    let outcome = hold(call).await;
    hang_up(&connection).await;
    outcome
}

async fn join(sessions: &Sessions, config: &Config, code: &str) -> Result<()> {
    let connection = open_connection(config).await?;
    let call = join_call(sessions, connection.clone(), code.trim()).await?;
    println!("joined {}; waiting for media", call.session_id());
    let outcome = hold(call).await;
    hang_up(&connection).await;
    outcome
}

async fn hang_up(connection: &RtcConnection) {
    if let Err(err) = connection.close().await {
        warn!(error = %err, "failed to close peer connection");
    }
}

async fn inspect(sessions: &Sessions, code: &str) -> Result<()> {
    let summary = sessions.inspect(code.trim()).await?;
    println!("session {}", summary.session_id);
    println!("  offer:  {}", describe(summary.record.offer.as_ref()));
    println!("  answer: {}", describe(summary.record.answer.as_ref()));
    println!("  offerer candidates:  {}", summary.offerer_candidates);
    println!("  answerer candidates: {}", summary.answerer_candidates);
    Ok(())
}

fn describe(description: Option<&SessionDescription>) -> String {
    match description {
        Some(description) => format!("present ({} bytes of sdp)", description.sdp.len()),
        None => "absent".to_string(),
    }
}

/// Report progress until the call fails or the user hangs up. Hanging up
/// writes nothing to the store.
async fn hold<S: RoleState>(mut call: CallHandle<S>) -> Result<()> {
    let role = call.role().as_str();
    let mut state = call.state_watch();
    let mut state_open = true;
    let mut events_open = true;
    loop {
        tokio::select! {
            changed = state.changed(), if state_open => {
                if changed.is_err() {
                    state_open = false;
                    continue;
                }
                let current = state.borrow_and_update().clone();
                info!(session = %call.session_id(), role, state = ?current, "call state changed");
                if current.is_settled() {
                    println!("call state: {current:?}");
                }
            }
            event = call.next_event(), if events_open => match event {
                Some(CallEvent::RemoteTrack(track)) => {
                    println!("receiving {:?} from the peer", track.kind);
                }
                Some(CallEvent::RelayFailed { direction, error }) => {
                    warn!(?direction, %error, "candidate relay hiccup");
                }
                Some(CallEvent::Failed(reason)) => bail!("call failed: {reason}"),
                None => events_open = false,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("hanging up");
                return Ok(());
            }
        }
    }
}
