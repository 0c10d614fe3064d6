//! askbridge CLI - talk to the AI agent worker
//!
//! Usage:
//!   askbridge [--config <file>] ask <question> [--mode <mode>] [--username <name>]
//!   askbridge status
//!   askbridge reload
//!   askbridge rewrite <input> [--mode <mode>] [--user-id <id>]
//!   askbridge serve
//!
//! Examples:
//!   askbridge ask "When does the keynote start?" --mode brief
//!   askbridge --config ./askbridge.toml status
//!   echo '{"action":"ask","question":"Where is room B?"}' | askbridge serve

use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use askbridge::logging::init_tracing;
use askbridge::{
    AskRequest, Bridge, BridgeError, BridgeRequest, DetailMode, HistoryTurn, Settings,
    TrainRewriteRequest,
};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinSet;

#[derive(Parser)]
#[command(name = "askbridge")]
#[command(about = "askbridge - Bridge requests to an out-of-process AI agent worker")]
#[command(version)]
struct Cli {
    /// Path to a config file (defaults to the standard search locations)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask the agent a question
    Ask {
        /// The question to ask
        question: String,

        /// Answer detail level
        #[arg(short, long, default_value = "normal")]
        mode: ModeArg,

        /// Name of the person asking
        #[arg(short, long, default_value = "")]
        username: String,

        /// Prior turns as a JSON array of {"question", "answer"} objects
        #[arg(long)]
        history_json: Option<String>,
    },

    /// Show the worker's status report and bridge health
    Status,

    /// Tell the worker to reload its knowledge
    Reload,

    /// Rewrite training input
    Rewrite {
        /// Text to rewrite
        input: String,

        /// Rewrite detail level
        #[arg(short, long, default_value = "normal")]
        mode: ModeArg,

        #[arg(short, long, default_value = "")]
        username: String,

        #[arg(long, default_value = "")]
        user_id: String,
    },

    /// Answer JSON requests read line by line from stdin
    Serve,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Brief,
    Normal,
    Detailed,
}

impl From<ModeArg> for DetailMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Brief => DetailMode::Brief,
            ModeArg::Normal => DetailMode::Normal,
            ModeArg::Detailed => DetailMode::Detailed,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match Settings::load_from(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&settings.logging.level);

    let bridge = Arc::new(Bridge::new(&settings));

    let run = async {
        match cli.command {
            Commands::Ask {
                question,
                mode,
                username,
                history_json,
            } => cmd_ask(&bridge, question, mode, username, history_json).await,
            Commands::Status => cmd_status(&bridge).await,
            Commands::Reload => print_outcome(bridge.reload().await),
            Commands::Rewrite {
                input,
                mode,
                username,
                user_id,
            } => {
                let request = BridgeRequest::TrainRewrite(TrainRewriteRequest {
                    input,
                    mode: mode.into(),
                    username,
                    user_id,
                });
                print_outcome(bridge.call(request, None).await)
            }
            Commands::Serve => cmd_serve(bridge.clone()).await,
        }
    };

    let code = until_interrupted(run, tokio::signal::ctrl_c()).await;

    bridge.shutdown();
    code
}

/// Run a command unless `interrupt` fires first, which exits with 130.
async fn until_interrupted<F, S>(run: F, interrupt: S) -> ExitCode
where
    F: Future<Output = ExitCode>,
    S: Future,
{
    tokio::select! {
        code = run => code,
        _ = interrupt => {
            tracing::info!("interrupted, shutting down");
            ExitCode::from(130)
        }
    }
}

async fn cmd_ask(
    bridge: &Bridge,
    question: String,
    mode: ModeArg,
    username: String,
    history_json: Option<String>,
) -> ExitCode {
    let history: Vec<HistoryTurn> = match history_json.as_deref().map(serde_json::from_str) {
        None => Vec::new(),
        Some(Ok(history)) => history,
        Some(Err(e)) => {
            eprintln!("Invalid --history-json: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let request = AskRequest::new(question)
        .with_mode(mode.into())
        .with_username(username)
        .with_history(history);
    print_outcome(bridge.ask(request).await)
}

async fn cmd_status(bridge: &Bridge) -> ExitCode {
    let outcome = bridge.status().await;
    let code = print_outcome(outcome);
    match serde_json::to_string_pretty(&bridge.health()) {
        Ok(health) => eprintln!("{}", health),
        Err(e) => eprintln!("Failed to render health: {}", e),
    }
    code
}

/// Read one request per line, answer each as soon as it completes.
async fn cmd_serve(bridge: Arc<Bridge>) -> ExitCode {
    let stdout = Arc::new(Mutex::new(tokio::io::stdout()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tasks = JoinSet::new();
    let mut seq: u64 = 0;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                eprintln!("Error reading stdin: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        seq += 1;
        let bridge = bridge.clone();
        let stdout = stdout.clone();
        tasks.spawn(async move {
            let outcome = match parse_serve_line(&line) {
                Ok((request, timeout)) => bridge.call(request, timeout).await,
                Err(e) => Err(e),
            };
            let reply = match outcome {
                Ok(result) => json!({"seq": seq, "ok": true, "result": result}),
                Err(e) => json!({"seq": seq, "ok": false, "error": e.to_string()}),
            };
            let mut out = stdout.lock().await;
            let _ = out.write_all(format!("{}\n", reply).as_bytes()).await;
            let _ = out.flush().await;
        });
    }

    while tasks.join_next().await.is_some() {}

    match serde_json::to_string_pretty(&bridge.health()) {
        Ok(health) => eprintln!("{}", health),
        Err(e) => eprintln!("Failed to render health: {}", e),
    }
    ExitCode::SUCCESS
}

/// Split an optional `timeout_ms` off a request line.
fn parse_serve_line(line: &str) -> Result<(BridgeRequest, Option<Duration>), BridgeError> {
    let mut value: Value = serde_json::from_str(line)
        .map_err(|e| BridgeError::InvalidRequest(e.to_string()))?;
    let timeout = value
        .as_object_mut()
        .and_then(|map| map.remove("timeout_ms"))
        .and_then(|v| v.as_u64())
        .map(Duration::from_millis);
    let request = BridgeRequest::from_value(value)?;
    Ok((request, timeout))
}

fn print_outcome(outcome: Result<Value, BridgeError>) -> ExitCode {
    match outcome {
        Ok(result) => {
            match serde_json::to_string_pretty(&result) {
                Ok(text) => println!("{}", text),
                Err(_) => println!("{}", result),
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
