//! Command-line argument parsing and the plain-stdin chat loop.

use std::error::Error;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::cache::ToolCache;
use crate::core::config::Config;
use crate::core::engine::{ConversationEngine, EngineEvent, EngineSettings};
use crate::core::message::{ConversationState, Outcome};
use crate::core::rate_limit::RateLimiter;
use crate::core::transport::HttpTransport;
use crate::tools::fs::{BatchReadFiles, CreateFile, ListFiles, ReadFile, StrReplace};
use crate::tools::search::WebSearch;
use crate::tools::shell::ShellCommand;
use crate::tools::{ToolExecutor, ToolRegistry};
use crate::utils::context::load_project_context;
use crate::utils::logging::TranscriptLog;

const SYSTEM_PROMPT: &str = "You are a helpful assistant with access to local tools. \
Use them when a question concerns the user's files or project; answer directly otherwise.";

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "A command-line chat client for OpenAI-compatible AI APIs with local tools")]
#[command(
    long_about = "Parley is a command-line chat client that connects to OpenAI-compatible APIs \
and lets the model call local tools: reading and writing workspace files, listing \
directories, a restricted shell, and web search.\n\n\
Environment Variables:\n\
  PARLEY_API_KEY          API key (falls back to OPENAI_API_KEY)\n\
  BRAVE_SEARCH_API_KEY    Enables the web_search tool when set\n\n\
Controls:\n\
  Enter             Send the message\n\
  Ctrl+C            Cancel the in-flight turn\n\
  /log              Pause or resume transcript logging\n\
  /usage            Show accumulated token usage\n\
  exit, quit        Leave the session"
)]
pub struct Args {
    /// Model to use for chat
    #[arg(short = 'm', long, value_name = "MODEL")]
    pub model: Option<String>,

    /// API base URL (OpenAI-compatible)
    #[arg(short = 'b', long, value_name = "URL")]
    pub base_url: Option<String>,

    /// Enable transcript logging to the specified file
    #[arg(short = 'l', long, value_name = "FILE")]
    pub log: Option<String>,

    /// Workspace directory tools operate in (defaults to the current directory)
    #[arg(short = 'd', long, value_name = "DIR")]
    pub directory: Option<PathBuf>,

    /// Disable streaming; receive each reply as a single message
    #[arg(long)]
    pub no_stream: bool,

    /// Maximum tool-call request cycles per user turn
    #[arg(long, value_name = "N")]
    pub max_iterations: Option<u32>,

    /// Read configuration from a specific file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

fn resolve_config(args: &Args) -> Result<Config, Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    if let Some(model) = &args.model {
        config.model = model.clone();
    }
    if let Some(base_url) = &args.base_url {
        config.base_url = base_url.clone();
    }
    if args.no_stream {
        config.streaming = false;
    }
    if let Some(max_iterations) = args.max_iterations {
        config.max_iterations = max_iterations;
    }
    Ok(config)
}

fn resolve_api_key() -> Result<String, Box<dyn Error>> {
    std::env::var("PARLEY_API_KEY")
        .or_else(|_| std::env::var("OPENAI_API_KEY"))
        .map_err(|_| "no API key found; set PARLEY_API_KEY or OPENAI_API_KEY".into())
}

fn build_registry(workspace: PathBuf) -> Result<ToolRegistry, Box<dyn Error>> {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ReadFile::new(workspace.clone())))?;
    registry.register(Arc::new(BatchReadFiles::new(workspace.clone())))?;
    registry.register(Arc::new(CreateFile::new(workspace.clone())))?;
    registry.register(Arc::new(StrReplace::new(workspace.clone())))?;
    registry.register(Arc::new(ListFiles::new(workspace.clone())))?;
    registry.register(Arc::new(ShellCommand::new(workspace)))?;
    if let Ok(key) = std::env::var("BRAVE_SEARCH_API_KEY") {
        registry.register(Arc::new(WebSearch::new(key)))?;
    } else {
        debug!("BRAVE_SEARCH_API_KEY not set; web_search disabled");
    }
    Ok(registry)
}

/// Renders engine events until the channel closes. Assistant text goes to
/// stdout; progress goes to stderr so transcripts stay clean.
async fn print_events(mut rx: mpsc::UnboundedReceiver<EngineEvent>) {
    let mut stdout = tokio::io::stdout();
    while let Some(event) = rx.recv().await {
        match event {
            EngineEvent::ContentDelta(delta) => {
                let _ = stdout.write_all(delta.as_bytes()).await;
                let _ = stdout.flush().await;
            }
            EngineEvent::RateLimitWait {
                delay,
                consecutive_failures,
            } => {
                eprintln!(
                    "[waiting {:.1}s before the next request; {consecutive_failures} consecutive failures]",
                    delay.as_secs_f64()
                );
            }
            EngineEvent::ToolCallStarted { name, .. } => {
                eprintln!("[tool: {name}]");
            }
            EngineEvent::ToolCallCompleted { name, ok, .. } => {
                if !ok {
                    eprintln!("[tool {name} failed]");
                }
            }
            EngineEvent::TurnCompleted { .. } => {}
        }
    }
}

pub async fn run_chat(args: Args) -> Result<(), Box<dyn Error>> {
    let config = resolve_config(&args)?;
    let api_key = resolve_api_key()?;
    let workspace = match args.directory {
        Some(directory) => directory,
        None => std::env::current_dir()?,
    };

    let registry = Arc::new(build_registry(workspace.clone())?);
    let cache = Arc::new(ToolCache::new(config.cache_policy()));
    let limiter = Arc::new(Mutex::new(RateLimiter::new(config.backoff_policy())));
    let client = reqwest::Client::new();

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_events(events_rx));

    let mut transcript = TranscriptLog::new(args.log)?;

    let mut prompt = SYSTEM_PROMPT.to_string();
    if let Some(context) = load_project_context(&workspace) {
        prompt.push_str("\n\nProject context:\n\n");
        prompt.push_str(&context);
    }
    let mut state = ConversationState::with_system_prompt(prompt);

    let settings = EngineSettings {
        model: config.model.clone(),
        streaming: config.streaming,
        max_iterations: config.max_iterations,
    };
    // The token is consumed by cancellation, so the engine is rebuilt with a
    // fresh one after every cancelled turn. Limiter, cache, and client are
    // shared across rebuilds.
    let build_engine = |cancel: CancellationToken| {
        let transport = HttpTransport::new(
            client.clone(),
            config.base_url.clone(),
            api_key.clone(),
            Arc::clone(&limiter),
            events_tx.clone(),
            cancel.clone(),
            config.request_timeout(),
            config.rate_limit_attempts,
            config.transport_attempts,
        );
        ConversationEngine::new(
            Arc::new(transport),
            ToolExecutor::new(Arc::clone(&registry), Arc::clone(&cache)),
            events_tx.clone(),
            cancel,
            settings.clone(),
        )
    };

    let mut cancel = CancellationToken::new();
    let mut engine = build_engine(cancel.clone());

    println!("parley {} (model: {})", env!("CARGO_PKG_VERSION"), config.model);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::Write::flush(&mut std::io::stdout())?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        match input {
            "exit" | "quit" => break,
            "/log" => {
                if transcript.is_active() {
                    transcript.pause();
                } else {
                    transcript.resume();
                }
                println!("logging: {}", transcript.status());
                continue;
            }
            "/usage" => {
                println!(
                    "tokens: {} prompt, {} completion",
                    state.usage.prompt_tokens, state.usage.completion_tokens
                );
                continue;
            }
            _ => {}
        }

        transcript.log_user(input)?;
        state.begin_turn(input);

        // Inner scope so the turn future releases its borrows before the
        // outcome is handled.
        let outcome = {
            let turn = engine.run_turn(&mut state);
            tokio::pin!(turn);
            loop {
                tokio::select! {
                    outcome = &mut turn => break outcome,
                    result = tokio::signal::ctrl_c() => {
                        result?;
                        eprintln!("\n[cancelling]");
                        cancel.cancel();
                    }
                }
            }
        };

        match outcome {
            Outcome::Done => {
                let reply = state
                    .final_assistant()
                    .and_then(|message| message.content.clone())
                    .unwrap_or_default();
                if config.streaming {
                    println!();
                } else {
                    println!("{reply}");
                }
                transcript.log_assistant(&reply)?;
            }
            Outcome::ToolLoopExceeded => {
                eprintln!(
                    "[stopped after {} tool iterations without a final answer]",
                    config.max_iterations
                );
            }
            Outcome::Cancelled => {
                cancel = CancellationToken::new();
                engine = build_engine(cancel.clone());
            }
            Outcome::Failed(reason) => {
                eprintln!("[error: {reason}]");
            }
        }
    }

    println!(
        "session tokens: {} prompt, {} completion",
        state.usage.prompt_tokens, state.usage.completion_tokens
    );
    drop(engine);
    drop(build_engine);
    drop(events_tx);
    let _ = printer.await;
    Ok(())
}
