//! `jimi` binary: the thin CLI surface described in `spec.md` §6. Owns
//! argument parsing, terminal rendering, and Ctrl-C wiring; everything else
//! is `jimi-core`.

mod provider;
mod render;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use jimi_core::agent_spec::AgentSpec;
use jimi_core::approval::ApprovalGate;
use jimi_core::event_bus::EventBus;
use jimi_core::events::DoneCause;
use jimi_core::llm::LlmProvider;
use jimi_core::message::ContentPart;
use jimi_core::session::Session;
use jimi_core::tools::{Dispatcher, ToolRegistry};

use provider::{LlmConfig, OpenAiCompatibleProvider};

const DEFAULT_SYSTEM_PROMPT: &str = "You are jimi, a careful coding assistant. \
Use the tools available to you, report honestly on what you tried, and ask \
before taking destructive actions.";

#[derive(Parser)]
#[command(name = "jimi", about = "A conversational coding agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// One-shot execution: run a single prompt to completion and exit.
    Run {
        #[arg(long)]
        agent: Option<PathBuf>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        yolo: bool,
        /// MCP server config path. Accepted for CLI-surface completeness;
        /// MCP tool bodies are not implemented by this crate.
        #[arg(long = "mcp")]
        mcp: Vec<PathBuf>,
        prompt: String,
    },
    /// Interactive REPL with `/`-prefixed meta-commands.
    Chat {
        #[arg(long)]
        agent: Option<PathBuf>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        yolo: bool,
        #[arg(long = "mcp")]
        mcp: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let exit_code = match cli.command {
        Command::Run { agent, model, yolo, mcp, prompt } => {
            warn_on_unsupported_mcp(&mcp);
            run_once(agent, model, yolo, prompt).await?
        }
        Command::Chat { agent, model, yolo, mcp } => {
            warn_on_unsupported_mcp(&mcp);
            chat(agent, model, yolo).await?
        }
    };
    std::process::exit(exit_code);
}

fn warn_on_unsupported_mcp(mcp: &[PathBuf]) {
    for path in mcp {
        tracing::warn!(path = %path.display(), "MCP server config accepted but not wired up; no MCP tools will be registered");
    }
}

async fn load_system_prompt(agent_path: Option<PathBuf>) -> Result<String> {
    match agent_path {
        Some(path) => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading agent system prompt from {}", path.display())),
        None => Ok(DEFAULT_SYSTEM_PROMPT.to_string()),
    }
}

fn build_provider(model: Option<String>) -> Arc<dyn LlmProvider> {
    Arc::new(OpenAiCompatibleProvider::new(LlmConfig::from_env(model)))
}

fn build_session_id() -> String {
    format!("{:x}", std::process::id())
}

async fn run_once(
    agent: Option<PathBuf>,
    model: Option<String>,
    yolo: bool,
    prompt: String,
) -> Result<i32> {
    let workdir = std::env::current_dir()?;
    let system_prompt = load_system_prompt(agent).await?;
    let bus = Arc::new(EventBus::new());
    let gate = Arc::new(if yolo { ApprovalGate::yolo() } else { ApprovalGate::new() });
    let provider = build_provider(model);
    let agent_spec = AgentSpec::new("main", system_prompt);
    let dispatcher = Dispatcher::new(ToolRegistry::new());
    let tool_context = Arc::new(CliToolContext::new(build_session_id(), workdir.clone()));

    let session = Session::open(
        build_session_id(),
        workdir,
        bus.clone(),
        gate,
        provider,
        agent_spec,
        dispatcher,
        tool_context,
    )
    .await?;

    let mut render_task = render::spawn_plain_renderer(bus.subscribe(), bus.clone());
    let executor = session.executor();

    let cancel_signal = executor.cancel_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_signal.set();
        }
    });

    let cause = executor.execute(vec![ContentPart::text(prompt)]).await;
    render_task.stop().await;

    Ok(exit_code_for(cause))
}

fn exit_code_for(cause: DoneCause) -> i32 {
    match cause {
        DoneCause::Natural => 0,
        DoneCause::FatalError => 1,
        DoneCause::Cancelled => 2,
        DoneCause::MaxSteps => 3,
    }
}

async fn chat(agent: Option<PathBuf>, model: Option<String>, yolo: bool) -> Result<i32> {
    let workdir = std::env::current_dir()?;
    let system_prompt = load_system_prompt(agent).await?;
    let bus = Arc::new(EventBus::new());
    let gate = Arc::new(if yolo { ApprovalGate::yolo() } else { ApprovalGate::new() });
    let provider = build_provider(model);
    let agent_spec = AgentSpec::new("main", system_prompt);
    let dispatcher = Dispatcher::new(ToolRegistry::new());
    let tool_context = Arc::new(CliToolContext::new(build_session_id(), workdir.clone()));

    let session = Session::open(
        build_session_id(),
        workdir,
        bus.clone(),
        gate,
        provider,
        agent_spec,
        dispatcher,
        tool_context,
    )
    .await?;

    let mut render_task = render::spawn_repl_renderer(bus.subscribe(), bus.clone());

    println!("jimi chat — type /help for meta-commands, /quit to exit.");
    let mut editor = rustyline::DefaultEditor::new()?;
    let mut last_cause = DoneCause::Natural;

    loop {
        let line = match editor.readline("jimi> ") {
            Ok(line) => line,
            Err(rustyline::error::ReadlineError::Eof)
            | Err(rustyline::error::ReadlineError::Interrupted) => break,
            Err(e) => return Err(e.into()),
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(line);

        if let Some(meta) = line.strip_prefix('/') {
            match meta {
                "help" => print_help(),
                "status" => print_status(&session).await,
                "tools" => print_tools(),
                "reset" => {
                    session.reset().await?;
                    println!("context reset to the start of the session.");
                }
                "compact" => {
                    session.force_compact_next_step();
                    println!("compaction will run before the next step.");
                }
                "init" => init_agents_md(&session).await?,
                "quit" => break,
                other => println!("unknown meta-command: /{other}"),
            }
            continue;
        }

        let executor = session.executor();
        let cancel_signal = executor.cancel_signal();
        let ctrl_c = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel_signal.set();
            }
        });
        last_cause = executor.execute(vec![ContentPart::text(line)]).await;
        ctrl_c.abort();
    }

    render_task.stop().await;
    Ok(exit_code_for(last_cause))
}

fn print_help() {
    println!("/help    show this message");
    println!("/status  show session id, step count, and token estimate");
    println!("/tools   list registered tools");
    println!("/reset   discard all history back to the start of the session");
    println!("/compact force a context summarisation before the next step");
    println!("/init    analyse the working directory and write AGENTS.md");
    println!("/quit    exit");
}

async fn print_status(session: &Session) {
    println!("session: {}", session.session_id);
    println!("messages: {}", session.context.len().await);
    println!("estimated tokens: {}", session.context.token_count().await);
}

fn print_tools() {
    println!("(no tools registered — tool bodies are outside this crate's scope)");
}

async fn init_agents_md(session: &Session) -> Result<()> {
    let path = session.workdir.join("AGENTS.md");
    if tokio::fs::metadata(&path).await.is_ok() {
        println!("AGENTS.md already exists at {}", path.display());
        return Ok(());
    }
    let listing = jimi_core::session::list_work_dir(&session.workdir).await;
    let mut content = String::from("# AGENTS.md\n\nGenerated by `jimi chat /init`.\n\n## Working directory contents\n\n");
    for entry in listing {
        content.push_str("- ");
        content.push_str(&entry);
        content.push('\n');
    }
    tokio::fs::write(&path, content).await?;
    println!("wrote {}", path.display());
    Ok(())
}

struct CliToolContext {
    session_id: String,
    cwd: PathBuf,
    cancel: tokio_util::sync::CancellationToken,
}

impl CliToolContext {
    fn new(session_id: String, cwd: PathBuf) -> Self {
        CliToolContext {
            session_id,
            cwd,
            cancel: tokio_util::sync::CancellationToken::new(),
        }
    }
}

#[async_trait::async_trait]
impl jimi_core::tools::ToolContext for CliToolContext {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn cwd(&self) -> &std::path::Path {
        &self.cwd
    }

    fn cancel_signal(&self) -> tokio_util::sync::CancellationToken {
        self.cancel.clone()
    }
}
