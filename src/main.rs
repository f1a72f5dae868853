mod agent;
mod config;
mod conversation;
mod error;
mod events;
mod frontend;
mod memory;
mod prompt;
mod providers;
mod session;
mod spawn;
mod tools;

use agent::eval::eval;
use agent::form::Form;
use agent::world::World;
use anyhow::Result;
use clap::Parser;
use config::Config;
use conversation::Conversation;
use error::AgentError;
use events::EventWriter;
use frontend::{AgentHandles, CliEffects, HeadlessEffects};
use memory::MemoryStore;
use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tools::ToolRegistry;

/// Recursive terminal agent: streams an LLM, interprets its tool markup,
/// and loops until the model declares completion.
#[derive(Parser, Debug)]
#[command(name = "gloop", version)]
struct Cli {
    /// Model to use (shorthand for --model)
    model_positional: Option<String>,

    /// Run one task headless, writing JSONL events, then exit
    #[arg(long)]
    task: Option<String>,

    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    provider: Option<String>,

    /// Verbose logging to stderr
    #[arg(long)]
    debug: bool,

    /// Where the headless event stream is written
    #[arg(long)]
    events_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(if cli.debug {
            tracing::Level::DEBUG
        } else {
            tracing::Level::WARN
        })
        .init();

    let config = Config::load();
    let provider_name = cli
        .provider
        .clone()
        .unwrap_or_else(|| config.default_provider.clone());
    let model = cli
        .model
        .clone()
        .or_else(|| cli.model_positional.clone())
        .unwrap_or_else(|| config.default_model.clone());

    let api_key = config.resolved_api_key(&provider_name);
    let provider = providers::create_provider(&provider_name, api_key.as_deref())?;
    tracing::debug!(provider = provider.name(), model = %model, "provider ready");
    let conversation = Arc::new(Conversation::new(provider, model.clone()));
    conversation.set_provider_routing(config.provider_routing.clone());

    let workspace = config.workspace_dir();
    let state_dir = workspace.join(".gloop");
    let tools_dir = state_dir.join("tools");
    let memory = Arc::new(MemoryStore::new(state_dir.join("memory.txt")));

    let registry = tools::shared(ToolRegistry::new());
    let builtins = tools::builtin::default_tools(&registry, &tools_dir, &workspace);
    let dynamic = tools::manifest::load_dir(&tools_dir, &workspace)?;
    {
        let mut reg = registry.write().expect("registry lock");
        for tool in builtins {
            reg.register(tool);
        }
        reg.swap_dynamic(dynamic);
    }

    let handles = AgentHandles {
        conversation: Arc::clone(&conversation),
        registry: Arc::clone(&registry),
        memory,
        workspace: workspace.clone(),
        tools_dir,
        model,
        provider: provider_name,
    };
    handles.refresh_system();

    // A process that finds a reboot session resumes where it left off.
    let first_input = match session::take(&workspace) {
        Ok(Some(saved)) => {
            conversation.set_history(saved.history);
            handles.refresh_system();
            tracing::info!(reason = %saved.reason, "restored reboot session");
            Some(session::resume_input(&saved.reason))
        }
        Ok(None) => None,
        Err(e) => {
            tracing::warn!("ignoring unreadable reboot session: {e:#}");
            None
        }
    };

    if let Some(task) = cli.task {
        let events_path = cli.events_file.clone().unwrap_or_else(|| {
            state_dir.join(format!("events-{}.jsonl", uuid::Uuid::new_v4()))
        });
        let code = headless(handles, task, events_path, config.context_prune_threshold).await?;
        std::process::exit(code);
    }

    interactive(handles, first_input, config.context_prune_threshold).await
}

/// One run: evaluate the form, letting ctrl-c fire the run's cancellation
/// token so the evaluator can unwind through its cooperative checkpoints.
async fn run_one(
    form: Form,
    handles: &AgentHandles,
    effects: &dyn agent::effects::Effects,
    prune_threshold: usize,
) -> Result<()> {
    let token = CancellationToken::new();
    let mut world = World::new(
        Arc::clone(&handles.conversation),
        Arc::clone(&handles.registry),
        token.clone(),
        prune_threshold,
    );

    let run = eval(form, &mut world, effects);
    tokio::pin!(run);
    tokio::select! {
        result = &mut run => result,
        _ = tokio::signal::ctrl_c() => {
            token.cancel();
            run.await
        }
    }
}

async fn interactive(
    handles: AgentHandles,
    first_input: Option<String>,
    prune_threshold: usize,
) -> Result<()> {
    let effects = CliEffects::new(handles.clone());
    println!("gloop — /tools lists tools, /install adds one, ctrl-c interrupts.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pending: VecDeque<String> = first_input.into_iter().collect();

    loop {
        let line = match pending.pop_front() {
            Some(queued) => queued,
            None => {
                print!("> ");
                std::io::stdout().flush().ok();
                match lines.next_line().await? {
                    Some(line) => line,
                    None => break,
                }
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let form = agent::route_input(&line);
        match run_one(form, &handles, &effects, prune_threshold).await {
            Ok(()) => {}
            Err(e) if AgentError::is_aborted(&e) => effects.abort_cleanup(),
            Err(e) => eprintln!("Error: {e:#}"),
        }
    }

    Ok(())
}

/// Headless task mode: the subagent surface. Events go to the JSONL file;
/// the exit code reports success to the spawning parent.
async fn headless(
    handles: AgentHandles,
    task: String,
    events_path: PathBuf,
    prune_threshold: usize,
) -> Result<i32> {
    let events = EventWriter::create(&events_path)?;
    let effects = HeadlessEffects::new(handles.clone(), events);
    effects.emit_start();

    let input = spawn::with_task_suffix(&task);
    let result = run_one(Form::Think(input), &handles, &effects, prune_threshold).await;
    effects.emit_usage();

    match result {
        Ok(()) => Ok(0),
        Err(e) => {
            effects.emit_error(&format!("{e:#}"));
            Ok(1)
        }
    }
}
