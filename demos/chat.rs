//! Interactive chat REPL over the run engine.
//!
//! Usage:
//!   OPENAI_API_KEY=sk-... cargo run --example chat
//!   cargo run --example chat -- --base-url http://localhost:11434 --model llama3.2
//!
//! Tools: `roll_dice` runs on the server, `delete_note` asks you first,
//! `local_time` is executed on this side after the run pauses for it.
//!
//! Ctrl-C or type "exit" / "quit" to leave.

use std::io::{self, Write};
use std::sync::Arc;

use agui_runtime::{
    AgentConfig, ChannelApprovalSurface, ChatMessage, ContextResource, DefaultInterruptHandler,
    EngineResumer, Event, HumanApprovalHandler, InterruptRegistry, OpenAiProvider,
    RequestContext, RunDriver, RunEngine, RunInput, StaticContextResolver, TerminalOutcome,
    ToolExecutionHandler, ToolHandler, ToolRegistry,
};
use async_trait::async_trait;
use clap::Parser;
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "chat", about = "Chat with an agent run engine")]
struct Cli {
    /// Model to use
    #[arg(long, default_value = "gpt-4o-mini")]
    model: String,

    /// Max output tokens per turn
    #[arg(long, default_value_t = 4096)]
    max_tokens: u32,

    /// OpenAI-compatible API base URL
    #[arg(long, default_value = "https://api.openai.com")]
    base_url: String,

    /// Emit a messages snapshot before each terminal event
    #[arg(long)]
    snapshots: bool,
}

struct RollDice;

#[async_trait]
impl ToolHandler for RollDice {
    async fn call(&self, input: &Value, ctx: &RequestContext) -> Result<String, String> {
        let sides = input["sides"].as_u64().unwrap_or(6).max(1);
        let roll = uuid::Uuid::new_v4().as_u128() % u128::from(sides) + 1;
        ctx.update_state(|s| s["last_roll"] = json!(roll));
        Ok(roll.to_string())
    }
}

struct DeleteNote;

#[async_trait]
impl ToolHandler for DeleteNote {
    async fn call(&self, input: &Value, _ctx: &RequestContext) -> Result<String, String> {
        let id = input["id"].as_str().ok_or("missing `id`")?;
        Ok(format!("note {id} deleted"))
    }
}

struct LocalTime;

#[async_trait]
impl ToolHandler for LocalTime {
    async fn call(&self, _input: &Value, _ctx: &RequestContext) -> Result<String, String> {
        Ok(chrono::Local::now().to_rfc2822())
    }
}

fn server_tools() -> ToolRegistry {
    ToolRegistry::new()
        .add(
            "roll_dice",
            json!({
                "name": "roll_dice",
                "description": "Roll a die",
                "input_schema": {
                    "type": "object",
                    "properties": { "sides": { "type": "integer" } }
                }
            }),
            RollDice,
        )
        .add_with_approval(
            "delete_note",
            json!({
                "name": "delete_note",
                "description": "Delete a note by id",
                "input_schema": {
                    "type": "object",
                    "properties": { "id": { "type": "string" } },
                    "required": ["id"]
                }
            }),
            DeleteNote,
        )
        .add_frontend(
            "local_time",
            json!({
                "name": "local_time",
                "description": "The user's local time",
                "input_schema": { "type": "object", "properties": {} }
            }),
        )
}

fn read_line() -> Option<String> {
    let mut line = String::new();
    match io::stdin().read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim().to_string()),
    }
}

fn print_event(event: &Event) {
    match event {
        Event::TextMessageStart { .. } => eprint!("\x1b[1;32magent>\x1b[0m "),
        Event::TextMessageContent { delta, .. } => {
            print!("{delta}");
            io::stdout().flush().ok();
        }
        Event::TextMessageEnd { .. } => println!(),
        Event::ToolCallStart { tool_call_name, .. } => {
            eprintln!("\x1b[33m  [tool: {tool_call_name}]\x1b[0m");
        }
        Event::ToolCallResult { content, .. } => {
            let truncated = if content.len() > 200 {
                format!("{}...", content.chars().take(200).collect::<String>())
            } else {
                content.clone()
            };
            eprintln!("\x1b[33m  [result]\x1b[0m {truncated}");
        }
        Event::StateDelta { delta, .. } => {
            eprintln!("\x1b[2m  [state: {}]\x1b[0m", Value::Array(delta.clone()));
        }
        _ => {}
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let mut provider = OpenAiProvider::new(&cli.base_url).with_model(&cli.model);
    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        provider = provider.with_api_key(key);
    }

    let resolver = StaticContextResolver::new(vec![ContextResource::always(
        "style",
        "Style",
        json!("Answer briefly."),
    )]);

    let config = AgentConfig {
        model: cli.model.clone(),
        max_tokens: cli.max_tokens,
        emit_messages_snapshot: cli.snapshots,
        ..AgentConfig::from_env()
    };
    let engine = Arc::new(RunEngine::with_standard_pipeline(
        Arc::new(provider),
        Arc::new(resolver),
        Arc::new(server_tools()),
        config,
    ));

    // Approvals are answered on the terminal.
    let (surface, mut approvals) = ChannelApprovalSurface::new(8);
    tokio::spawn(async move {
        while let Some(pending) = approvals.recv().await {
            eprintln!(
                "\x1b[1;35mapprove?\x1b[0m {} [y/N] ",
                pending.request.payload["toolCalls"]
            );
            let answer = tokio::task::spawn_blocking(read_line).await.ok().flatten();
            if matches!(answer.as_deref(), Some("y" | "yes")) {
                pending.approve();
            } else {
                pending.deny();
            }
        }
    });

    let client_tools = ToolRegistry::new().add(
        "local_time",
        json!({ "name": "local_time" }),
        LocalTime,
    );
    let registry = InterruptRegistry::new()
        .with(ToolExecutionHandler::new(Arc::new(client_tools)))
        .with(HumanApprovalHandler::new(Arc::new(surface)))
        .with(DefaultInterruptHandler);
    let resumer = Arc::new(EngineResumer::new(engine.clone()));

    eprintln!("agui-runtime chat");
    eprintln!("model: {}", cli.model);
    eprintln!("---");

    let thread_id = uuid::Uuid::new_v4().to_string();
    let mut history: Vec<ChatMessage> = Vec::new();

    loop {
        eprint!("\x1b[1;36myou>\x1b[0m ");
        io::stderr().flush().ok();

        let Some(line) = read_line() else { break };
        if line.is_empty() {
            continue;
        }
        if matches!(line.as_str(), "exit" | "quit" | "/q") {
            break;
        }

        history.push(ChatMessage::user(&line));
        let mut input = RunInput::new(&thread_id, uuid::Uuid::new_v4().to_string());
        input.messages = history.clone();

        let mut driver = RunDriver::new(registry.clone(), resumer.clone());
        let stream = engine.start_stream(input).boxed();
        match driver.drive(stream, print_event).await {
            Ok(TerminalOutcome::Success { .. }) => {}
            Ok(TerminalOutcome::Interrupt(info)) => {
                eprintln!("\x1b[2m  [paused: {}]\x1b[0m", info.reason);
            }
            Ok(TerminalOutcome::Error { message, code }) => {
                eprintln!(
                    "\x1b[1;31merror:\x1b[0m {message} ({})",
                    code.as_deref().unwrap_or("unknown")
                );
            }
            Err(e) => eprintln!("\x1b[1;31merror:\x1b[0m {e}"),
        }
        history.extend(driver.accumulator().messages().iter().cloned());
    }

    eprintln!("bye.");
}
