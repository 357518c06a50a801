use clap::Parser;
use skein_core::SkeinConfig;
use skein_engine::backend::BackendClient;
use skein_engine::command::{ProcessingMode, PromptSources};
use skein_engine::{AgentEvent, ChatRequest, HttpBackend, Orchestrator};
use skein_mcp::{ChildProcessLauncher, ToolRegistry};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the config file
    #[arg(short, long, default_value = "skein.toml")]
    config: String,

    /// Default processing mode: chat or agent
    #[arg(short, long, default_value = "chat")]
    mode: String,

    /// File whose contents back the {{document}} token
    #[arg(short, long)]
    document: Option<PathBuf>,

    /// Run a single prompt and exit instead of starting the REPL
    #[arg(short, long)]
    prompt: Option<String>,
}

/// Prompt sources for a terminal host: the "active document" is an optional
/// file given on the command line; there is no clipboard.
struct FileSources {
    document: Option<PathBuf>,
}

impl PromptSources for FileSources {
    fn active_document(&self) -> Option<String> {
        let path = self.document.as_ref()?;
        match std::fs::read_to_string(path) {
            Ok(content) => Some(content),
            Err(e) => {
                error!("Failed to read document {}: {}", path.display(), e);
                None
            }
        }
    }

    fn clipboard(&self) -> Option<String> {
        None
    }
}

fn parse_mode(s: &str) -> ProcessingMode {
    match s.to_ascii_lowercase().as_str() {
        "agent" => ProcessingMode::Agent,
        _ => ProcessingMode::Chat,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut mode = parse_mode(&args.mode);

    info!("Loading config from {}...", args.config);
    let config = SkeinConfig::load_or_default(&args.config);

    let registry = Arc::new(ToolRegistry::new(
        config.tool_servers.clone(),
        Box::new(ChildProcessLauncher),
        Duration::from_secs(config.agent.tool_timeout_secs),
    ));
    info!("Connecting tool servers...");
    registry.initialize().await;

    let backend = Arc::new(HttpBackend::new(&config.backend, &config.retry)?);
    let sources = Arc::new(FileSources {
        document: args.document.clone(),
    });
    let orchestrator = Orchestrator::new(
        backend.clone(),
        registry.clone(),
        sources,
        &config.backend,
        config.agent.clone(),
    );

    if let Some(prompt) = args.prompt {
        run_request(&orchestrator, &prompt, mode).await;
        registry.cleanup().await;
        return Ok(());
    }

    println!("Skein online ({} mode). Type 'help' for commands, 'quit' to exit.", args.mode);
    print!("> ");
    io::stdout().flush()?;

    let stdin = io::stdin();
    let mut input = String::new();

    loop {
        input.clear();
        if stdin.read_line(&mut input)? == 0 {
            break; // EOF
        }
        let trimmed = input.trim();

        match trimmed {
            "" => {}
            "quit" | "exit" => break,
            "help" => {
                println!("Commands: servers, tools, resources, models, patterns,");
                println!("          reconnect <id>, mode <chat|agent>, yt <url>, quit");
                println!("Anything else is sent as a prompt (/chat or /agent prefix overrides the mode).");
            }
            "servers" => {
                for conn in registry.connections().await {
                    println!(
                        "- {} ({:?}) {} tool(s){}",
                        conn.id,
                        conn.status,
                        conn.tools.len(),
                        conn.error
                            .map(|e| format!(" — {}", e))
                            .unwrap_or_default()
                    );
                }
            }
            "tools" => {
                for tool in registry.tools_for_llm().await {
                    println!("- {} — {}", tool.qualified_name(), tool.description);
                }
            }
            "resources" => {
                for (server_id, resource) in registry.available_resources().await {
                    println!("- [{}] {} ({})", server_id, resource.uri, resource.name);
                }
            }
            "models" => {
                list_catalog(backend.list_models(&CancellationToken::new()).await);
            }
            "patterns" => {
                list_catalog(backend.list_patterns(&CancellationToken::new()).await);
            }
            _ => {
                if let Some(url) = trimmed.strip_prefix("yt ") {
                    match backend
                        .fetch_transcript(url.trim(), &CancellationToken::new())
                        .await
                    {
                        Ok(transcript) => println!("{}", transcript),
                        Err(e) => println!("Error: {}", e),
                    }
                } else if let Some(id) = trimmed.strip_prefix("reconnect ") {
                    match registry.reconnect(id.trim()).await {
                        Ok(()) => println!("Reconnected '{}'", id.trim()),
                        Err(e) => println!("Reconnect failed: {}", e),
                    }
                } else if let Some(m) = trimmed.strip_prefix("mode ") {
                    mode = parse_mode(m.trim());
                    println!("Default mode set to {:?}", mode);
                } else {
                    run_request(&orchestrator, trimmed, mode).await;
                }
            }
        }

        print!("> ");
        io::stdout().flush()?;
    }

    registry.cleanup().await;
    Ok(())
}

fn list_catalog(result: Result<Vec<String>, skein_core::Error>) {
    match result {
        Ok(items) => {
            for item in items {
                println!("- {}", item);
            }
        }
        Err(e) => println!("Error: {}", e),
    }
}

/// Run one request with Ctrl-C wired to its cancellation token. Agent
/// progress events are printed as they arrive.
async fn run_request(orchestrator: &Orchestrator, prompt: &str, mode: ProcessingMode) {
    let cancel = CancellationToken::new();
    let (tx, mut rx) = tokio::sync::mpsc::channel::<AgentEvent>(64);

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                AgentEvent::StepStart { step } => println!("[step {}]", step),
                AgentEvent::ReasoningComplete {
                    decision,
                    goal_status,
                    ..
                } => println!("  reasoning: {:?} — {}", decision, goal_status),
                AgentEvent::ActionStart { server, tool, .. } => {
                    println!("  running {}:{} ...", server, tool)
                }
                AgentEvent::ActionComplete { success, .. } => {
                    println!("  {}", if success { "ok" } else { "failed" })
                }
            }
        }
    });

    let request = ChatRequest::new(prompt, mode);
    let send = orchestrator.send(request, &cancel, Some(tx));
    tokio::pin!(send);

    let result = loop {
        tokio::select! {
            res = &mut send => break res,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Cancelling...");
                cancel.cancel();
            }
        }
    };
    let _ = printer.await;

    match result {
        Ok(response) => {
            for warning in &response.warnings {
                println!("! {}", warning);
            }
            println!("{}", response.text);
            if let Some(cid) = response.conversation_id {
                info!("conversation id: {}", cid);
            }
        }
        Err(e) if e.is_cancelled() => println!("(request cancelled)"),
        Err(e) => println!("Error: {}", e),
    }
}
