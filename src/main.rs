mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use cmdgate_tools::{
    AuditLogger, Bindings, ExecutionResult, ExecutionStatus, GateDecision, ToolDefinition,
    ToolRegistry, ToolRunner, ToolsConfig,
};
use tokio_util::sync::CancellationToken;

const EXIT_TIMEOUT: u8 = 124;
const EXIT_DENIED: u8 = 126;
const EXIT_CANCELLED: u8 = 130;

/// Run declarative shell tools under deny/confirm policy, timeouts and output filtering.
#[derive(Parser, Debug)]
#[command(name = "cmdgate", version, about)]
struct Cli {
    /// Path to the host config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List registered tools
    List {
        /// Print the agent-facing tool description instead
        #[arg(long)]
        prompt: bool,
    },
    /// Render a tool's command and show the gate decision without running it
    Check {
        tool: String,
        /// Parameter binding as name=value
        #[arg(short = 'p', long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },
    /// Invoke a tool
    Run {
        tool: String,
        /// Parameter binding as name=value
        #[arg(short = 'p', long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
        /// Skip the confirmation prompt for ask_user matches
        #[arg(long)]
        yes: bool,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Parse tool definition files and report errors
    Validate {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got `{s}`"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty parameter name in `{s}`"));
    }
    Ok((name.to_owned(), value.to_owned()))
}

fn bindings(params: Vec<(String, String)>) -> Bindings {
    params
        .into_iter()
        .map(|(name, value)| (name, serde_json::Value::String(value)))
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    init_subscriber();
    let cli = Cli::parse();

    let config_path = config::resolve_config_path(cli.config.as_deref());
    let tools_config = config::load(&config_path)?;

    match cli.command {
        Commands::List { prompt } => {
            list(&tools_config, prompt);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Check { tool, params } => check(&tools_config, &tool, &bindings(params)),
        Commands::Run {
            tool,
            params,
            yes,
            json,
        } => run(&tools_config, &tool, &bindings(params), yes, json).await,
        Commands::Validate { files } => Ok(validate(&tools_config, &files)),
    }
}

fn init_subscriber() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

fn list(config: &ToolsConfig, prompt: bool) {
    let registry = ToolRegistry::load(config);
    if prompt {
        print!("{}", registry.format_for_prompt());
        return;
    }
    for tool in registry.tools() {
        let kind = if tool.is_service() { " [service]" } else { "" };
        println!("{}{kind}  {}", tool.id, tool.description);
    }
}

fn check(config: &ToolsConfig, tool: &str, bindings: &Bindings) -> anyhow::Result<ExitCode> {
    let runner = ToolRunner::new(ToolRegistry::load(config), config);
    let check = runner.check(tool, bindings)?;
    println!("command:  {}", check.command);
    match &check.decision {
        GateDecision::Allow => {
            println!("decision: allow");
            Ok(ExitCode::SUCCESS)
        }
        GateDecision::RequireConfirmation { pattern } => {
            println!("decision: requires confirmation (`{pattern}`)");
            Ok(ExitCode::SUCCESS)
        }
        GateDecision::Deny { pattern } => {
            println!("decision: deny (`{pattern}`)");
            Ok(ExitCode::from(EXIT_DENIED))
        }
    }
}

async fn run(
    config: &ToolsConfig,
    tool: &str,
    bindings: &Bindings,
    yes: bool,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let mut runner = ToolRunner::new(ToolRegistry::load(config), config);
    if config.audit.enabled {
        let logger = AuditLogger::from_config(&config.audit)
            .await
            .context("failed to open audit log")?;
        runner = runner.with_audit(logger);
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to listen for ctrl-c: {e}");
            return;
        }
        ctrl_c.cancel();
    });

    let mut result = runner.invoke_with_cancel(tool, bindings, yes, &cancel).await?;
    if let ExecutionStatus::ConfirmationRequired { pattern } = &result.status {
        let prompt = format!("`{}` matches `{pattern}`. Run it?", result.command);
        let approved = tokio::task::spawn_blocking(move || {
            dialoguer::Confirm::new()
                .with_prompt(prompt)
                .default(false)
                .interact()
        })
        .await??;
        if !approved {
            eprintln!("declined");
            return Ok(ExitCode::from(EXIT_DENIED));
        }
        result = runner.invoke_with_cancel(tool, bindings, true, &cancel).await?;
    }

    print_result(&result, json)?;

    if let ExecutionStatus::Started { .. } = result.status {
        eprintln!("{tool} is running, press Ctrl-C to stop");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(Duration::from_secs(1)) => {
                    if !runner.service_status(tool).await.is_some_and(|s| s.running) {
                        break;
                    }
                }
            }
        }
        for status in runner.shutdown().await {
            print!("{}", status.output);
            eprintln!("{} stopped after {} ms", status.tool_id, status.uptime_ms);
        }
    }

    Ok(exit_code(&result.status))
}

fn print_result(result: &ExecutionResult, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else {
        print!("{result}");
        if !result.output.is_empty() && !result.output.ends_with('\n') {
            println!();
        }
        eprintln!("{}: {}", result.tool_id, result.status);
    }
    Ok(())
}

fn exit_code(status: &ExecutionStatus) -> ExitCode {
    match status {
        ExecutionStatus::Completed {
            exit_code: Some(code),
        } => u8::try_from(*code).map_or(ExitCode::FAILURE, ExitCode::from),
        ExecutionStatus::Completed { exit_code: None } => ExitCode::FAILURE,
        ExecutionStatus::TimedOut => ExitCode::from(EXIT_TIMEOUT),
        ExecutionStatus::Denied { .. } | ExecutionStatus::ConfirmationRequired { .. } => {
            ExitCode::from(EXIT_DENIED)
        }
        ExecutionStatus::Cancelled => ExitCode::from(EXIT_CANCELLED),
        ExecutionStatus::Started { .. } => ExitCode::SUCCESS,
    }
}

fn validate(config: &ToolsConfig, files: &[PathBuf]) -> ExitCode {
    let mut failed = false;
    for path in files {
        match ToolDefinition::load_file(path, config.default_timeout()) {
            Ok(def) if !def.available.allows(config.environment) => {
                println!("ok    {} (unavailable in {:?})", def.id, config.environment);
            }
            Ok(def) => println!("ok    {}", def.id),
            Err(e) => {
                failed = true;
                println!("error {}: {e}", path.display());
            }
        }
    }
    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
