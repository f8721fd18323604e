use std::path::PathBuf;
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stepflow_core::config::AppConfig;
use stepflow_core::types::{Finding, RunId, RunStatus};
use stepflow_core::workflow::Workflow;
use stepflow_engine::{format_event, spawn_sink, ConsoleSink, Executor, JsonlSink, MemorySink, RunResult};
use stepflow_graph::validator::{self, ValidateOptions};
use stepflow_invoker::ProcessInvoker;

#[derive(Parser)]
#[command(name = "stepflow", version, about = "Run automation workflows built from step graphs")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "stepflow.toml", env = "STEPFLOW_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow
    Run {
        /// Workflow JSON file
        workflow: PathBuf,
        /// Seed or override a variable (value parsed as JSON, else taken as text)
        #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_var)]
        vars: Vec<(String, Value)>,
        /// Print the run result as JSON on stdout
        #[arg(long)]
        json: bool,
        /// Directory that relative script paths resolve against
        #[arg(long)]
        working_dir: Option<PathBuf>,
    },
    /// Check a workflow without running it
    Validate {
        /// Workflow JSON file
        workflow: PathBuf,
        /// Print findings as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the effective configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn parse_var(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err("variable name must not be empty".to_string());
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stepflow=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "stepflow", &mut std::io::stdout());
        return Ok(());
    }

    let config = AppConfig::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Validate { workflow, json } => {
            let workflow = Workflow::load(&workflow)?;
            let options = ValidateOptions {
                allow_implicit_entry: config.executor.allow_implicit_entry,
            };
            let findings = validator::validate(&workflow, &options);
            report_findings(&workflow, &findings, json)?;
            if validator::has_errors(&findings) {
                std::process::exit(RunStatus::Failed.exit_code());
            }
        }
        Commands::Run {
            workflow,
            vars,
            json,
            working_dir,
        } => {
            let mut workflow = Workflow::load(&workflow)?;
            workflow.variables.extend(vars);

            let status = run_workflow(&config, workflow, json, working_dir).await?;
            std::process::exit(status.exit_code());
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

async fn run_workflow(
    config: &AppConfig,
    workflow: Workflow,
    json_output: bool,
    working_dir: Option<PathBuf>,
) -> anyhow::Result<RunStatus> {
    let mut invoker = ProcessInvoker::from_config(config);
    if let Some(dir) = working_dir {
        invoker = invoker.with_working_dir(dir);
    }
    let executor = Arc::new(Executor::new(config.executor.clone(), Arc::new(invoker)));

    let run_id = RunId::new();
    let recent = Arc::new(MemorySink::new(config.log.memory_capacity));
    let mut pumps = vec![spawn_sink(executor.event_bus(), run_id.clone(), recent.clone())];
    if config.log.console {
        pumps.push(spawn_sink(
            executor.event_bus(),
            run_id.clone(),
            Arc::new(ConsoleSink::new()),
        ));
    }
    if config.log.file {
        match JsonlSink::create(&config.log_dir(), &workflow.id).await {
            Ok(sink) => {
                info!(path = %sink.path().display(), "Writing run log");
                pumps.push(spawn_sink(executor.event_bus(), run_id.clone(), Arc::new(sink)));
            }
            Err(e) => warn!(error = %e, "Run log disabled"),
        }
    }

    let handle = executor.start_as(run_id, workflow);

    let cancel = handle.cancellation_token();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Interrupt received, stopping run...");
        cancel.cancel();
    });

    let result = handle.wait().await?;
    for pump in pumps {
        pump.await.ok();
    }

    if json_output {
        println!("{}", serde_json::to_string_pretty(&result_json(&result))?);
    } else {
        print_summary(&result);
        if result.status == RunStatus::Failed && !config.log.console {
            println!("Recent events:");
            for event in recent.recent(10) {
                println!("  {}", format_event(&event));
            }
        }
    }
    Ok(result.status)
}

fn result_json(result: &RunResult) -> Value {
    let error = result.error.as_ref().map(|e| {
        json!({
            "kind": e.kind(),
            "nodeId": e.node_id(),
            "message": e.to_string(),
        })
    });
    json!({
        "runId": result.run_id.0,
        "status": result.status,
        "context": result.context,
        "path": result.path,
        "error": error,
        "elapsedMs": result.elapsed_ms,
    })
}

fn print_summary(result: &RunResult) {
    println!("Run {}: {}", result.run_id, result.status);
    println!("Path: {}", result.path.join(" -> "));
    if let Some(e) = &result.error {
        match e.node_id() {
            Some(node) => println!("Error at '{}' ({}): {}", node, e.kind(), e),
            None => println!("Error ({}): {}", e.kind(), e),
        }
    }
    if !result.context.is_empty() {
        println!("Context:");
        for (key, value) in &result.context {
            println!("  {} = {}", key, value);
        }
    }
}

fn report_findings(workflow: &Workflow, findings: &[Finding], json_output: bool) -> anyhow::Result<()> {
    if json_output {
        println!("{}", serde_json::to_string_pretty(findings)?);
        return Ok(());
    }
    if findings.is_empty() {
        println!("Workflow '{}' is valid.", workflow.name);
        return Ok(());
    }
    for finding in findings {
        println!("{}", finding);
    }
    let errors = findings.iter().filter(|f| f.is_error()).count();
    println!(
        "{} error(s), {} warning(s)",
        errors,
        findings.len() - errors
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var() {
        assert_eq!(parse_var("n=3").unwrap(), ("n".to_string(), json!(3)));
        assert_eq!(parse_var("name=bob").unwrap(), ("name".to_string(), json!("bob")));
        assert_eq!(parse_var("list=[1,2]").unwrap().1, json!([1, 2]));
        assert_eq!(parse_var("eq=a=b").unwrap().1, json!("a=b"));
        assert!(parse_var("novalue").is_err());
        assert!(parse_var("=x").is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "stepflow", "run", "wf.json", "--var", "x=10", "--var", "mode=fast", "--json",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { workflow, vars, json, .. } => {
                assert_eq!(workflow, PathBuf::from("wf.json"));
                assert_eq!(vars.len(), 2);
                assert!(json);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
