//! Drive one stdio plugin through the engine.
//!
//! Usage:
//!   cargo run -p tendril-mcp --example stdio_client -- <command> [args...] [--list] [--tool <name>] [--json '{...}']
//!
//! Examples:
//!   # List the tools a stdio plugin exposes
//!   cargo run -p tendril-mcp --example stdio_client -- uvx mcp-server-git --list
//!
//!   # Call a tool with JSON arguments
//!   cargo run -p tendril-mcp --example stdio_client -- uvx mcp-server-git --tool git_status --json '{"repo_path":"."}'

use anyhow::{Context, Result, bail};
use indexmap::IndexSet;
use serde_json::Value;
use std::env;
use tendril_mcp::config::TransportConfig;
use tendril_mcp::{EngineSettings, PluginConfig, PluginEngine, PluginSet};
use tracing_subscriber::EnvFilter;

const PLUGIN_NAME: &str = "demo";

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args: Vec<String> = env::args().skip(1).collect();
    let Some((command, command_args, flags)) = split_args(&args) else {
        eprintln!("Usage: stdio_client <command> [args...] [--list] [--tool <name>] [--json '{{...}}']");
        std::process::exit(2);
    };

    let mut settings = EngineSettings::default();
    settings.audit.path = env::temp_dir().join("tendril-demo-audit.jsonl");
    let plugin = PluginConfig {
        name: PLUGIN_NAME.to_string(),
        transport: TransportConfig::Local {
            command,
            args: command_args,
            env: IndexSet::new(),
            cwd: None,
        },
        disabled: false,
        tags: vec!["demo".to_string()],
    };
    let engine = PluginEngine::new(PluginSet::from_configs([plugin], settings.clone()), settings);

    let status = engine.start(PLUGIN_NAME).await.context("failed to start plugin")?;
    println!("Plugin status: {status}");

    let result = run(&engine, flags).await;
    engine.shutdown().await;
    result
}

async fn run(engine: &PluginEngine, flags: Flags) -> Result<()> {
    let client = engine.client_manager().client(PLUGIN_NAME).await?;
    let tools = client.list_capabilities().await.context("failed to list tools")?;
    println!("Discovered {} tool(s):", tools.len());
    for tool in tools.iter() {
        println!("- {}: {}", tool.name, tool.description.clone().unwrap_or_default());
    }

    if flags.list {
        return Ok(());
    }

    if let Some(name) = flags.tool_name {
        let arguments = match flags.tool_args {
            Some(raw) => serde_json::from_str::<Value>(&raw).context("--json is not valid JSON")?,
            None => Value::Object(Default::default()),
        };
        if !arguments.is_object() {
            bail!("--json must be a JSON object");
        }

        let output = engine
            .invoke(PLUGIN_NAME, &name, arguments)
            .await
            .map_err(|error| anyhow::anyhow!(error.user_message()))
            .context("tool invocation failed")?;
        println!("\nTool result:\n{}", serde_json::to_string_pretty(&output)?);
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

struct Flags {
    list: bool,
    tool_name: Option<String>,
    tool_args: Option<String>,
}

fn split_args(args: &[String]) -> Option<(String, Vec<String>, Flags)> {
    // Everything until the first flag is the command line.
    let split = args.iter().position(|arg| arg.starts_with("--")).unwrap_or(args.len());
    let (head, tail) = args.split_at(split);
    let (command, command_args) = head.split_first()?;

    let mut flags = Flags {
        list: false,
        tool_name: None,
        tool_args: None,
    };
    let mut rest = tail.iter();
    while let Some(flag) = rest.next() {
        match flag.as_str() {
            "--list" => flags.list = true,
            "--tool" => flags.tool_name = rest.next().cloned(),
            "--json" => flags.tool_args = rest.next().cloned(),
            _ => {}
        }
    }

    Some((command.clone(), command_args.to_vec(), flags))
}
