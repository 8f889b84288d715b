//! # Orchestrator (C9)
//!
//! A one-shot CLI for provisioning and tearing down a migasfree-swarm
//! stack: renders the stack's environment context, creates the secrets
//! and overlay networks a deployment needs, and drives the Swarm API
//! through Portainer (the same proxy [`swarm_monitor`] uses read-only).
//! Not latency-critical, so deliberately thin (spec §4.6).

mod context;
mod portainer_admin;
mod template;

use clap::{Parser, Subcommand};
use portainer_admin::PortainerAdmin;
use std::path::PathBuf;
use tracing::{error, info, warn};

const TEMPLATES_DIR: &str = "/stack/templates";
const STACK_TEMPLATE: &str = "docker-stack.yml.j2";

#[derive(Parser)]
#[command(name = "orchestrator", about = "migasfree-swarm stack lifecycle CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Portainer base URL, e.g. http://portainer:9000/api.
    #[arg(long, env = "PORTAINER_URL")]
    portainer_url: String,

    /// Path to the Portainer API token.
    #[arg(long, env = "PORTAINER_TOKEN_FILE", default_value = "/run/secrets/portainer_token")]
    portainer_token_file: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// Render the stack's context, create its secrets/networks, and deploy it.
    Deploy { stack: String },
    /// Remove one or more deployed stacks.
    Undeploy { stacks: Vec<String> },
    /// Write or update a stack's environment context without deploying.
    ConfigStack { stack: String },
    /// Print the web console URLs for a stack's agents.
    Consoles { stack: String },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "orchestrator=info".into()),
        )
        .init();

    if dotenvy::dotenv().is_err() {
        warn!("no .env file found, relying on system environment variables");
    }

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Deploy { stack } => deploy(&cli.portainer_url, &cli.portainer_token_file, &stack).await,
        Command::Undeploy { stacks } => undeploy(&cli.portainer_url, &cli.portainer_token_file, &stacks).await,
        Command::ConfigStack { stack } => config_stack(&stack),
        Command::Consoles { stack } => consoles(&stack),
    }
}

fn config_stack(stack: &str) -> anyhow::Result<()> {
    context::load_cluster_context()?;
    let ctx = context::load_stack_context(stack)?;
    info!(stack, "stack context written to {}", context::stack_env_path(stack).display());
    for (key, value) in ctx.as_map() {
        info!("  {key}={value}");
    }
    Ok(())
}

async fn deploy(portainer_url: &str, token_file: &PathBuf, stack: &str) -> anyhow::Result<()> {
    context::load_cluster_context()?;
    let ctx = context::load_stack_context(stack)?;

    let admin = PortainerAdmin::connect(portainer_url, token_file).await?;

    let overlay = format!("{stack}_overlay");
    let internal = format!("{stack}_internal");
    admin.create_overlay_network(&overlay, false).await?;
    admin.create_overlay_network(&internal, true).await?;

    for secret_name in ["postgres_password", "portainer_token"] {
        let full_name = format!("{stack}_{secret_name}");
        if let Some(value) = ctx.get(&secret_name.to_uppercase()) {
            admin.create_secret(&full_name, value).await?;
        } else {
            warn!("no value for {secret_name}, skipping secret creation");
        }
    }

    let templates_dir = PathBuf::from(TEMPLATES_DIR);
    let rendered = template::render(&templates_dir, STACK_TEMPLATE, ctx.as_map())?;

    let env: Vec<(String, String)> = ctx.as_map().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    admin.deploy_stack(stack, &rendered, &env).await?;

    info!(stack, "deployed");
    Ok(())
}

async fn undeploy(portainer_url: &str, token_file: &PathBuf, stacks: &[String]) -> anyhow::Result<()> {
    let admin = PortainerAdmin::connect(portainer_url, token_file).await?;
    for stack in stacks {
        match admin.remove_stack(stack).await {
            Ok(()) => info!(stack, "removed"),
            Err(e) => error!(stack, "failed to remove: {e}"),
        }
    }
    Ok(())
}

fn consoles(stack: &str) -> anyhow::Result<()> {
    let ctx = context::load_stack_context(stack)?;
    let fqdn = ctx.get("FQDN").unwrap_or(stack);
    println!("manager console:  https://{fqdn}/v1/private/tunnel/ws/agents/<agent_id>?service=ssh");
    println!("metrics:          https://{fqdn}/v1/private/metrics/json");
    println!("crl:              https://{fqdn}/v1/public/crl");
    Ok(())
}
