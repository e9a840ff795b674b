use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::de::DeserializeOwned;

use junction_core::network::{Network, Region};
use junction_core::{
    CancelToken, NetworkingTask, ReconcileContext, ReconcileError, ReconcileSummary, Reconciler,
    ReconcilerConfig, ResolverRulesTask,
};
use junction_provider_aws::{AwsAccountAccess, RoleConfig};
use junction_state::{
    BackendConfig, BackendLockSet, LocalBackend, StateBackend, StateStore, create_backend,
};

#[derive(Parser)]
#[command(name = "junction")]
#[command(about = "Reconciles network connectivity across accounts", long_about = None)]
struct Cli {
    /// Path to the state file
    #[arg(long, global = true, default_value = LocalBackend::DEFAULT_STATE_FILE)]
    state: PathBuf,

    /// Reconciler configuration (JSON); defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Converge transit gateway attachments, peering connections and their routes
    Networking {
        /// Path to the networking task (JSON)
        task: PathBuf,

        #[command(flatten)]
        run: RunArgs,
    },
    /// Converge resolver rule associations and their shares
    ResolverRules {
        /// Path to the resolver rules task (JSON)
        task: PathBuf,

        #[command(flatten)]
        run: RunArgs,
    },
    /// Show the recorded state of a network
    Show { region: String, network_id: String },
    /// Force release a lock left behind by an interrupted run
    Unlock {
        /// Lock key (e.g., vpc_vpc-0abc or ram_add)
        key: String,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Role assumed in every account; ambient credentials when omitted
    #[arg(long)]
    role: Option<String>,

    /// Give up on the pass after this many seconds
    #[arg(long)]
    timeout: Option<u64>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("JUNCTION_LOG")
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Networking { task, run } => run_networking(&cli, task, run).await,
        Commands::ResolverRules { task, run } => run_resolver_rules(&cli, task, run).await,
        Commands::Show { region, network_id } => run_show(&cli, region, network_id).await,
        Commands::Unlock { key } => run_unlock(&cli, key).await,
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, String> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    serde_json::from_str(&content).map_err(|e| format!("Failed to parse {}: {}", path.display(), e))
}

fn open_backend(cli: &Cli) -> Result<Arc<dyn StateBackend>, String> {
    let config = BackendConfig::local(cli.state.display().to_string());
    let backend = create_backend(&config).map_err(|e| format!("Failed to open state: {}", e))?;
    Ok(Arc::from(backend))
}

fn load_config(path: Option<&Path>) -> Result<ReconcilerConfig, String> {
    match path {
        Some(path) => read_json(path),
        None => Ok(ReconcilerConfig::default()),
    }
}

/// Everything a reconciliation run needs, wired from the command line
struct Session {
    ctx: ReconcileContext,
    store: StateStore,
    locks: BackendLockSet,
    access: AwsAccountAccess,
}

impl Session {
    async fn open(cli: &Cli, run: &RunArgs, operation: &str) -> Result<Self, String> {
        let config = load_config(cli.config.as_deref())?;
        let backend = open_backend(cli)?;
        let store = StateStore::open(backend.clone())
            .await
            .map_err(|e| format!("Failed to load state: {}", e))?;
        let locks = BackendLockSet::new(backend, operation);
        let access = AwsAccountAccess::new(RoleConfig {
            role_name: run.role.clone(),
            ..Default::default()
        })
        .await;

        let cancel = CancelToken::new();
        let on_interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, stopping at the next checkpoint");
                on_interrupt.cancel();
            }
        });

        let mut ctx = ReconcileContext::new(config).with_cancel_token(cancel);
        if let Some(secs) = run.timeout {
            ctx = ctx.with_deadline(Duration::from_secs(secs));
        }

        Ok(Self {
            ctx,
            store,
            locks,
            access,
        })
    }

    fn reconciler(&self) -> Reconciler<'_> {
        Reconciler::new(&self.ctx, &self.store, &self.access, &self.locks)
    }
}

fn report(result: Result<ReconcileSummary, ReconcileError>) -> Result<(), String> {
    let summary = result.map_err(|e| match e {
        ReconcileError::Incomplete(partial) => {
            let mut message = format!("Incomplete {}:", partial.operation);
            for failure in &partial.failures {
                message.push_str(&format!("\n  {} {}", "✗".red(), failure));
            }
            message
        }
        other => other.to_string(),
    })?;

    if summary.is_empty() {
        println!("{}", "No changes needed.".green());
    } else {
        println!("{} {}", "✓".green(), summary);
    }
    Ok(())
}

async fn run_networking(cli: &Cli, task: &Path, run: &RunArgs) -> Result<(), String> {
    let task: NetworkingTask = read_json(task)?;
    let session = Session::open(cli, run, "update_networking").await?;

    println!(
        "{}",
        format!("Reconciling networking for {} in {}...", task.network_id, task.region).cyan()
    );
    report(session.reconciler().update_networking(&task).await)
}

async fn run_resolver_rules(cli: &Cli, task: &Path, run: &RunArgs) -> Result<(), String> {
    let task: ResolverRulesTask = read_json(task)?;
    let session = Session::open(cli, run, "update_resolver_rules").await?;

    println!(
        "{}",
        format!(
            "Reconciling resolver rules for {} in {}...",
            task.network_id, task.region
        )
        .cyan()
    );
    report(session.reconciler().update_resolver_rules(&task).await)
}

async fn run_show(cli: &Cli, region: &str, network_id: &str) -> Result<(), String> {
    let store = StateStore::open(open_backend(cli)?)
        .await
        .map_err(|e| format!("Failed to load state: {}", e))?;
    let network = store
        .network(&Region::new(region), network_id)
        .await
        .ok_or_else(|| format!("Network {} in {} not found", network_id, region))?;

    print!("{}", format_network(&network));
    Ok(())
}

async fn run_unlock(cli: &Cli, key: &str) -> Result<(), String> {
    open_backend(cli)?
        .force_unlock(key)
        .await
        .map_err(|e| format!("Failed to unlock: {}", e))?;
    println!("{} Released lock {}", "✓".green(), key);
    Ok(())
}

fn format_network(network: &Network) -> String {
    let state = &network.state;
    let mut out = format!(
        "{} {} ({}, account {}, {:?})\n",
        network.name.bold(),
        network.id,
        network.region,
        network.account_id,
        state.network_type
    );

    out.push_str(&format!("\n{}\n", "Route tables:".cyan().bold()));
    for table in state.route_tables.values() {
        let association = table
            .subnet_type()
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!("  {} [{}]\n", table.id, association));
        for route in &table.routes {
            out.push_str(&format!("    {} -> {}\n", route.destination, route.owner));
        }
    }

    if !state.transit_gateway_attachments.is_empty() {
        out.push_str(&format!("\n{}\n", "Transit gateway attachments:".cyan().bold()));
        for attachment in &state.transit_gateway_attachments {
            let templates: Vec<String> = attachment.template_ids.iter().map(u64::to_string).collect();
            out.push_str(&format!(
                "  {} on {} (templates {}; subnets {})\n",
                attachment.attachment_id,
                attachment.transit_gateway_id,
                templates.join(","),
                attachment.subnet_ids.join(",")
            ));
        }
    }

    if !state.peering_connections.is_empty() {
        out.push_str(&format!("\n{}\n", "Peering connections:".cyan().bold()));
        for connection in &state.peering_connections {
            let status = if connection.is_accepted {
                "accepted".green()
            } else {
                "pending".yellow()
            };
            out.push_str(&format!(
                "  {} {} -> {} ({})\n",
                connection.connection_id, connection.requester, connection.accepter, status
            ));
        }
    }

    if !state.resolver_rule_associations.is_empty() {
        out.push_str(&format!("\n{}\n", "Resolver rules:".cyan().bold()));
        for association in &state.resolver_rule_associations {
            out.push_str(&format!(
                "  {} ({})\n",
                association.resolver_rule_id, association.association_id
            ));
        }
    }

    out
}
