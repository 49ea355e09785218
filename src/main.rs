use std::io::Write;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chain_ledger::config::LedgerConfig;
use chain_ledger::ledger::canonical::parse_state;
use chain_ledger::ledger::{
    load_export_file, scope::scope_for, verify_entries, Actor, AppendRequest, ChainLedger,
    ChainVerificationResult, Partition, ScopeId, Target,
};

#[derive(Parser)]
#[command(name = "chain-ledger")]
#[command(version, about = "Tamper-evident hash-chained ledger")]
struct Cli {
    /// Config file (defaults to chain-ledger.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured database URL
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and apply migrations
    Init,
    /// Register a scope owner (required under the `registered` policy)
    RegisterScope {
        #[command(flatten)]
        scope: ScopeArgs,

        /// Kind of owner, e.g. organization
        #[arg(long, default_value = "organization")]
        owner_kind: String,
    },
    /// Append one entry to a scope
    Append {
        #[command(flatten)]
        scope: ScopeArgs,

        /// Dotted action name, e.g. ledger_entry.create
        #[arg(short, long)]
        action: String,

        #[arg(long)]
        actor: Option<String>,

        #[arg(long)]
        role: Option<String>,

        #[arg(long)]
        target_type: Option<String>,

        #[arg(long, requires = "target_type")]
        target_id: Option<String>,

        /// State before the change, as JSON
        #[arg(long)]
        before: Option<String>,

        /// State after the change, as JSON
        #[arg(long)]
        after: Option<String>,
    },
    /// Verify a scope's chain
    Verify {
        #[command(flatten)]
        scope: ScopeArgs,

        /// Verify every scope that holds entries
        #[arg(long, conflicts_with_all = ["scope", "partition"])]
        all: bool,

        /// Resume from the newest checkpoint
        #[arg(long)]
        resumed: bool,

        #[arg(long, requires = "target_id")]
        target_type: Option<String>,

        #[arg(long, requires = "target_type")]
        target_id: Option<String>,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Export a target trail, or a whole scope, as JSON Lines
    Export {
        #[command(flatten)]
        scope: ScopeArgs,

        #[arg(long, requires = "target_id")]
        target_type: Option<String>,

        #[arg(long, requires = "target_type")]
        target_id: Option<String>,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Verify and record a checkpoint when due
    Checkpoint {
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Verify a full-scope export file offline
    VerifyFile {
        /// JSON Lines export
        #[arg(short, long)]
        path: PathBuf,

        /// Scope the file is expected to hold
        #[arg(short, long)]
        scope: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum PartitionArg {
    Audit,
    Shares,
    Close,
}

impl From<PartitionArg> for Partition {
    fn from(arg: PartitionArg) -> Self {
        match arg {
            PartitionArg::Audit => Partition::AuditTrail,
            PartitionArg::Shares => Partition::ShareLedger,
            PartitionArg::Close => Partition::ClosePeriod,
        }
    }
}

#[derive(Args)]
struct ScopeArgs {
    /// Literal scope id
    #[arg(short, long)]
    scope: Option<String>,

    /// Partition to derive the scope from, together with --owner
    #[arg(long, requires = "owner")]
    partition: Option<PartitionArg>,

    #[arg(long, requires = "partition")]
    owner: Option<String>,
}

fn resolve_scope(
    scope: Option<&str>,
    partition: Option<PartitionArg>,
    owner: Option<&str>,
) -> Result<ScopeId> {
    match (scope, partition, owner) {
        (Some(scope), _, _) => Ok(ScopeId::new(scope)?),
        (None, Some(partition), Some(owner)) => Ok(scope_for(partition.into(), owner)?),
        _ => Err(anyhow!("either --scope or --partition with --owner is required")),
    }
}

impl ScopeArgs {
    fn is_given(&self) -> bool {
        self.scope.is_some() || self.partition.is_some()
    }

    fn resolve(&self) -> Result<ScopeId> {
        resolve_scope(self.scope.as_deref(), self.partition, self.owner.as_deref())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let mut config = match &cli.config {
        Some(path) => LedgerConfig::load_from(path, true),
        None => LedgerConfig::load(),
    }
    .context("Failed to load configuration")?;
    if let Some(url) = &cli.database_url {
        config.database_url = url.clone();
    }

    // Ctrl-C stops long verification and export runs between pages
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping");
            signal_token.cancel();
        }
    });

    if let Err(e) = run(cli.command, &config, &cancel).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn init_tracing(verbose: bool, quiet: bool) {
    let default_filter = if quiet {
        "chain_ledger=error"
    } else if verbose {
        "chain_ledger=debug"
    } else {
        "chain_ledger=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run(command: Commands, config: &LedgerConfig, cancel: &CancellationToken) -> Result<()> {
    match command {
        Commands::VerifyFile { path, scope } => verify_file(&path, &scope),
        command => {
            let ledger = ChainLedger::open(config).await?;
            let outcome = dispatch(command, &ledger, cancel).await;
            ledger.close().await;
            outcome
        }
    }
}

async fn dispatch(command: Commands, ledger: &ChainLedger, cancel: &CancellationToken) -> Result<()> {
    match command {
        Commands::Init => {
            println!("✓ Ledger database ready");
        }
        Commands::RegisterScope { scope, owner_kind } => {
            let scope = scope.resolve()?;
            if ledger.register_scope(&scope, &owner_kind).await? {
                println!("✓ Registered scope {}", scope);
            } else {
                println!("Scope {} was already registered", scope);
            }
        }
        Commands::Append {
            scope,
            action,
            actor,
            role,
            target_type,
            target_id,
            before,
            after,
        } => {
            let mut request = AppendRequest::new(scope.resolve()?, action);
            if let Some(actor_id) = actor {
                let mut actor = Actor::new(actor_id);
                if let Some(role) = role {
                    actor = actor.with_role(role);
                }
                request = request.actor(actor);
            } else if role.is_some() {
                bail!("--role requires --actor");
            }
            if let Some(target_type) = target_type {
                request = request.target(match target_id {
                    Some(id) => Target::new(target_type, id),
                    None => Target::of_type(target_type),
                });
            }
            if let Some(text) = before {
                request = request.before(parse_state(&text)?);
            }
            if let Some(text) = after {
                request = request.after(parse_state(&text)?);
            }

            let receipt = ledger.append(&request).await?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
        }
        Commands::Verify {
            scope,
            all,
            resumed,
            target_type,
            target_id,
            json,
        } => {
            let results = if all {
                ledger.verify_all(cancel).await?
            } else {
                if !scope.is_given() {
                    bail!("--scope, --partition/--owner or --all is required");
                }
                let scope = scope.resolve()?;
                let result = match (target_type, target_id) {
                    (Some(tt), Some(tid)) => {
                        ledger
                            .verify_for_target(scope.as_str(), &tt, &tid, cancel)
                            .await?
                    }
                    _ if resumed => ledger.verify_resumed(scope.as_str(), cancel).await?,
                    _ => ledger.verify(scope.as_str(), cancel).await?,
                };
                vec![result]
            };
            report(&results, json)?;
        }
        Commands::Export {
            scope,
            target_type,
            target_id,
            output,
        } => {
            let scope = scope.resolve()?;
            let bytes = match (target_type, target_id) {
                (Some(tt), Some(tid)) => {
                    ledger
                        .export_trail(scope.as_str(), &tt, &tid, cancel)
                        .await?
                }
                _ => ledger.export_scope(scope.as_str(), cancel).await?,
            };
            match output {
                Some(path) => {
                    std::fs::write(&path, &bytes)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    info!("Wrote {} bytes to {}", bytes.len(), path.display());
                }
                None => std::io::stdout().write_all(&bytes)?,
            }
        }
        Commands::Checkpoint { scope } => {
            let scope = scope.resolve()?;
            let outcome = ledger.verify_and_checkpoint(scope.as_str(), cancel).await?;
            println!("{}", outcome.result.summary());
            match outcome.checkpoint {
                Some(seq) => println!("✓ Checkpoint recorded at #{}", seq),
                None if outcome.result.valid => println!("No checkpoint due"),
                None => bail!("chain is broken, no checkpoint recorded"),
            }
        }
        Commands::VerifyFile { path, scope } => verify_file(&path, &scope)?,
    }
    Ok(())
}

fn verify_file(path: &std::path::Path, scope: &str) -> Result<()> {
    if !path.exists() {
        bail!("Export file not found: {}", path.display());
    }
    let entries = load_export_file(path)?;
    let result = verify_entries(scope, &entries);
    report(std::slice::from_ref(&result), false)
}

fn report(results: &[ChainVerificationResult], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(results)?);
    } else {
        for result in results {
            println!("{}", result.summary());
        }
    }

    let broken = results.iter().filter(|r| !r.valid).count();
    if broken > 0 {
        bail!("{} of {} scope(s) failed verification", broken, results.len());
    }
    Ok(())
}
