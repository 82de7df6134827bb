use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use capd::cli::{
    format_pool_report, lb_create, lb_delete, lb_ip, lb_update, parse_weights, pool_delete,
    pool_reconcile, pool_status, resolve_state_path, Cli, Commands, LbAction, PoolAction,
    PoolArgs,
};
use capd::config::{load_manifest, Manifest};
use capd::runtime::{ContainerDriver, DockerDriver, ImageResolver, KindImageResolver};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        process::exit(1);
    }
}

fn load(path: &std::path::Path) -> anyhow::Result<Manifest> {
    let manifest = load_manifest(path)
        .map_err(|e| anyhow::anyhow!("Failed to load manifest {}: {}", path.display(), e))?;
    debug!("Loaded manifest for cluster {}", manifest.cluster.name);
    Ok(manifest)
}

fn pool_args(action: &PoolAction) -> &PoolArgs {
    match action {
        PoolAction::Reconcile(args) | PoolAction::Delete(args) | PoolAction::Status(args) => args,
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let driver: Arc<dyn ContainerDriver> = Arc::new(
        DockerDriver::new()
            .with_binary(&cli.docker)
            .with_network(&cli.network),
    );
    let resolver: Arc<dyn ImageResolver> = Arc::new(KindImageResolver);

    match cli.command {
        Commands::Pool { action } => {
            let args = pool_args(&action);
            let manifest = load(&args.manifest)?;
            let state = resolve_state_path(args.state.as_deref(), &manifest)?;
            debug!("Using state file {}", state.display());

            match action {
                PoolAction::Reconcile(_) => {
                    let report = pool_reconcile(driver, resolver, &manifest, &state).await?;
                    print!("{}", format_pool_report(&report));
                }
                PoolAction::Delete(_) => {
                    pool_delete(driver, resolver, &manifest, &state).await?;
                    println!("Node pool deleted");
                }
                PoolAction::Status(_) => {
                    let report = pool_status(driver, resolver, &manifest, &state).await?;
                    print!("{}", format_pool_report(&report));
                }
            }
        }
        Commands::Lb { action } => match action {
            LbAction::Create(args) => {
                let manifest = load(&args.manifest)?;
                let name = lb_create(driver, &manifest).await?;
                println!("Load balancer {} ready", name);
            }
            LbAction::Update(args) => {
                let weights = parse_weights(&args.weights)?;
                let manifest = load(&args.target.manifest)?;
                lb_update(driver, &manifest, &weights).await?;
                println!("Load balancer configuration updated");
            }
            LbAction::Ip(args) => {
                let manifest = load(&args.manifest)?;
                println!("{}", lb_ip(driver, &manifest).await?);
            }
            LbAction::Delete(args) => {
                let manifest = load(&args.manifest)?;
                lb_delete(driver, &manifest).await?;
                println!("Load balancer deleted");
            }
        },
    }

    Ok(())
}
