use clap::Parser;
use portkey_federation::{FederationGateway, GatewayConfig, SdlComposer};
use std::{error::Error, path::PathBuf};
use tracing_subscriber::EnvFilter;

/// Bootstraps the federation core against the configured subgraphs and prints
/// which service owns each type and how every crossing field is delegated.
#[derive(Debug, Parser)]
#[command(name = "portkey-federation", version, about)]
struct Args {
    /// Gateway configuration file.
    #[arg(long, default_value = "gateway.yaml")]
    config: PathBuf,

    /// Overrides `bootstrapConcurrency` from the configuration file.
    #[arg(long)]
    concurrency: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = GatewayConfig::from_file(&args.config)?;
    if let Some(concurrency) = args.concurrency {
        config.bootstrap_concurrency = concurrency;
        config.validate()?;
    }

    let gateway = FederationGateway::bootstrap(config, &SdlComposer).await?;

    println!("Type ownership:");
    for (type_name, service) in gateway.index().owned_types() {
        println!("  {type_name:<30} {service}");
    }

    println!("Delegated fields:");
    for wired in gateway.wiring() {
        println!(
            "  {:<30} {:<16} -> {}",
            format!("{}.{}", wired.type_name, wired.field),
            format!("{:?}", wired.delegation.kind),
            wired.delegation.service
        );
    }

    gateway.shutdown();
    Ok(())
}
